//! T32 (Thumb/Thumb-2) instruction classification (spec.md §4.4).
//!
//! Thumb opcodes arrive with halves already swapped so the first
//! halfword occupies the upper 16 bits of `opcode`; the leading
//! halfword's top 5 bits select 16-bit vs 32-bit encoding.

use bitmatch::bitmatch;

use crate::element::{InstrSubtype, InstrType, Isa, InstructionInfo};

fn is_32bit(h1: u16) -> bool {
    matches!(h1 >> 11, 0b11101 | 0b11110 | 0b11111)
}

/// Detects a 16-bit IT instruction (`1011_1111_cccc_mmmm`, `mmmm != 0`;
/// `mmmm == 0` is the hint-space NOP/WFI/WFE encoding instead) and returns
/// how many following instructions it marks conditional, per the standard
/// ARM IT-mask decode: the position of the lowest set bit in the 4-bit
/// mask counts down the block length (spec.md §4.4 "IT blocks").
pub fn it_block_len(opcode: u32) -> Option<u8> {
    let h1 = (opcode >> 16) as u16;
    if h1 >> 8 != 0b1011_1111 {
        return None;
    }
    let mask = (h1 & 0x0f) as u8;
    if mask == 0 {
        return None;
    }
    Some(if mask & 0b0001 != 0 {
        4
    } else if mask & 0b0010 != 0 {
        3
    } else if mask & 0b0100 != 0 {
        2
    } else {
        1
    })
}

fn sign_extend(value: u32, bits: u8) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// BL/BLX(immediate) 25-bit offset, per the T1 encoding's J1/J2-vs-S
/// XNOR convention (ARMv7-M Architecture Reference Manual A7.7.18).
fn bl_offset(s: u32, j1: u32, j2: u32, imm10: u32, imm11: u32) -> i64 {
    let i1 = 1 - (j1 ^ s);
    let i2 = 1 - (j2 ^ s);
    let off = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1);
    sign_extend(off, 25) as i64
}

#[bitmatch]
pub fn classify(addr: u64, opcode: u32) -> InstructionInfo {
    let h1 = (opcode >> 16) as u16;
    let size: u8 = if is_32bit(h1) { 4 } else { 2 };

    let mut info = InstructionInfo {
        addr,
        opcode,
        size,
        isa: Isa::T32,
        next_isa: Isa::T32,
        itype: InstrType::Other,
        subtype: InstrSubtype::None,
        branch_addr: None,
        is_conditional: false,
        is_link: false,
    };

    if size == 2 {
        classify_16(h1, addr, &mut info);
    } else {
        classify_32(opcode, addr, &mut info);
    }
    info
}

#[bitmatch]
fn classify_16(h1: u16, addr: u64, info: &mut InstructionInfo) {
    #[bitmatch]
    match h1 {
        "1101_cccc_iiiiiiii" => {
            // B<c> (T1): conditional 16-bit branch. 1110/1111 are
            // reserved for UDF/SVC, not a branch.
            if c != 0b1110 && c != 0b1111 {
                info.itype = InstrType::DirectBranch;
                info.is_conditional = true;
                let simm = sign_extend(i, 8) as i64;
                info.branch_addr =
                    Some((addr.wrapping_add(4) as i64).wrapping_add(simm << 1) as u64);
            }
        }
        "11100_iiiiiiiiiii" => {
            // B (T2): unconditional 16-bit branch.
            info.itype = InstrType::DirectBranch;
            let simm = sign_extend(i, 11) as i64;
            info.branch_addr = Some((addr.wrapping_add(4) as i64).wrapping_add(simm << 1) as u64);
        }
        "0100_0111_l_mmmm_000" => {
            // BX / BLX (register), T1.
            info.itype = InstrType::IndirectBranch;
            info.is_link = l != 0;
            info.next_isa = if m == 15 { Isa::A32 } else { Isa::T32 };
            let _ = m;
        }
        "1011_o_0_i_1_iiiii_nnn" => {
            // CBZ (o=0) / CBNZ (o=1): conditionally taken, but the
            // taken target is a direct, statically-known branch.
            info.itype = InstrType::DirectBranch;
            info.is_conditional = true;
            let offset = ((i >> 5) << 6) | ((i & 0x1f) << 1);
            info.branch_addr = Some(addr.wrapping_add(4).wrapping_add(offset as u64));
            let _ = o;
            let _ = n;
        }
        "1011_110_p_rrrrrrrr" => {
            // POP {..., pc} when P=1.
            if p != 0 {
                info.itype = InstrType::IndirectBranch;
                info.subtype = InstrSubtype::V7ImpliedReturn;
            }
            let _ = r;
        }
        "1011_1111_oooo_0000" => {
            // Hints (NOP/WFI/WFE/...), distinguished from IT by mask=0.
            match o {
                0b0010 => info.itype = InstrType::WfiWfe,
                0b0011 => info.itype = InstrType::WfiWfe,
                _ => {}
            }
        }
        "rrrrrrrrrrrrrrrr" => {
            let _ = r;
        }
    }
}

#[bitmatch]
fn classify_32(opcode: u32, addr: u64, info: &mut InstructionInfo) {
    #[bitmatch]
    match opcode {
        "1111_0s_cccc_iiiiii_10j0k_mmmmmmmmmmm" => {
            // B<c>.W (T3) / B.W (T4): the cond field doubles as the top
            // bits of imm10 when it holds a reserved condition (1110/1111),
            // which is how the unconditional 32-bit form is encoded.
            if c == 0b1110 || c == 0b1111 {
                info.itype = InstrType::DirectBranch;
                let imm10 = (c << 6) | i;
                let off = bl_offset(s, j, k, imm10, m);
                info.branch_addr = Some((addr.wrapping_add(4) as i64).wrapping_add(off) as u64);
            } else {
                info.itype = InstrType::DirectBranch;
                info.is_conditional = true;
                let off20 = (s << 19) | (j << 18) | (k << 17) | (i << 11) | m;
                let simm = sign_extend(off20, 20) as i64;
                info.branch_addr =
                    Some((addr.wrapping_add(4) as i64).wrapping_add(simm << 1) as u64);
            }
        }
        "1111_0s_iiiiiiiiii_11j1k_iiiiiiiiiii" => {
            // BL (T1): unconditional 32-bit branch with link.
            info.itype = InstrType::DirectBranch;
            info.is_link = true;
            let off = bl_offset(s, j, k, i >> 11, i & 0x7ff);
            info.branch_addr = Some((addr.wrapping_add(4) as i64).wrapping_add(off) as u64);
        }
        "1111_0s_iiiiiiiiii_11j0k_iiiiiiiiii_0" => {
            // BLX (immediate), T2: switches to A32, target word-aligned.
            info.itype = InstrType::DirectBranch;
            info.is_link = true;
            info.next_isa = Isa::A32;
            let off = bl_offset(s, j, k, i >> 10, (i & 0x3ff) << 1);
            let base = addr.wrapping_add(4) & !0b11;
            info.branch_addr = Some((base as i64).wrapping_add(off) as u64);
        }
        "1110_1000_1101_nnnn_1111_0000_000h_mmmm" => {
            // TBB (h=0) / TBH (h=1): table branch, target data-dependent.
            info.itype = InstrType::IndirectBranch;
            let _ = n;
            let _ = m;
            let _ = h;
        }
        "1111_0011_1011_1111_1000_1111_0100_oooo" => {
            info.itype = InstrType::DmbDsb;
            let _ = o;
        }
        "1111_0011_1011_1111_1000_1111_0101_oooo" => {
            info.itype = InstrType::Isb;
            let _ = o;
        }
        "1111_0011_1011_1111_1000_1111_0010_oooo" => {
            // WFI / WFE hints issued in the 32-bit MSR/hint space.
            info.itype = InstrType::WfiWfe;
            let _ = o;
        }
        "rrrrrrrrrrrrrrrrrrrrrrrrrrrrrrrr" => {
            let _ = r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumb2_prefix_is_detected_as_32_bit() {
        // BL: first halfword 0xF000, second 0xF800 -> 32-bit encoding.
        let opcode: u32 = 0xF000_F800;
        let info = classify(0x1000, opcode);
        assert_eq!(info.size, 4);
    }

    #[test]
    fn plain_16bit_opcode_stays_16_bit() {
        let opcode: u32 = (0x4770u32) << 16; // BX LR
        let info = classify(0x2000, opcode);
        assert_eq!(info.size, 2);
    }

    #[test]
    fn conditional_branch_t1_is_conditional_direct_branch() {
        // cond=0001 (NE), imm8=0
        let opcode: u32 = (0b1101_0001_0000_0000u32) << 16;
        let info = classify(0x3000, opcode);
        assert_eq!(info.itype, InstrType::DirectBranch);
        assert!(info.is_conditional);
    }

    #[test]
    fn bx_lr_is_indirect_branch_and_stays_thumb() {
        let opcode: u32 = (0b0100_0111_0_1110_000u32) << 16;
        let info = classify(0x4000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
        assert_eq!(info.next_isa, Isa::T32);
    }

    #[test]
    fn pop_pc_is_implied_return() {
        let opcode: u32 = (0b1011_110_1_00000001u32) << 16;
        let info = classify(0x5000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
        assert_eq!(info.subtype, InstrSubtype::V7ImpliedReturn);
    }

    #[test]
    fn it_with_mask_1_covers_four_instructions() {
        // IT EQ (firstcond=0000), mask=0001 -> 4-instruction block.
        let opcode: u32 = (0b1011_1111_0000_0001u32) << 16;
        assert_eq!(it_block_len(opcode), Some(4));
    }

    #[test]
    fn it_with_mask_1000_covers_one_instruction() {
        let opcode: u32 = (0b1011_1111_0000_1000u32) << 16;
        assert_eq!(it_block_len(opcode), Some(1));
    }

    #[test]
    fn hint_encoding_mask_zero_is_not_an_it() {
        // WFE: firstcond bits reused as the hint selector, mask=0000.
        let opcode: u32 = (0b1011_1111_0011_0000u32) << 16;
        assert_eq!(it_block_len(opcode), None);
    }

    #[test]
    fn tbh_is_indirect_branch() {
        let opcode: u32 = 0b1110_1000_1101_0001_1111_0000_0001_0010;
        let info = classify(0x6000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
    }
}
