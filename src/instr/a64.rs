//! A64 (AArch64) instruction classification (spec.md §4.4).
//!
//! A64 PC-relative arithmetic uses a +0 offset convention (spec.md
//! §4.4): the instruction's own address is the base, unlike A32's +8
//! and T32's +4. System-instruction encodings (barriers, WFI/WFE,
//! TSTART) are matched by literal opcode rather than `bitmatch` fields
//! since their only variable bits (CRm/Rt) are low-order and narrow
//! enough for a contiguous range pattern.

use bitmatch::bitmatch;

use crate::element::{InstrSubtype, InstrType, Isa, InstructionInfo};

fn sign_extend(value: u32, bits: u8) -> i64 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as i64
}

const WFI: u32 = 0xD503_203F;
const WFE: u32 = 0xD503_205F;
const WFET_BASE: u32 = 0xD503_0020; // low 3 bits select Rd-independent WFET/WFIT op2
const ISB_BASE: u32 = 0xD503_30DF; // CRm nibble varies; low nibble masked below
const DMB_BASE: u32 = 0xD503_30BF;
const DSB_BASE: u32 = 0xD503_309F;
const TSTART_BASE: u32 = 0xD523_3060; // low 5 bits select Rd

#[bitmatch]
pub fn classify(addr: u64, opcode: u32) -> InstructionInfo {
    let mut info = InstructionInfo {
        addr,
        opcode,
        size: 4,
        isa: Isa::A64,
        next_isa: Isa::A64,
        itype: InstrType::Other,
        subtype: InstrSubtype::None,
        branch_addr: None,
        is_conditional: false,
        is_link: false,
    };

    // Top 16 bits all zero is never a valid A64 instruction.
    if opcode >> 16 == 0 {
        return info;
    }

    if opcode == WFI || opcode == WFE {
        info.itype = InstrType::WfiWfe;
        return info;
    }
    if opcode & 0xFFFF_FFF8 == WFET_BASE {
        info.itype = InstrType::WfiWfe;
        return info;
    }
    if opcode & 0xFFFF_FFF0 == ISB_BASE & 0xFFFF_FFF0 {
        info.itype = InstrType::Isb;
        return info;
    }
    if opcode & 0xFFFF_FF00 == DMB_BASE & 0xFFFF_FF00
        || opcode & 0xFFFF_FF00 == DSB_BASE & 0xFFFF_FF00
    {
        info.itype = InstrType::DmbDsb;
        return info;
    }
    if opcode & 0xFFFF_FFE0 == TSTART_BASE {
        info.itype = InstrType::TStart;
        return info;
    }

    #[bitmatch]
    match opcode {
        "l00101_iiiiiiiiiiiiiiiiiiiiiiiiii" => {
            // B (l=0) / BL (l=1): unconditional direct branch, imm26.
            info.itype = InstrType::DirectBranch;
            info.is_link = l != 0;
            let off = sign_extend(i, 26) << 2;
            info.branch_addr = Some((addr as i64).wrapping_add(off) as u64);
        }
        "0101010_0_iiiiiiiiiiiiiiiiiii_0_cccc" => {
            // B.cond: conditional direct branch, imm19.
            info.itype = InstrType::DirectBranch;
            info.is_conditional = true;
            let off = sign_extend(i, 19) << 2;
            info.branch_addr = Some((addr as i64).wrapping_add(off) as u64);
            let _ = c;
        }
        "011010_1_0_iiiiiiiiiiiiiiiiiii_nnnnn" => {
            // CBZ/CBNZ: conditional direct branch, imm19.
            info.itype = InstrType::DirectBranch;
            info.is_conditional = true;
            let off = sign_extend(i, 19) << 2;
            info.branch_addr = Some((addr as i64).wrapping_add(off) as u64);
            let _ = n;
        }
        "h_011011_o_bbbbb_iiiiiiiiiiiiii_nnnnn" => {
            // TBZ/TBNZ: conditional direct branch, imm14. `h` is b5,
            // `bbbbb` is b40 (together the bit-position operand).
            info.itype = InstrType::DirectBranch;
            info.is_conditional = true;
            let off = sign_extend(i, 14) << 2;
            info.branch_addr = Some((addr as i64).wrapping_add(off) as u64);
            let (_, _, _) = (h, o, n);
        }
        "1101011_0_0_0_1_11111_000000_nnnnn_00000" => {
            // BR (register), unconditional indirect.
            info.itype = InstrType::IndirectBranch;
            let _ = n;
        }
        "1101011_0_0_0_1_11111_000000_nnnnn_00001" => {
            // BLR (register), unconditional indirect, link.
            info.itype = InstrType::IndirectBranch;
            info.is_link = true;
            let _ = n;
        }
        "1101011_0_0_1_0_11111_000000_11111_00000" => {
            // RET: indirect, subtype v8-ret.
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Ret;
        }
        "1101011_0_0_1_0_11111_000010_nnnnn_11111" => {
            // RET Rn: indirect return via explicit register.
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Ret;
            let _ = n;
        }
        "1101011_0_1_0_0_11111_000010_nnnnn_11111" => {
            // BRAA/BRAAZ (pointer-auth indirect branch, v8.3+).
            info.itype = InstrType::IndirectBranch;
            let _ = n;
        }
        "1101011_0_1_0_0_11111_000011_nnnnn_11111" => {
            // BLRAA/BLRAAZ (pointer-auth indirect branch+link, v8.3+).
            info.itype = InstrType::IndirectBranch;
            info.is_link = true;
            let _ = n;
        }
        "1101011_0_1_0_1_11111_000010_11111_11111" => {
            // RETAA (pointer-auth return, v8.3+, key A).
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Ret;
        }
        "1101011_0_1_0_1_11111_000011_11111_11111" => {
            // RETAB (pointer-auth return, v8.3+, key B).
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Ret;
        }
        "11010110_1001_11110000_00_nnnnn_00000" => {
            // ERET: exception return, subtype v8-eret.
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Eret;
            let _ = n;
        }
        "11010110_1001_11110000_10_11111_11111" => {
            // ERETAA (pointer-auth exception return, v8.3+).
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Eret;
        }
        "11010110_1001_11110000_11_11111_11111" => {
            // ERETAB (pointer-auth exception return, v8.3+).
            info.itype = InstrType::IndirectBranch;
            info.subtype = InstrSubtype::V8Eret;
        }
        "rrrrrrrrrrrrrrrrrrrrrrrrrrrrrrrr" => {
            let _ = r;
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconditional_b_is_direct_branch() {
        // B: op=000101, imm26=4 (>>2 of byte offset 16)
        let opcode = 0b000101_00_0000_0000_0000_0000_0000_0100u32;
        let info = classify(0x1000, opcode);
        assert_eq!(info.itype, InstrType::DirectBranch);
        assert!(!info.is_link);
        assert_eq!(info.branch_addr, Some(0x1000 + 16));
    }

    #[test]
    fn bl_is_direct_branch_with_link() {
        let opcode = 0b100101_00_0000_0000_0000_0000_0000_0001u32;
        let info = classify(0x2000, opcode);
        assert_eq!(info.itype, InstrType::DirectBranch);
        assert!(info.is_link);
        assert_eq!(info.branch_addr, Some(0x2000 + 4));
    }

    #[test]
    fn ret_is_indirect_branch_v8_ret() {
        // Matches "1101011_0_0_1_0_11111_000000_11111_00000" exactly.
        let opcode = 0b1101011_0_0_1_0_11111_000000_11111_00000u32;
        let info = classify(0x3000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
        assert_eq!(info.subtype, InstrSubtype::V8Ret);
    }

    #[test]
    fn eret_is_indirect_branch_v8_eret() {
        // Matches "11010110_1001_11110000_00_nnnnn_00000" with Rn=0.
        let opcode = 0b11010110_1001_11110000_00_00000_00000u32;
        let info = classify(0x4000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
        assert_eq!(info.subtype, InstrSubtype::V8Eret);
    }

    #[test]
    fn all_zero_top_16_bits_is_invalid_and_classified_other() {
        let info = classify(0x5000, 0x0000_1234);
        assert_eq!(info.itype, InstrType::Other);
    }

    #[test]
    fn blr_is_indirect_branch_with_link() {
        // Matches "1101011_0_0_0_1_11111_000000_nnnnn_00001" with Rn=0.
        let opcode = 0b1101011_0_0_0_1_11111_000000_00000_00001u32;
        let info = classify(0x6000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
        assert!(info.is_link);
    }

    #[test]
    fn wfi_wfe_classified_as_barrier_hint() {
        assert_eq!(classify(0x7000, WFI).itype, InstrType::WfiWfe);
        assert_eq!(classify(0x7004, WFE).itype, InstrType::WfiWfe);
    }

    #[test]
    fn tstart_classified() {
        let info = classify(0x8000, TSTART_BASE | 0x3);
        assert_eq!(info.itype, InstrType::TStart);
    }
}
