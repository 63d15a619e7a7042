//! A32 (32-bit ARM) instruction classification (spec.md §4.4).

use bitmatch::bitmatch;

use crate::element::{InstrSubtype, InstrType, Isa, InstructionInfo};

fn branch_target(addr: u64, imm24: u32) -> u64 {
    // PC = instruction address + 8 (A32 convention, spec.md §4.4),
    // offset is imm24 sign-extended and shifted left 2.
    let simm = ((imm24 << 8) as i32) >> 8;
    (addr.wrapping_add(8) as i64).wrapping_add((simm as i64) << 2) as u64
}

#[bitmatch]
pub fn classify(addr: u64, opcode: u32) -> InstructionInfo {
    let mut info = InstructionInfo {
        addr,
        opcode,
        size: 4,
        isa: Isa::A32,
        next_isa: Isa::A32,
        itype: InstrType::Other,
        subtype: InstrSubtype::None,
        branch_addr: None,
        is_conditional: false,
        is_link: false,
    };

    #[bitmatch]
    match opcode {
        "1111_101h_iiii_iiii_iiii_iiii_iiii_iiii" => {
            // BLX (immediate): unconditional, switches to T32.
            info.itype = InstrType::DirectBranch;
            info.is_link = true;
            info.next_isa = Isa::T32;
            let base = branch_target(addr, i);
            info.branch_addr = Some(base.wrapping_add(if h != 0 { 2 } else { 0 }));
        }
        "cccc_101l_iiii_iiii_iiii_iiii_iiii_iiii" => {
            // B / BL
            info.itype = InstrType::DirectBranch;
            info.is_conditional = c != 0b1110 && c != 0b1111;
            info.is_link = l != 0;
            info.branch_addr = Some(branch_target(addr, i));
        }
        "cccc_0001_0010_1111_1111_1111_00l1_mmmm" => {
            // BX / BLX (register)
            info.itype = InstrType::IndirectBranch;
            info.is_conditional = c != 0b1110 && c != 0b1111;
            info.is_link = l != 0;
            let _ = m;
        }
        "cccc_01ip_ubwl_nnnn_1111_oooo_oooo_oooo" => {
            // LDR Rd=PC (load into PC)
            if l != 0 {
                info.itype = InstrType::IndirectBranch;
                info.is_conditional = c != 0b1110 && c != 0b1111;
                info.subtype = if n == 0b1101 {
                    InstrSubtype::V7ImpliedReturn
                } else {
                    InstrSubtype::None
                };
            }
            let (_, _, _, _) = (p, u, b, w);
            let _ = o;
        }
        "cccc_100p_uswl_nnnn_1rrr_rrrr_rrrr_rrrr" => {
            // LDM with PC in the register list (bit 15 of reglist)
            if l != 0 {
                info.itype = InstrType::IndirectBranch;
                info.is_conditional = c != 0b1110 && c != 0b1111;
                info.subtype = if n == 0b1101 {
                    InstrSubtype::V7ImpliedReturn
                } else {
                    InstrSubtype::None
                };
            }
            let (_, _, _) = (p, u, s);
            let _ = w;
            let _ = r;
        }
        "cccc_00??????_????_1111_????????????" => {
            // Data-processing with Rd == PC (e.g. MOV PC, Rn; ADD PC, ...)
            info.itype = InstrType::IndirectBranch;
            info.is_conditional = c != 0b1110 && c != 0b1111;
        }
        "1111_0101_0111_1111_1111_0000_0110_1111" => {
            info.itype = InstrType::Isb;
        }
        "1111_0101_0111_1111_1111_0000_0101_oooo" => {
            info.itype = InstrType::DmbDsb;
            let _ = o;
        }
        "1111_0101_0111_1111_1111_0000_0100_oooo" => {
            info.itype = InstrType::DmbDsb;
            let _ = o;
        }
        "cccc_0011_0010_0000_1111_0000_0000_0011" => {
            info.itype = InstrType::WfiWfe;
            info.is_conditional = c != 0b1110 && c != 0b1111;
        }
        "cccc_0011_0010_0000_1111_0000_0000_0010" => {
            info.itype = InstrType::WfiWfe;
            info.is_conditional = c != 0b1110 && c != 0b1111;
        }
        "rrrr_rrrr_rrrr_rrrr_rrrr_rrrr_rrrr_rrrr" => {
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
        // cond=1110 (AL), 101, L=0, imm24=0
        let info = classify(0x1000, 0b1110_1010_0000_0000_0000_0000_0000_0000);
        assert_eq!(info.itype, InstrType::DirectBranch);
        assert!(!info.is_conditional);
        assert!(!info.is_link);
        assert_eq!(info.branch_addr, Some(0x1000u64.wrapping_add(8)));
    }

    #[test]
    fn conditional_bl_is_conditional_and_link() {
        // cond=0001 (NE), 101, L=1
        let info = classify(0x2000, 0b0001_1011_0000_0000_0000_0000_0000_0000);
        assert_eq!(info.itype, InstrType::DirectBranch);
        assert!(info.is_conditional);
        assert!(info.is_link);
    }

    #[test]
    fn bx_lr_is_indirect_branch() {
        let opcode = 0b1110_0001_0010_1111_1111_1111_0001_1110; // BX LR
        let info = classify(0x3000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
    }

    #[test]
    fn pop_pc_is_implied_return() {
        // LDM sp!, {pc}: cond=AL,100,P=0,U=1,S=0,W=1,L=1, Rn=13(1101), reglist bit15 set
        let opcode = 0b1110_1000_1011_1101_1000_0000_0000_0000;
        let info = classify(0x4000, opcode);
        assert_eq!(info.itype, InstrType::IndirectBranch);
        assert_eq!(info.subtype, InstrSubtype::V7ImpliedReturn);
    }

    #[test]
    fn isb_classified_as_barrier() {
        let info = classify(0x5000, 0xF57FF06F);
        assert_eq!(info.itype, InstrType::Isb);
    }
}
