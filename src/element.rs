//! Generic program-execution elements emitted by a packet decoder
//! (spec.md §3 "Generic Trace Element" and "Instruction Info").

use crate::memspace::MemorySpace;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Instruction-set indicator carried by address packets and instruction
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Isa {
    /// IS0: A32 (or A64 on an AArch64-only PE).
    A32,
    /// IS1: T32 (Thumb/Thumb-2).
    T32,
    A64,
}

/// Instruction classification (spec.md §4.4). No disassembly: only the
/// waypoint-relevant shape of the instruction is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InstrType {
    Other,
    DirectBranch,
    IndirectBranch,
    Isb,
    DmbDsb,
    WfiWfe,
    TStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InstrSubtype {
    None,
    BranchLink,
    /// Implied return via POP {..., pc} / LDM ..., pc (pre-v8 idiom).
    V7ImpliedReturn,
    V8Ret,
    V8Eret,
}

/// One classified instruction, as produced by the instruction decoder and
/// consumed by the code follower and the packet decoder's waypoint logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InstructionInfo {
    pub addr: u64,
    /// 32-bit opcode, zero-padded in the upper half for 16-bit T32.
    pub opcode: u32,
    /// 2 or 4.
    pub size: u8,
    pub isa: Isa,
    pub next_isa: Isa,
    pub itype: InstrType,
    pub subtype: InstrSubtype,
    /// Statically-known branch destination, if computable without a
    /// register read.
    pub branch_addr: Option<u64>,
    pub is_conditional: bool,
    pub is_link: bool,
}

impl InstructionInfo {
    /// Whether this instruction breaks sequential program flow; the
    /// code follower's default stop criterion.
    pub fn is_waypoint(&self, waypoint_barriers: bool) -> bool {
        match self.itype {
            InstrType::DirectBranch | InstrType::IndirectBranch | InstrType::TStart => true,
            InstrType::Isb | InstrType::DmbDsb | InstrType::WfiWfe => waypoint_barriers,
            InstrType::Other => false,
        }
    }

    pub fn end_addr(&self) -> u64 {
        self.addr + self.size as u64
    }
}

/// Why a trace-on element was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TraceOnReason {
    Normal,
    Overflow,
    DebugExit,
}

/// PE context at the point an element was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeContext {
    pub el: u8,
    pub is64: bool,
    pub non_secure: bool,
    pub realm: bool,
    pub ctxt_id_updated: bool,
    pub vmid_updated: bool,
    pub context_id: Option<u32>,
    pub vmid: Option<u32>,
}

/// Every element carries the trace-byte index of the packet that
/// produced it and the trace-ID of its source (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceElement {
    pub index: usize,
    pub trace_id: u8,
    pub kind: ElementKind,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ElementKind {
    NoSync,
    TraceOn {
        reason: TraceOnReason,
    },
    PeContext(PeContext),
    InstructionRange {
        start: u64,
        end: u64,
        num_instr: u32,
        isa: Isa,
        last_instr: InstructionInfo,
        executed: bool,
    },
    /// A Q-element collapse where the intervening instructions could not
    /// be walked (no binary access / count only).
    InstrRangeNoPath {
        start: u64,
        num_instr: u32,
    },
    Exception {
        number: u16,
        preferred_return: u64,
    },
    ExceptionReturn,
    Timestamp {
        value: u64,
        new_bits: u8,
    },
    CycleCount {
        value: u32,
    },
    AddressNotAccessible {
        addr: u64,
        space: MemorySpace,
    },
    Event {
        number: u8,
    },
    SyncMarker,
    MemoryTransaction {
        start: bool,
        success: bool,
    },
    Instrumentation {
        payload: Vec<u8>,
    },
    EoTrace,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(itype: InstrType) -> InstructionInfo {
        InstructionInfo {
            addr: 0,
            opcode: 0,
            size: 4,
            isa: Isa::A32,
            next_isa: Isa::A32,
            itype,
            subtype: InstrSubtype::None,
            branch_addr: None,
            is_conditional: false,
            is_link: false,
        }
    }

    #[test]
    fn direct_branch_is_always_a_waypoint() {
        assert!(instr(InstrType::DirectBranch).is_waypoint(false));
        assert!(instr(InstrType::DirectBranch).is_waypoint(true));
    }

    #[test]
    fn barriers_are_waypoints_only_when_configured() {
        let isb = instr(InstrType::Isb);
        assert!(!isb.is_waypoint(false));
        assert!(isb.is_waypoint(true));
    }

    #[test]
    fn end_addr_respects_size() {
        let mut i = instr(InstrType::Other);
        i.addr = 0x1000;
        i.size = 2;
        assert_eq!(i.end_addr(), 0x1002);
    }
}
