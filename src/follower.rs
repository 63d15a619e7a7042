//! Code Follower (spec.md §4.5): walks target memory one instruction at
//! a time from a starting PC, classifying each via `instr::classify`,
//! until a waypoint or a configured match address is reached.
//!
//! Grounded on the instruction-stepping shape of the sibling RISC-V
//! E-Trace decoder's tracer module
//! (`other_examples/...riscv-etrace__src-lib.rs`), adapted to this
//! spec's waypoint/address stop-mode vocabulary and this crate's
//! `Mapper` accessor instead of a closure.

use crate::element::{InstrType, Isa, InstructionInfo};
use crate::instr;
use crate::memory::Mapper;
use crate::memspace::MemorySpace;
use crate::retstack::ReturnStack;

/// Where `trace_to_waypoint` should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop at the first instruction that breaks sequential flow.
    Waypoint,
    /// Stop once the *next* instruction's address would equal `stop_address`.
    AddressExclusive(u64),
    /// Stop once the *just-decoded* instruction's address equals `stop_address`.
    AddressInclusive(u64),
}

/// Result of walking memory from a start PC to a stop criterion.
#[derive(Debug, Clone)]
pub struct FollowResult {
    pub start: u64,
    /// Exclusive end of the range walked.
    pub end: u64,
    pub num_instr: u32,
    pub next_pc: u64,
    pub next_pc_valid: bool,
    pub last_instr: Option<InstructionInfo>,
    /// ISA the *next* instruction (at `next_pc`) should be decoded with.
    pub next_isa: Isa,
    /// Set when a memory read failed; `fault_addr` names the address.
    pub nacc: bool,
    pub fault_addr: u64,
}

/// Fetches 4 bytes (always enough for A32/A64/T32; 16-bit T32
/// instructions use only the low half) and classifies via
/// `instr::classify`, pre-swapping halfwords for Thumb per spec.md §4.4.
fn fetch_and_classify(
    mapper: &mut Mapper,
    trace_id: u8,
    space: MemorySpace,
    addr: u64,
    isa: Isa,
) -> Result<InstructionInfo, u64> {
    let mut raw = [0u8; 4];
    let (n, _status) = mapper.read_target_memory(addr, trace_id, space, &mut raw);
    if n == 0 {
        return Err(addr);
    }
    let opcode = match isa {
        Isa::T32 => {
            // Thumb halfwords arrive little-endian; the classifier wants
            // the first halfword in the upper 16 bits.
            let h0 = u16::from_le_bytes([raw[0], raw[1]]);
            let h1 = u16::from_le_bytes([raw[2], raw[3]]);
            ((h0 as u32) << 16) | h1 as u32
        }
        Isa::A32 | Isa::A64 => u32::from_le_bytes(raw),
    };
    Ok(instr::classify(addr, opcode, isa))
}

pub struct CodeFollower;

impl CodeFollower {
    /// Walks memory from `(start, isa)` until `stop_mode` is satisfied
    /// or a memory read fails. Waypoint barriers (ISB/DMB/DSB/WFI/WFE)
    /// are treated as waypoints only when `waypoints_on_barriers` is set.
    pub fn trace_to_waypoint(
        mapper: &mut Mapper,
        trace_id: u8,
        space: MemorySpace,
        start: u64,
        isa: Isa,
        stop_mode: StopMode,
        waypoints_on_barriers: bool,
    ) -> FollowResult {
        let mut addr = start;
        let mut cur_isa = isa;
        let mut count: u32 = 0;
        let mut last: Option<InstructionInfo> = None;
        // T32 IT-block countdown (spec.md §4.4): an IT instruction marks
        // the next 1-4 instructions conditional. `classify` is a pure,
        // context-free function (spec.md §9 "Instruction decoder as a
        // pure function"), so the countdown is tracked here, across the
        // walk, via `instr::ItState`. Does not persist across separate
        // walk calls.
        let mut it_state = instr::ItState::new();

        loop {
            if let StopMode::AddressExclusive(stop) = stop_mode {
                if addr == stop {
                    return FollowResult {
                        start,
                        end: addr,
                        num_instr: count,
                        next_pc: addr,
                        next_pc_valid: true,
                        last_instr: last,
                        next_isa: cur_isa,
                        nacc: false,
                        fault_addr: 0,
                    };
                }
            }

            let mut info = match fetch_and_classify(mapper, trace_id, space, addr, cur_isa) {
                Ok(info) => info,
                Err(fault) => {
                    return FollowResult {
                        start,
                        end: addr,
                        num_instr: count,
                        next_pc: addr,
                        next_pc_valid: false,
                        last_instr: last,
                        next_isa: cur_isa,
                        nacc: true,
                        fault_addr: fault,
                    }
                }
            };

            let it_len = instr::it_block_len(info.opcode, cur_isa);
            if it_state.advance(it_len.is_some(), it_len.unwrap_or(0)) {
                info.is_conditional = true;
            }

            count += 1;
            let end_addr = info.end_addr();
            let next_isa = info.next_isa;
            let is_waypoint = info.is_waypoint(waypoints_on_barriers);
            last = Some(info);

            if let StopMode::AddressInclusive(stop) = stop_mode {
                if addr == stop {
                    return FollowResult {
                        start,
                        end: end_addr,
                        num_instr: count,
                        next_pc: end_addr,
                        next_pc_valid: true,
                        last_instr: last,
                        next_isa,
                        nacc: false,
                        fault_addr: 0,
                    };
                }
            }

            if matches!(stop_mode, StopMode::Waypoint) && is_waypoint {
                return FollowResult {
                    start,
                    end: end_addr,
                    num_instr: count,
                    next_pc: end_addr,
                    next_pc_valid: true,
                    last_instr: last,
                    next_isa,
                    nacc: false,
                    fault_addr: 0,
                };
            }

            addr = end_addr;
            cur_isa = next_isa;
        }
    }

    /// Decodes exactly one instruction at `start` and computes the next
    /// PC according to `atom` (E = executed/taken, N = not-executed) and
    /// the instruction's own branch semantics, consulting `ret_stack`
    /// for link-register bookkeeping.
    pub fn follow_single_atom(
        mapper: &mut Mapper,
        trace_id: u8,
        space: MemorySpace,
        start: u64,
        isa: Isa,
        executed: bool,
        ret_stack: &mut ReturnStack,
    ) -> FollowResult {
        let info = match fetch_and_classify(mapper, trace_id, space, start, isa) {
            Ok(info) => info,
            Err(fault) => {
                return FollowResult {
                    start,
                    end: start,
                    num_instr: 0,
                    next_pc: start,
                    next_pc_valid: false,
                    last_instr: None,
                    next_isa: isa,
                    nacc: true,
                    fault_addr: fault,
                }
            }
        };

        let end_addr = info.end_addr();
        let mut next_pc = end_addr;
        let mut next_isa = info.next_isa;
        let mut next_pc_valid = true;

        if executed {
            if info.is_link {
                ret_stack.push(end_addr, info.isa);
            }
            match info.itype {
                InstrType::DirectBranch => {
                    if let Some(dest) = info.branch_addr {
                        next_pc = dest;
                        next_isa = info.next_isa;
                    } else {
                        next_pc_valid = false;
                    }
                }
                InstrType::IndirectBranch => {
                    ret_stack.set_pop_pending();
                    next_pc_valid = false;
                }
                _ => {}
            }
        }

        FollowResult {
            start,
            end: end_addr,
            num_instr: 1,
            next_pc,
            next_pc_valid,
            last_instr: Some(info),
            next_isa,
            nacc: false,
            fault_addr: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferAccessor;

    fn mapper_with(base: u64, data: Vec<u8>) -> Mapper {
        let mut m = Mapper::new();
        m.add_accessor(Box::new(BufferAccessor { base, data }), MemorySpace::ANY)
            .unwrap();
        m
    }

    /// Three Thumb NOPs (0xBF00, halfword LE bytes 00 BF) then a B
    /// (unconditional, T2 16-bit, opcode 0xE7FE = infinite loop to self).
    fn thumb_three_then_branch() -> Vec<u8> {
        let mut v = vec![];
        for _ in 0..3 {
            v.extend_from_slice(&0xBF00u16.to_le_bytes());
        }
        v.extend_from_slice(&0xE7FEu16.to_le_bytes());
        v
    }

    #[test]
    fn walks_until_waypoint_found() {
        let mut mapper = mapper_with(0xc0018d82, thumb_three_then_branch());
        let res = CodeFollower::trace_to_waypoint(
            &mut mapper,
            0,
            MemorySpace::ANY,
            0xc0018d82,
            Isa::T32,
            StopMode::Waypoint,
            false,
        );
        assert_eq!(res.num_instr, 4);
        assert_eq!(res.start, 0xc0018d82);
        assert_eq!(res.end, 0xc0018d82 + 8);
        assert!(!res.nacc);
    }

    #[test]
    fn memory_fault_reports_fault_address() {
        let mut mapper = Mapper::new();
        let res = CodeFollower::trace_to_waypoint(
            &mut mapper,
            0,
            MemorySpace::ANY,
            0xdead0000,
            Isa::A32,
            StopMode::Waypoint,
            false,
        );
        assert!(res.nacc);
        assert_eq!(res.fault_addr, 0xdead0000);
    }

    #[test]
    fn it_block_marks_subsequent_instructions_conditional() {
        // IT EQ, mask=1000 (one instruction), then a NOP, then a B.
        let mut v = vec![];
        v.extend_from_slice(&0xBF08u16.to_le_bytes()); // IT EQ
        v.extend_from_slice(&0xBF00u16.to_le_bytes()); // NOP, now conditional
        v.extend_from_slice(&0xE7FEu16.to_le_bytes()); // B (waypoint)
        let mut mapper = mapper_with(0x1000, v);
        let res = CodeFollower::trace_to_waypoint(
            &mut mapper,
            0,
            MemorySpace::ANY,
            0x1000,
            Isa::T32,
            StopMode::Waypoint,
            false,
        );
        assert_eq!(res.num_instr, 3);
        // The waypoint (B) is unconditional and outside the one-instruction
        // IT block, so the reported last_instr shouldn't carry it.
        assert!(!res.last_instr.unwrap().is_conditional);

        // The NOP immediately after IT, by contrast, is inside the block.
        let mut mapper = mapper_with(0x1000, {
            let mut v = vec![];
            v.extend_from_slice(&0xBF08u16.to_le_bytes());
            v.extend_from_slice(&0xBF00u16.to_le_bytes());
            v
        });
        let res = CodeFollower::trace_to_waypoint(
            &mut mapper,
            0,
            MemorySpace::ANY,
            0x1000,
            Isa::T32,
            StopMode::AddressInclusive(0x1002),
            false,
        );
        assert!(res.last_instr.unwrap().is_conditional);
    }

    #[test]
    fn address_exclusive_stops_before_reaching_stop_address() {
        let mut mapper = mapper_with(0x1000, thumb_three_then_branch());
        let res = CodeFollower::trace_to_waypoint(
            &mut mapper,
            0,
            MemorySpace::ANY,
            0x1000,
            Isa::T32,
            StopMode::AddressExclusive(0x1004),
            false,
        );
        assert_eq!(res.num_instr, 2);
        assert_eq!(res.end, 0x1004);
    }
}
