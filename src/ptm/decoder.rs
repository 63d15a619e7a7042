//! PTM Packet Decoder (spec.md §4.3): structurally identical to the
//! ETMv4/ETE decoder's state machine and return-stack handling, but
//! with no speculation stack — PTM has no commit/cancel/mispredict
//! machinery, so atoms resolve to instruction-range elements the
//! instant they arrive rather than being staged for later resolution.
//!
//! Grounded the same way as [`crate::etm4::decoder`]: this lineage's
//! own `Decoder` state-machine shape, generalized down to PTM's smaller
//! vocabulary, with `process_atom` narrowed to a single current PC/ISA
//! pair (spec.md §4.2's commit algorithm minus the stack).

use log::{info, warn};

use crate::config::PtmConfig;
use crate::element::{ElementKind, InstrType, Isa, PeContext, TraceOnReason};
use crate::follower::{CodeFollower, StopMode};
use crate::memory::Mapper;
use crate::memspace::MemorySpace;
use crate::ptm::packet::Packet;
use crate::retstack::ReturnStack;
use crate::sink::{ElementSink, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    NoSync,
    WaitIsync,
    DecodePackets,
}

pub struct PtmDecoder {
    config: Option<PtmConfig>,
    state: DecoderState,
    ret_stack: ReturnStack,

    pc: u64,
    isa: Isa,
    needs_address: bool,
    context: PeContext,
    mem_space: MemorySpace,

    trace_id: u8,
    no_sync_emitted: bool,
}

impl PtmDecoder {
    pub fn new(trace_id: u8) -> Self {
        PtmDecoder {
            config: None,
            state: DecoderState::NoSync,
            ret_stack: ReturnStack::new(),
            pc: 0,
            isa: Isa::A32,
            needs_address: true,
            context: PeContext::default(),
            mem_space: MemorySpace::NON_SECURE,
            trace_id,
            no_sync_emitted: false,
        }
    }

    pub fn set_config(&mut self, config: PtmConfig) -> Result<(), crate::error::TraceError> {
        if self.config.is_some() {
            return Err(crate::error::TraceError::AlreadyConfigured);
        }
        self.trace_id = config.trace_id;
        self.config = Some(config);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::NoSync;
        self.ret_stack.flush();
        self.needs_address = true;
        self.no_sync_emitted = false;
    }

    pub fn flush(&mut self) {}

    pub fn eot(&mut self) {}

    pub fn state(&self) -> DecoderState {
        self.state
    }

    fn resync(&mut self, index: usize, reason: &'static str) {
        warn!(
            index = index, trace_id = self.trace_id, reason = reason;
            "ptm decoder protocol error, resynchronizing"
        );
        self.reset();
    }

    pub fn packet_in(
        &mut self,
        index: usize,
        pkt: Packet,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        if self.config.is_none() {
            return Response::FatalNotInitialized;
        }
        match self.state {
            DecoderState::NoSync => self.handle_no_sync(index, pkt, sink),
            DecoderState::WaitIsync => self.handle_wait_isync(index, pkt, sink),
            DecoderState::DecodePackets => self.handle_decode(index, pkt, mapper, sink),
        }
    }

    fn handle_no_sync(
        &mut self,
        index: usize,
        pkt: Packet,
        sink: &mut impl ElementSink,
    ) -> Response {
        if !matches!(pkt, Packet::Async) {
            return Response::Continue;
        }
        let r = if !self.no_sync_emitted {
            self.no_sync_emitted = true;
            sink.trace_element_in(index, self.trace_id, ElementKind::NoSync)
        } else {
            Response::Continue
        };
        if r != Response::Continue {
            return r;
        }
        self.state = DecoderState::WaitIsync;
        Response::Continue
    }

    fn handle_wait_isync(
        &mut self,
        index: usize,
        pkt: Packet,
        sink: &mut impl ElementSink,
    ) -> Response {
        let Packet::ISync { addr, isa, non_secure } = pkt else {
            return Response::Continue;
        };
        self.pc = addr;
        self.isa = isa;
        self.needs_address = false;
        self.context = PeContext {
            non_secure,
            ..PeContext::default()
        };
        self.mem_space = if non_secure {
            MemorySpace::NON_SECURE
        } else {
            MemorySpace::SECURE
        };
        self.ret_stack.flush();

        let r = sink.trace_element_in(
            index,
            self.trace_id,
            ElementKind::TraceOn { reason: TraceOnReason::Normal },
        );
        if r != Response::Continue {
            return r;
        }
        let r = sink.trace_element_in(index, self.trace_id, ElementKind::PeContext(self.context));
        if r != Response::Continue {
            return r;
        }
        info!(index = index, trace_id = self.trace_id; "ptm decoder synchronized");
        self.state = DecoderState::DecodePackets;
        Response::Continue
    }

    fn handle_decode(
        &mut self,
        index: usize,
        pkt: Packet,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        match pkt {
            Packet::Async => Response::Continue,
            Packet::Atom { bits, count } => {
                for i in 0..count {
                    let executed = (bits >> i) & 1 != 0;
                    let r = self.process_atom(index, executed, mapper, sink);
                    if r != Response::Continue {
                        return r;
                    }
                }
                Response::Continue
            }
            Packet::ISync { addr, isa, non_secure } => {
                self.pc = addr;
                self.isa = isa;
                self.needs_address = false;
                self.context = PeContext { non_secure, ..self.context };
                self.mem_space = if non_secure {
                    MemorySpace::NON_SECURE
                } else {
                    MemorySpace::SECURE
                };
                self.ret_stack.flush();
                sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::TraceOn { reason: TraceOnReason::Overflow },
                )
            }
            // A branch-address packet commits the implicit executed atom
            // that led to it, then supplies the new PC directly (spec.md
            // §4.3).
            Packet::BranchAddress { addr, isa, exception, non_secure } => {
                if !self.needs_address {
                    let r = self.walk_to_implicit_branch(index, mapper, sink);
                    if r != Response::Continue {
                        return r;
                    }
                }
                self.pc = addr;
                self.isa = isa;
                self.needs_address = false;
                self.context.non_secure = non_secure;
                self.mem_space = if non_secure {
                    MemorySpace::NON_SECURE
                } else {
                    MemorySpace::SECURE
                };
                if exception {
                    sink.trace_element_in(
                        index,
                        self.trace_id,
                        ElementKind::Exception { number: 0, preferred_return: addr },
                    )
                } else {
                    Response::Continue
                }
            }
            // Waypoint-update supplies the post-waypoint address
            // directly; no instruction range is implied.
            Packet::WaypointUpdate { addr, isa } => {
                self.pc = addr;
                self.isa = isa;
                self.needs_address = false;
                Response::Continue
            }
            Packet::ContextId { value } => {
                self.context.context_id = value;
                self.context.ctxt_id_updated = value.is_some();
                mapper.invalidate_cache(self.trace_id);
                sink.trace_element_in(index, self.trace_id, ElementKind::PeContext(self.context))
            }
            Packet::Vmid { value } => {
                self.context.vmid = value;
                self.context.vmid_updated = value.is_some();
                mapper.invalidate_cache(self.trace_id);
                sink.trace_element_in(index, self.trace_id, ElementKind::PeContext(self.context))
            }
            Packet::Timestamp { value, new_bits } => {
                sink.trace_element_in(index, self.trace_id, ElementKind::Timestamp { value, new_bits })
            }
            Packet::Trigger => {
                sink.trace_element_in(index, self.trace_id, ElementKind::Event { number: 0 })
            }
            Packet::ExceptionReturn => {
                sink.trace_element_in(index, self.trace_id, ElementKind::ExceptionReturn)
            }
            Packet::Ignore => Response::Continue,
            Packet::ReservedHeader { header } => {
                warn!(index = index, trace_id = self.trace_id, header = header; "reserved header");
                Response::Continue
            }
            Packet::IncompleteEot => Response::Continue,
        }
    }

    /// Walks from the current PC to the next waypoint and emits the
    /// resulting range as executed, without yet updating PC — the
    /// caller (a branch-address packet) supplies the destination.
    fn walk_to_implicit_branch(
        &mut self,
        index: usize,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        let walk = CodeFollower::trace_to_waypoint(
            mapper,
            self.trace_id,
            self.mem_space,
            self.pc,
            self.isa,
            StopMode::Waypoint,
            false,
        );
        if walk.nacc {
            self.needs_address = true;
            return sink.trace_element_in(
                index,
                self.trace_id,
                ElementKind::AddressNotAccessible { addr: walk.fault_addr, space: self.mem_space },
            );
        }
        let last = walk.last_instr.expect("waypoint walk always classifies at least one instruction");
        if last.is_link {
            self.ret_stack.push(walk.end, last.isa);
        }
        sink.trace_element_in(
            index,
            self.trace_id,
            ElementKind::InstructionRange {
                start: walk.start,
                end: walk.end,
                num_instr: walk.num_instr,
                isa: self.isa,
                last_instr: last,
                executed: true,
            },
        )
    }

    /// spec.md §4.3 per-atom expansion: each atom packet's bit directly
    /// expands into an instruction-range element via the follower,
    /// without a speculation stack to stage against.
    fn process_atom(
        &mut self,
        index: usize,
        executed: bool,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        if self.needs_address {
            return Response::Continue;
        }
        if let Some(popped) = self.ret_stack.pop_if_pending() {
            match popped {
                Some((addr, isa)) => {
                    self.pc = addr;
                    self.isa = isa;
                }
                None => {
                    self.resync(index, "return stack popped while empty");
                    return Response::Continue;
                }
            }
        }

        let isa = self.isa;
        let walk = CodeFollower::trace_to_waypoint(
            mapper,
            self.trace_id,
            self.mem_space,
            self.pc,
            isa,
            StopMode::Waypoint,
            false,
        );
        if walk.nacc {
            self.needs_address = true;
            return sink.trace_element_in(
                index,
                self.trace_id,
                ElementKind::AddressNotAccessible { addr: walk.fault_addr, space: self.mem_space },
            );
        }
        let last = walk.last_instr.expect("waypoint walk always classifies at least one instruction");

        match (last.itype, executed) {
            (InstrType::DirectBranch, true) => {
                if last.is_link {
                    self.ret_stack.push(walk.end, last.isa);
                }
                match last.branch_addr {
                    Some(dest) => {
                        self.pc = dest;
                        self.isa = last.next_isa;
                    }
                    None => self.needs_address = true,
                }
            }
            (InstrType::DirectBranch, false) => {
                self.pc = walk.end;
            }
            (InstrType::IndirectBranch, true) => {
                if last.is_link {
                    self.ret_stack.push(walk.end, last.isa);
                }
                self.ret_stack.set_pop_pending();
                self.needs_address = true;
            }
            (InstrType::IndirectBranch, false) => {
                self.pc = walk.end;
            }
            _ => {
                self.pc = walk.end;
            }
        }

        sink.trace_element_in(
            index,
            self.trace_id,
            ElementKind::InstructionRange {
                start: walk.start,
                end: walk.end,
                num_instr: walk.num_instr,
                isa,
                last_instr: last,
                executed,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PtmRegisters;
    use crate::memory::BufferAccessor;
    use crate::sink::VecSink;

    fn cfg() -> PtmConfig {
        PtmConfig::from_registers(&PtmRegisters::default())
    }

    fn mapper_with(base: u64, data: Vec<u8>) -> Mapper {
        let mut m = Mapper::new();
        m.add_accessor(Box::new(BufferAccessor { base, data }), MemorySpace::ANY)
            .unwrap();
        m
    }

    /// Three Thumb NOPs then a branch-to-self (matches spec.md §8 end-to-end
    /// scenario 1: PC=0xc0018d82, T32, 3 instructions, last is a branch).
    fn thumb_three_then_branch() -> Vec<u8> {
        let mut v = vec![];
        for _ in 0..3 {
            v.extend_from_slice(&0xBF00u16.to_le_bytes());
        }
        v.extend_from_slice(&0xE7FEu16.to_le_bytes());
        v
    }

    fn sync(d: &mut PtmDecoder, sink: &mut VecSink, pc: u64) {
        d.packet_in(0, Packet::Async, &mut Mapper::new(), sink);
        d.packet_in(
            1,
            Packet::ISync { addr: pc, isa: Isa::T32, non_secure: false },
            &mut Mapper::new(),
            sink,
        );
    }

    #[test]
    fn single_atom_after_isync_emits_expected_elements() {
        let mut d = PtmDecoder::new(0);
        d.set_config(cfg()).unwrap();
        let mut mapper = mapper_with(0xc0018d82, thumb_three_then_branch());
        let mut sink = VecSink::default();

        sync(&mut d, &mut sink, 0xc0018d82);
        d.packet_in(2, Packet::Atom { bits: 1, count: 1 }, &mut mapper, &mut sink);

        let kinds: Vec<_> = sink.elements.iter().map(|e| &e.kind).collect();
        assert!(matches!(kinds[0], ElementKind::NoSync));
        assert!(matches!(kinds[1], ElementKind::TraceOn { reason: TraceOnReason::Normal }));
        assert!(matches!(kinds[2], ElementKind::PeContext(ctx) if !ctx.non_secure));
        match kinds[3] {
            ElementKind::InstructionRange { start, end, num_instr, executed, .. } => {
                assert_eq!(*start, 0xc0018d82);
                assert_eq!(*end, 0xc0018d82 + 8);
                assert_eq!(*num_instr, 4);
                assert!(*executed);
            }
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn not_executed_atom_emits_not_executed_range() {
        let mut d = PtmDecoder::new(0);
        d.set_config(cfg()).unwrap();
        let mut mapper = mapper_with(
            0x1000,
            // direct branch-to-self, never taken (atom=N).
            {
                let mut v = vec![];
                v.extend_from_slice(&0xE7FEu16.to_le_bytes());
                v
            },
        );
        let mut sink = VecSink::default();
        sync(&mut d, &mut sink, 0x1000);
        sink.elements.clear();

        d.packet_in(2, Packet::Atom { bits: 0, count: 1 }, &mut mapper, &mut sink);
        // Not-taken: sequential flow past the branch, not to its target.
        assert_eq!(d.pc, 0x1002);
        let has_range = sink
            .elements
            .iter()
            .any(|e| matches!(e.kind, ElementKind::InstructionRange { executed: false, .. }));
        assert!(has_range);
    }

    #[test]
    fn address_not_accessible_sets_needs_address() {
        let mut d = PtmDecoder::new(0);
        d.set_config(cfg()).unwrap();
        let mut mapper = Mapper::new();
        let mut sink = VecSink::default();
        sync(&mut d, &mut sink, 0xdead0000);
        sink.elements.clear();

        d.packet_in(2, Packet::Atom { bits: 1, count: 1 }, &mut mapper, &mut sink);
        assert!(sink
            .elements
            .iter()
            .any(|e| matches!(e.kind, ElementKind::AddressNotAccessible { addr: 0xdead0000, .. })));
        assert!(d.needs_address);
    }
}
