//! ETMv4/ETE Packet Decoder (spec.md §4.2): maintains PC/context state
//! and the speculation stack across the incoming packet stream,
//! producing instruction-range and other generic trace elements.
//!
//! Grounded on this lineage's own `Decoder` state-machine shape
//! (`examples/rust-embedded-itm/src/lib.rs`), generalized from ITM's
//! flat packet-to-element mapping to ETMv4/ETE's speculation-stack
//! commit/cancel/mispredict/discard machinery (spec.md §3, §4.2), with
//! `process_atom`/`process_exception`/`process_source_address` grounded
//! on the sibling RISC-V E-Trace decoder's instruction-stepping loop
//! (`other_examples/...riscv-etrace__src-lib.rs`).

use log::{info, trace, warn};

use crate::config::Config;
use crate::element::{
    ElementKind, InstrSubtype, InstrType, Isa, PeContext, TraceOnReason,
};
use crate::etm4::packet::Packet;
use crate::etm4::stack::{is_p0, ElemRes, SpeculationStack, StackElement};
use crate::follower::{CodeFollower, StopMode};
use crate::memory::Mapper;
use crate::memspace::{ExceptionLevel, MemorySpace, SecurityState};
use crate::retstack::ReturnStack;
use crate::sink::{ElementSink, Response};

/// Decoder runtime state (spec.md §3 "Decoder runtime state", §4.2
/// state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    NoSync,
    WaitIsync,
    DecodePackets,
    ResolveElements,
}

/// What the synchronizing sequence (trace-info + address-with-context)
/// has seen so far, while in `WaitIsync`.
#[derive(Debug, Clone, Default)]
struct SyncProgress {
    trace_info_seen: bool,
    initial_spec_depth: u8,
}

pub struct Etm4Decoder {
    config: Option<Config>,
    state: DecoderState,
    stack: SpeculationStack,
    elem_res: ElemRes,
    ret_stack: ReturnStack,
    sync: SyncProgress,

    pc: u64,
    isa: Isa,
    needs_address: bool,
    needs_context: bool,
    /// Set by a just-pushed Exception packet; cleared by the next
    /// Address packet, which then counts +1 towards speculation depth
    /// (spec.md §4.2 "Address (all variants)").
    element_pending_address: bool,
    context: PeContext,
    mem_space: MemorySpace,
    spec_depth: u32,

    trace_id: u8,
    no_sync_emitted: bool,

    /// Atom batches held back from the speculation stack while conditional
    /// trace mode has an outstanding `ConditionalInstr` without a paired
    /// `ConditionalResult` (spec.md §9 "conditional-trace mode"). Flushed
    /// onto the stack, in order, as each result pairs; dropped on
    /// `ConditionalFlush`, `reset()`, or discard.
    pending_conditional: Vec<StackElement>,
    conditional_outstanding: u32,
}

impl Etm4Decoder {
    pub fn new(trace_id: u8) -> Self {
        Etm4Decoder {
            config: None,
            state: DecoderState::NoSync,
            stack: SpeculationStack::new(),
            elem_res: ElemRes::default(),
            ret_stack: ReturnStack::new(),
            sync: SyncProgress::default(),
            pc: 0,
            isa: Isa::A32,
            needs_address: true,
            needs_context: true,
            element_pending_address: false,
            context: PeContext::default(),
            mem_space: MemorySpace::NON_SECURE,
            spec_depth: 0,
            trace_id,
            no_sync_emitted: false,
            pending_conditional: Vec::new(),
            conditional_outstanding: 0,
        }
    }

    pub fn set_config(&mut self, config: Config) -> Result<(), crate::error::TraceError> {
        if self.config.is_some() {
            return Err(crate::error::TraceError::AlreadyConfigured);
        }
        self.trace_id = config.trace_id;
        self.config = Some(config);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::NoSync;
        self.stack = SpeculationStack::new();
        self.elem_res = ElemRes::default();
        self.ret_stack.flush();
        self.sync = SyncProgress::default();
        self.needs_address = true;
        self.needs_context = true;
        self.element_pending_address = false;
        self.spec_depth = 0;
        self.no_sync_emitted = false;
        self.pending_conditional.clear();
        self.conditional_outstanding = 0;
    }

    pub fn flush(&mut self) {}

    pub fn eot(&mut self) {
        self.stack = SpeculationStack::new();
    }

    fn cfg(&self) -> Config {
        self.config.expect("set_config must run before packet_in")
    }

    fn resync(&mut self, index: usize, reason: &'static str) {
        warn!(
            index = index, trace_id = self.trace_id, reason = reason;
            "etm4 decoder protocol error, resynchronizing"
        );
        self.reset();
    }

    /// Consumes one packet, producing zero or more elements via `sink`.
    /// `mapper` is shared with the code follower for memory reads.
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

        // Resume any resolution left over from a prior `Wait`, before
        // accepting whatever packet arrived this time. The caller is
        // expected (sans-I/O contract, spec.md §5) to re-submit the
        // same packet until resolution drains.
        if self.elem_res.is_pending() {
            let r = self.resolve_pending(index, mapper, sink);
            if r == Response::Wait || r.is_fatal() {
                return r;
            }
        }

        match self.state {
            DecoderState::NoSync => self.handle_no_sync(index, pkt, sink),
            DecoderState::WaitIsync => self.handle_wait_isync(index, pkt, sink),
            DecoderState::DecodePackets | DecoderState::ResolveElements => {
                let r = self.handle_decode(index, pkt, mapper, sink);
                if r != Response::Continue {
                    return r;
                }
                if self.elem_res.is_pending() {
                    self.resolve_pending(index, mapper, sink)
                } else {
                    Response::Continue
                }
            }
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
        self.sync = SyncProgress::default();
        Response::Continue
    }

    fn handle_wait_isync(
        &mut self,
        index: usize,
        pkt: Packet,
        sink: &mut impl ElementSink,
    ) -> Response {
        match pkt {
            Packet::TraceInfo {
                curr_spec_depth, ..
            } => {
                self.sync.trace_info_seen = true;
                self.sync.initial_spec_depth = curr_spec_depth;
                Response::Continue
            }
            Packet::Address {
                addr,
                isa,
                context,
                ..
            } => {
                if !self.sync.trace_info_seen {
                    // I-sync address arriving before trace-info: PTM-style
                    // sync, accept it directly (ETMv4 always pairs the
                    // two, but be lenient rather than resync here).
                }
                self.pc = addr;
                self.isa = isa;
                if let Some(ctx_pkt) = context {
                    if let Packet::Context {
                        el,
                        is64,
                        non_secure,
                        realm,
                        ctxt_id_updated,
                        vmid_updated,
                        context_id,
                        vmid,
                    } = *ctx_pkt
                    {
                        self.context = PeContext {
                            el,
                            is64,
                            non_secure,
                            realm,
                            ctxt_id_updated,
                            vmid_updated,
                            context_id,
                            vmid,
                        };
                        self.mem_space = self.derive_mem_space();
                    }
                }
                self.needs_address = false;
                self.needs_context = false;
                self.ret_stack.flush();
                self.spec_depth = self.sync.initial_spec_depth as u32;

                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::TraceOn {
                        reason: TraceOnReason::Normal,
                    },
                );
                if r != Response::Continue {
                    return r;
                }
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::PeContext(self.context),
                );
                if r != Response::Continue {
                    return r;
                }
                info!(index = index, trace_id = self.trace_id; "etm4 decoder synchronized");
                self.state = DecoderState::DecodePackets;
                Response::Continue
            }
            _ => Response::Continue,
        }
    }

    fn derive_mem_space(&self) -> MemorySpace {
        let state = if self.context.realm {
            SecurityState::Realm
        } else if !self.context.non_secure {
            SecurityState::Secure
        } else {
            SecurityState::NonSecure
        };
        let el = match self.context.el {
            0 => ExceptionLevel::El0,
            1 => ExceptionLevel::El1,
            2 => ExceptionLevel::El2,
            _ => ExceptionLevel::El3,
        };
        MemorySpace::from_context(state, el)
    }

    fn bump_depth(&mut self, by: u32, index: usize) -> bool {
        self.spec_depth += by;
        if self.spec_depth > self.cfg().max_spec_depth as u32 {
            self.resync(index, "speculation depth exceeded configured max");
            return false;
        }
        true
    }

    fn handle_decode(
        &mut self,
        index: usize,
        pkt: Packet,
        _mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        trace!(index = index, trace_id = self.trace_id; "etm4 packet");
        match pkt {
            Packet::Async => Response::Continue,
            Packet::TraceInfo { .. } => {
                self.stack.push(StackElement::TraceInfo);
                Response::Continue
            }
            Packet::TraceOn => {
                self.stack.push(StackElement::TraceOn);
                Response::Continue
            }
            Packet::Atom { bits, count } => {
                let batch = StackElement::AtomBatch {
                    bits,
                    count,
                    consumed: 0,
                };
                if self.cfg().conditional_trace && self.conditional_outstanding > 0 {
                    // Held back until a ConditionalResult pairs with the
                    // ConditionalInstr that gates this atom (spec.md §9).
                    self.pending_conditional.push(batch);
                } else {
                    self.stack.push(batch);
                }
                self.bump_depth(count as u32, index);
                Response::Continue
            }
            Packet::Context {
                el,
                is64,
                non_secure,
                realm,
                ctxt_id_updated,
                vmid_updated,
                context_id,
                vmid,
            } => {
                self.stack.push(StackElement::Context(PeContext {
                    el,
                    is64,
                    non_secure,
                    realm,
                    ctxt_id_updated,
                    vmid_updated,
                    context_id,
                    vmid,
                }));
                Response::Continue
            }
            Packet::Address {
                addr,
                new_bits,
                isa,
                context,
            } => {
                if let Some(ctx_pkt) = context {
                    if let Packet::Context {
                        el,
                        is64,
                        non_secure,
                        realm,
                        ctxt_id_updated,
                        vmid_updated,
                        context_id,
                        vmid,
                    } = *ctx_pkt
                    {
                        self.stack.push(StackElement::Context(PeContext {
                            el,
                            is64,
                            non_secure,
                            realm,
                            ctxt_id_updated,
                            vmid_updated,
                            context_id,
                            vmid,
                        }));
                    }
                }
                self.stack.push(StackElement::Address { addr, new_bits, isa });
                if self.element_pending_address {
                    self.element_pending_address = false;
                    self.bump_depth(1, index);
                }
                Response::Continue
            }
            Packet::SourceAddress { addr, isa } => {
                self.stack.push(StackElement::SourceAddress { addr, isa });
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::Exception {
                number,
                branch_target,
                m_profile,
            } => {
                self.stack.push(StackElement::Exception {
                    number,
                    branch_target,
                    m_profile,
                });
                self.element_pending_address = true;
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::ExceptionPeReset => {
                self.stack.push(StackElement::Exception {
                    number: 0x00,
                    branch_target: false,
                    m_profile: self.cfg().core_profile == crate::config::CoreProfile::ProfileM,
                });
                self.element_pending_address = true;
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::ExceptionTransFail { branch_target } => {
                self.stack.push(StackElement::Exception {
                    number: 0x18,
                    branch_target,
                    m_profile: self.cfg().core_profile == crate::config::CoreProfile::ProfileM,
                });
                self.element_pending_address = true;
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::ExceptionReturn => {
                self.stack.push(StackElement::ExceptionReturn);
                let extra = if self.cfg().arch_ver < 5 { 1 } else { 0 };
                self.bump_depth(1 + extra, index);
                Response::Continue
            }
            Packet::FunctionReturn => {
                self.stack.push(StackElement::FunctionReturn);
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::Timestamp { value, new_bits } => {
                self.stack.push(StackElement::Timestamp { value, new_bits });
                Response::Continue
            }
            Packet::CycleCount { value } => {
                self.stack.push(StackElement::CycleCount { value });
                Response::Continue
            }
            Packet::Event { number } => {
                self.stack.push(StackElement::Event { number });
                Response::Continue
            }
            Packet::TsMarker => {
                self.stack.push(StackElement::SyncMarker);
                Response::Continue
            }
            Packet::Q { count, addr } => {
                self.stack.push(StackElement::QElement {
                    count,
                    has_addr: addr.is_some(),
                    addr: addr.unwrap_or(0),
                });
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::Ite => {
                self.stack.push(StackElement::Ite);
                Response::Continue
            }
            Packet::TransactionStart => {
                self.stack.push(StackElement::TransactionStart);
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::TransactionCommit => {
                self.stack.push(StackElement::TransactionCommit);
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::TransactionFail => {
                self.stack.push(StackElement::TransactionFail);
                self.bump_depth(1, index);
                Response::Continue
            }
            Packet::Commit { n } => {
                self.elem_res.p0_commit += n;
                Response::Continue
            }
            Packet::Cancel { n, mispredict } => {
                self.elem_res.p0_cancel += n;
                if mispredict {
                    self.elem_res.mispredict = true;
                }
                Response::Continue
            }
            Packet::Mispredict => {
                self.elem_res.mispredict = true;
                Response::Continue
            }
            Packet::Discard => {
                self.elem_res.discard = true;
                Response::Continue
            }
            Packet::ConditionalInstr => {
                self.conditional_outstanding += 1;
                Response::Continue
            }
            Packet::ConditionalResult => {
                if !self.pending_conditional.is_empty() {
                    let batch = self.pending_conditional.remove(0);
                    self.stack.push(batch);
                }
                self.conditional_outstanding = self.conditional_outstanding.saturating_sub(1);
                Response::Continue
            }
            Packet::ConditionalFlush => {
                self.pending_conditional.clear();
                self.conditional_outstanding = 0;
                Response::Continue
            }
            Packet::ExactAddressMatch { .. } | Packet::DataSyncMarker | Packet::Ignore => {
                Response::Continue
            }
            Packet::ReservedHeader { header } => {
                warn!(index = index, trace_id = self.trace_id, header = header; "reserved header");
                Response::Continue
            }
            Packet::ReservedConfiguration { header, reason } => {
                warn!(index = index, trace_id = self.trace_id, header = header, reason = reason; "packet invalid for configuration");
                Response::Continue
            }
            Packet::BadSequence { header, reason } => {
                warn!(index = index, trace_id = self.trace_id, header = header, reason = reason; "bad sequence");
                self.resync(index, reason);
                Response::Continue
            }
            Packet::IncompleteEot => Response::Continue,
        }
    }

    /// Drains `elem_res` against the speculation stack (spec.md §4.2
    /// commit/cancel/mispredict/discard algorithms).
    fn resolve_pending(
        &mut self,
        index: usize,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        self.state = DecoderState::ResolveElements;

        while self.elem_res.p0_commit > 0 {
            let Some(front) = self.stack.pop_oldest() else {
                // Commit requested more P0 elements than the stack
                // holds: treat as a commit-overrun protocol error.
                self.resync(index, "commit request exceeds stack depth");
                return Response::Continue;
            };
            let (resp, keep) = self.commit_one(front, index, mapper, sink);
            if let Some(elem) = keep {
                self.stack.push_front(elem);
            }
            if resp != Response::Continue {
                return resp;
            }
        }

        if self.elem_res.p0_cancel > 0 {
            self.stack.cancel(self.elem_res.p0_cancel);
            self.spec_depth = self.spec_depth.saturating_sub(self.elem_res.p0_cancel as u32);
            self.elem_res.p0_cancel = 0;
        }
        if self.elem_res.mispredict {
            self.stack.mispredict();
            self.elem_res.mispredict = false;
        }
        if self.elem_res.discard {
            let kept = self.stack.discard();
            for elem in kept {
                let kind = match elem {
                    StackElement::SyncMarker => ElementKind::SyncMarker,
                    StackElement::Event { number } => ElementKind::Event { number },
                    StackElement::Timestamp { value, new_bits } => {
                        ElementKind::Timestamp { value, new_bits }
                    }
                    StackElement::CycleCount { value } => ElementKind::CycleCount { value },
                    StackElement::TsAndCc { ts, ts_new_bits, .. } => ElementKind::Timestamp {
                        value: ts,
                        new_bits: ts_new_bits,
                    },
                    _ => continue,
                };
                let r = sink.trace_element_in(index, self.trace_id, kind);
                if r != Response::Continue {
                    // Discard does not resume mid-drain; the stack is
                    // already emptied, so just surface backpressure.
                    return r;
                }
            }
            self.spec_depth = 0;
            self.elem_res.discard = false;
            self.pending_conditional.clear();
            self.conditional_outstanding = 0;
            self.ret_stack.flush();
            self.state = DecoderState::NoSync;
            self.no_sync_emitted = false;
            return Response::Continue;
        }

        self.state = DecoderState::DecodePackets;
        Response::Continue
    }

    /// Commits a single stack element. Returns the response and, if the
    /// element must remain at the front of the stack (a partially
    /// consumed atom batch, or an element whose emission hit
    /// backpressure), that element to push back.
    fn commit_one(
        &mut self,
        elem: StackElement,
        index: usize,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> (Response, Option<StackElement>) {
        match elem {
            StackElement::AtomBatch { bits, count, consumed } => {
                let mut c = consumed;
                let mut last = Response::Continue;
                while c < count && self.elem_res.p0_commit > 0 {
                    let executed = (bits >> c) & 1 != 0;
                    last = self.process_atom(index, executed, mapper, sink);
                    c += 1;
                    self.elem_res.p0_commit -= 1;
                    self.spec_depth = self.spec_depth.saturating_sub(1);
                    if last != Response::Continue {
                        break;
                    }
                }
                if c < count {
                    (last, Some(StackElement::AtomBatch { bits, count, consumed: c }))
                } else {
                    (last, None)
                }
            }
            StackElement::Address { addr, isa, .. } => {
                self.pc = addr;
                self.isa = isa;
                self.needs_address = false;
                if let Some(popped) = self.ret_stack.pop_if_pending() {
                    match popped {
                        Some((a, i)) => {
                            self.pc = a;
                            self.isa = i;
                        }
                        None => {
                            self.resync(index, "return stack popped while empty");
                            return (Response::Continue, None);
                        }
                    }
                }
                (Response::Continue, None)
            }
            StackElement::Context(ctx) => {
                if ctx.ctxt_id_updated || ctx.vmid_updated {
                    mapper.invalidate_cache(self.trace_id);
                }
                self.context = ctx;
                self.mem_space = self.derive_mem_space();
                let r = sink.trace_element_in(index, self.trace_id, ElementKind::PeContext(ctx));
                (r, if r != Response::Continue { Some(StackElement::Context(ctx)) } else { None })
            }
            StackElement::TraceOn => {
                self.ret_stack.flush();
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::TraceOn { reason: TraceOnReason::Normal },
                );
                (r, if r != Response::Continue { Some(StackElement::TraceOn) } else { None })
            }
            StackElement::Exception { number, branch_target, m_profile } => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = self.commit_exception(number, branch_target, m_profile, index, mapper, sink);
                (r, None)
            }
            StackElement::ExceptionReturn => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = sink.trace_element_in(index, self.trace_id, ElementKind::ExceptionReturn);
                (r, None)
            }
            StackElement::FunctionReturn => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                if let Some((a, i)) = self.ret_stack.pop() {
                    self.pc = a;
                    self.isa = i;
                }
                (Response::Continue, None)
            }
            StackElement::Event { number } => {
                let r = sink.trace_element_in(index, self.trace_id, ElementKind::Event { number });
                (r, if r != Response::Continue { Some(StackElement::Event { number }) } else { None })
            }
            StackElement::Timestamp { value, new_bits } => {
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::Timestamp { value, new_bits },
                );
                (
                    r,
                    if r != Response::Continue {
                        Some(StackElement::Timestamp { value, new_bits })
                    } else {
                        None
                    },
                )
            }
            StackElement::CycleCount { value } => {
                let r = sink.trace_element_in(index, self.trace_id, ElementKind::CycleCount { value });
                (r, if r != Response::Continue { Some(StackElement::CycleCount { value }) } else { None })
            }
            StackElement::TsAndCc { ts, ts_new_bits, cc } => {
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::Timestamp { value: ts, new_bits: ts_new_bits },
                );
                if r != Response::Continue {
                    return (r, Some(StackElement::TsAndCc { ts, ts_new_bits, cc }));
                }
                let r = sink.trace_element_in(index, self.trace_id, ElementKind::CycleCount { value: cc });
                (r, if r != Response::Continue { Some(StackElement::TsAndCc { ts, ts_new_bits, cc }) } else { None })
            }
            StackElement::SyncMarker => {
                let r = sink.trace_element_in(index, self.trace_id, ElementKind::SyncMarker);
                (r, if r != Response::Continue { Some(StackElement::SyncMarker) } else { None })
            }
            StackElement::QElement { count, has_addr, addr } => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = if has_addr {
                    self.commit_source_address(addr, self.isa, index, mapper, sink)
                } else {
                    sink.trace_element_in(
                        index,
                        self.trace_id,
                        ElementKind::InstrRangeNoPath { start: self.pc, num_instr: count },
                    )
                };
                (r, None)
            }
            StackElement::SourceAddress { addr, isa } => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = self.commit_source_address(addr, isa, index, mapper, sink);
                (r, None)
            }
            StackElement::TraceInfo => {
                self.ret_stack.flush();
                (Response::Continue, None)
            }
            StackElement::TransactionStart => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::MemoryTransaction { start: true, success: true },
                );
                (r, None)
            }
            StackElement::TransactionCommit => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::MemoryTransaction { start: false, success: true },
                );
                (r, None)
            }
            StackElement::TransactionFail => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                let r = sink.trace_element_in(
                    index,
                    self.trace_id,
                    ElementKind::MemoryTransaction { start: false, success: false },
                );
                (r, None)
            }
            StackElement::Ite => (Response::Continue, None),
            StackElement::UnseenUncommitted => {
                self.elem_res.p0_commit = self.elem_res.p0_commit.saturating_sub(1);
                self.spec_depth = self.spec_depth.saturating_sub(1);
                (Response::Continue, None)
            }
        }
    }

    /// spec.md §4.2 `process_atom`.
    fn process_atom(
        &mut self,
        index: usize,
        executed: bool,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        if self.needs_address || self.needs_context {
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
            self.cfg().waypoints_on_barriers,
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

        let mut emit_eret_after = false;
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
                emit_eret_after = last.subtype == InstrSubtype::V8Eret;
            }
            (InstrType::IndirectBranch, false) => {
                self.pc = walk.end;
            }
            _ => {
                self.pc = walk.end;
            }
        }

        let r = sink.trace_element_in(
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
        );
        if r != Response::Continue {
            return r;
        }
        if emit_eret_after {
            sink.trace_element_in(index, self.trace_id, ElementKind::ExceptionReturn)
        } else {
            Response::Continue
        }
    }

    /// spec.md §4.2 `process_exception`.
    fn commit_exception(
        &mut self,
        number: u16,
        branch_target: bool,
        m_profile: bool,
        index: usize,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        if let Some(StackElement::Context(ctx)) = self.stack.peek_oldest().cloned() {
            self.stack.pop_oldest();
            if ctx.ctxt_id_updated || ctx.vmid_updated {
                mapper.invalidate_cache(self.trace_id);
            }
            self.context = ctx;
            self.mem_space = self.derive_mem_space();
        }

        let addr_elem = self.stack.pop_oldest();
        let (ret_addr, ret_isa) = match addr_elem {
            Some(StackElement::Address { addr, isa, .. }) => (addr, isa),
            other => {
                if let Some(e) = other {
                    self.stack.push_front(e);
                }
                self.resync(index, "exception commit missing required return address");
                return Response::Continue;
            }
        };

        let tail_chain = m_profile && ret_addr == 0xFFFF_FFFE;

        let isa = self.isa;
        let walk = CodeFollower::trace_to_waypoint(
            mapper,
            self.trace_id,
            self.mem_space,
            self.pc,
            isa,
            StopMode::AddressInclusive(ret_addr),
            self.cfg().waypoints_on_barriers,
        );
        if walk.nacc {
            self.needs_address = true;
            let r = sink.trace_element_in(
                index,
                self.trace_id,
                ElementKind::AddressNotAccessible { addr: walk.fault_addr, space: self.mem_space },
            );
            if r != Response::Continue {
                return r;
            }
        } else if walk.num_instr > 0 {
            let last = walk.last_instr.expect("non-empty walk always has a last instruction");
            let r = sink.trace_element_in(
                index,
                self.trace_id,
                ElementKind::InstructionRange {
                    start: walk.start,
                    end: walk.end,
                    num_instr: walk.num_instr,
                    isa,
                    last_instr: last,
                    executed: true,
                },
            );
            if r != Response::Continue {
                return r;
            }
        }

        let _ = branch_target;
        if !tail_chain {
            self.pc = ret_addr;
            self.isa = ret_isa;
        }

        sink.trace_element_in(
            index,
            self.trace_id,
            ElementKind::Exception { number, preferred_return: ret_addr },
        )
    }

    /// spec.md §4.2 `process_source_address` (ETE) and the Q-element
    /// with-address case, which shares the same "disassemble forward to
    /// a known address" shape.
    fn commit_source_address(
        &mut self,
        addr: u64,
        isa: Isa,
        index: usize,
        mapper: &mut Mapper,
        sink: &mut impl ElementSink,
    ) -> Response {
        // The emitted range runs from the current PC up through and
        // including the instruction at the packet-supplied source
        // address (spec.md §4.2 `process_source_address`): PC is always
        // the earlier point in forward flow, so it is the walk's start.
        let start = self.pc;
        let cur_isa = self.isa;
        let walk = CodeFollower::trace_to_waypoint(
            mapper,
            self.trace_id,
            self.mem_space,
            start,
            cur_isa,
            StopMode::AddressInclusive(addr),
            self.cfg().waypoints_on_barriers,
        );
        if walk.nacc {
            self.needs_address = true;
            return sink.trace_element_in(
                index,
                self.trace_id,
                ElementKind::AddressNotAccessible { addr: walk.fault_addr, space: self.mem_space },
            );
        }
        let last = walk.last_instr.expect("non-empty source-address walk");
        if last.is_link {
            self.ret_stack.push(walk.end, last.isa);
        }
        match (last.itype, last.branch_addr) {
            (InstrType::DirectBranch, Some(dest)) => {
                self.pc = dest;
                self.isa = last.next_isa;
            }
            _ => {
                self.pc = walk.end;
                self.isa = isa;
            }
        }
        sink.trace_element_in(
            index,
            self.trace_id,
            ElementKind::InstructionRange {
                start: walk.start,
                end: walk.end,
                num_instr: walk.num_instr,
                isa: cur_isa,
                last_instr: last,
                executed: true,
            },
        )
    }

    pub fn speculation_depth(&self) -> u32 {
        self.spec_depth
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreProfile, Registers};
    use crate::memory::BufferAccessor;
    use crate::sink::VecSink;

    fn cfg(max_spec_depth: u8) -> Config {
        let mut c = Config::from_registers(&Registers::default(), 42, CoreProfile::ProfileA);
        c.max_spec_depth = max_spec_depth;
        c
    }

    /// Three Thumb NOPs then an unconditional branch-to-self.
    fn thumb_three_then_branch() -> Vec<u8> {
        let mut v = vec![];
        for _ in 0..3 {
            v.extend_from_slice(&0xBF00u16.to_le_bytes());
        }
        v.extend_from_slice(&0xE7FEu16.to_le_bytes());
        v
    }

    fn mapper_with(base: u64, data: Vec<u8>) -> Mapper {
        let mut m = Mapper::new();
        m.add_accessor(Box::new(BufferAccessor { base, data }), MemorySpace::ANY)
            .unwrap();
        m
    }

    fn sync_decoder(d: &mut Etm4Decoder, sink: &mut VecSink, pc: u64) {
        d.packet_in(0, Packet::Async, &mut Mapper::new(), sink);
        d.packet_in(
            1,
            Packet::TraceInfo { cc_threshold: 0, curr_spec_depth: 0, cond_enabled: false },
            &mut Mapper::new(),
            sink,
        );
        d.packet_in(
            2,
            Packet::Address { addr: pc, new_bits: 64, isa: Isa::T32, context: None },
            &mut Mapper::new(),
            sink,
        );
    }

    #[test]
    fn atom_commit_emits_instruction_range() {
        let mut d = Etm4Decoder::new(0);
        d.set_config(cfg(8)).unwrap();
        let mut mapper = mapper_with(0x1000, thumb_three_then_branch());
        let mut sink = VecSink::default();

        sync_decoder(&mut d, &mut sink, 0x1000);
        d.packet_in(3, Packet::Atom { bits: 0b1, count: 1 }, &mut mapper, &mut sink);
        d.packet_in(4, Packet::Commit { n: 1 }, &mut mapper, &mut sink);

        let ranges: Vec<_> = sink
            .elements
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::InstructionRange { .. }))
            .collect();
        assert_eq!(ranges.len(), 1);
        if let ElementKind::InstructionRange { start, end, executed, .. } = ranges[0].kind {
            assert_eq!(start, 0x1000);
            assert_eq!(end, 0x1008);
            assert!(executed);
        } else {
            unreachable!()
        }
    }

    #[test]
    fn conditional_atom_is_held_back_until_result_pairs() {
        let mut d = Etm4Decoder::new(0);
        let mut c = cfg(8);
        c.conditional_trace = true;
        d.set_config(c).unwrap();
        let mut mapper = mapper_with(0x1000, thumb_three_then_branch());
        let mut sink = VecSink::default();

        sync_decoder(&mut d, &mut sink, 0x1000);
        d.packet_in(3, Packet::ConditionalInstr, &mut mapper, &mut sink);
        d.packet_in(4, Packet::Atom { bits: 0b1, count: 1 }, &mut mapper, &mut sink);
        // Commit requested before the result pairs: nothing to commit yet,
        // so no range should appear and the decoder shouldn't fault.
        d.packet_in(5, Packet::Commit { n: 0 }, &mut mapper, &mut sink);
        assert!(sink
            .elements
            .iter()
            .all(|e| !matches!(e.kind, ElementKind::InstructionRange { .. })));

        d.packet_in(6, Packet::ConditionalResult, &mut mapper, &mut sink);
        d.packet_in(7, Packet::Commit { n: 1 }, &mut mapper, &mut sink);

        let ranges: Vec<_> = sink
            .elements
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::InstructionRange { .. }))
            .collect();
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn mispredict_then_commit_marks_second_range_not_executed() {
        let mut d = Etm4Decoder::new(0);
        d.set_config(cfg(8)).unwrap();
        let mut mapper = mapper_with(0x2000, {
            // Two branch-to-self instructions back to back so two
            // distinct atoms each resolve to their own one-instruction
            // waypoint range.
            let mut v = vec![];
            v.extend_from_slice(&0xE7FEu16.to_le_bytes());
            v.extend_from_slice(&0xE7FEu16.to_le_bytes());
            v
        });
        let mut sink = VecSink::default();
        sync_decoder(&mut d, &mut sink, 0x2000);

        d.packet_in(3, Packet::Atom { bits: 0b11, count: 2 }, &mut mapper, &mut sink);
        d.packet_in(4, Packet::Mispredict, &mut mapper, &mut sink);
        d.packet_in(5, Packet::Commit { n: 2 }, &mut mapper, &mut sink);

        let ranges: Vec<_> = sink
            .elements
            .iter()
            .filter_map(|e| match &e.kind {
                ElementKind::InstructionRange { executed, .. } => Some(*executed),
                _ => None,
            })
            .collect();
        assert_eq!(ranges, vec![true, false]);
    }

    #[test]
    fn address_not_accessible_sets_needs_address_and_suppresses_further_atoms() {
        let mut d = Etm4Decoder::new(0);
        d.set_config(cfg(8)).unwrap();
        let mut mapper = Mapper::new();
        mapper
            .add_accessor(
                Box::new(BufferAccessor { base: 0xC000_8000, data: vec![0u8; 0x5_0000] }),
                MemorySpace::ANY,
            )
            .unwrap();
        let mut sink = VecSink::default();
        sync_decoder(&mut d, &mut sink, 0xC02F_5B3A);

        d.packet_in(3, Packet::Atom { bits: 0b1, count: 1 }, &mut mapper, &mut sink);
        d.packet_in(4, Packet::Commit { n: 1 }, &mut mapper, &mut sink);

        let has_nacc = sink
            .elements
            .iter()
            .any(|e| matches!(e.kind, ElementKind::AddressNotAccessible { addr: 0xC02F_5B3A, .. }));
        assert!(has_nacc);

        sink.elements.clear();
        d.packet_in(5, Packet::Atom { bits: 0b1, count: 1 }, &mut mapper, &mut sink);
        d.packet_in(6, Packet::Commit { n: 1 }, &mut mapper, &mut sink);
        assert!(sink
            .elements
            .iter()
            .all(|e| !matches!(e.kind, ElementKind::InstructionRange { .. })));
    }

    #[test]
    fn speculation_depth_overflow_resyncs() {
        let mut d = Etm4Decoder::new(0);
        d.set_config(cfg(1)).unwrap();
        let mut mapper = mapper_with(0x3000, thumb_three_then_branch());
        let mut sink = VecSink::default();
        sync_decoder(&mut d, &mut sink, 0x3000);

        d.packet_in(3, Packet::Atom { bits: 0b11, count: 2 }, &mut mapper, &mut sink);
        assert_eq!(d.state(), DecoderState::NoSync);
    }
}
