//! Speculation stack of P0 elements (spec.md §3 "Speculation Stack
//! Element", §4.2 commit/cancel/mispredict/discard algorithms; design
//! note §9 "heterogeneous stack of P0 elements").
//!
//! A single tagged-variant type stored by value in a `VecDeque`, per the
//! design note's preferred re-architecture away from the source's
//! pointer-graph stack: insertion order is preserved, commit drains from
//! the oldest end, cancel and mispredict from the newest.

use std::collections::VecDeque;

use crate::element::{Isa, PeContext};

/// One deferred piece of program-trace reconstruction (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum StackElement {
    /// Up to 24 E/N decisions packed LSB-first; `consumed` atoms have
    /// already committed from the oldest (LSB) end.
    AtomBatch { bits: u32, count: u8, consumed: u8 },
    Address { addr: u64, new_bits: u8, isa: Isa },
    SourceAddress { addr: u64, isa: Isa },
    Context(PeContext),
    TraceOn,
    Exception {
        number: u16,
        branch_target: bool,
        m_profile: bool,
    },
    ExceptionReturn,
    FunctionReturn,
    Event { number: u8 },
    Timestamp { value: u64, new_bits: u8 },
    CycleCount { value: u32 },
    TsAndCc { ts: u64, ts_new_bits: u8, cc: u32 },
    SyncMarker,
    QElement { count: u32, has_addr: bool, addr: u64 },
    TransactionStart,
    TransactionCommit,
    TransactionFail,
    Ite,
    /// A commit request arrived for an element never actually pushed
    /// (e.g. trailing overflow recovery); consumes budget, emits nothing.
    UnseenUncommitted,
    /// Commit-time signal to flush the return stack.
    TraceInfo,
}

/// Whether `elem` is a genuine P0 element: commit/cancel-able and
/// counted against `current_speculation_depth` (glossary "P0 element").
/// Context, address, and pure metadata are not P0.
pub fn is_p0(elem: &StackElement) -> bool {
    matches!(
        elem,
        StackElement::AtomBatch { .. }
            | StackElement::Exception { .. }
            | StackElement::ExceptionReturn
            | StackElement::FunctionReturn
            | StackElement::SourceAddress { .. }
            | StackElement::QElement { .. }
            | StackElement::TransactionStart
            | StackElement::TransactionCommit
            | StackElement::TransactionFail
            | StackElement::UnseenUncommitted
    )
}

/// Accumulator fields signaling that resolution is required before
/// further packets are processed (spec.md §3 "Resolved element
/// request").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElemRes {
    pub p0_commit: usize,
    pub p0_cancel: usize,
    pub mispredict: bool,
    pub discard: bool,
}

impl ElemRes {
    pub fn is_pending(&self) -> bool {
        self.p0_commit > 0 || self.p0_cancel > 0 || self.mispredict || self.discard
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpeculationStack {
    elems: VecDeque<StackElement>,
}

impl SpeculationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, elem: StackElement) {
        self.elems.push_back(elem);
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Count of genuine P0 elements currently held, for
    /// `current_speculation_depth` (atom batches count their
    /// not-yet-committed atoms individually).
    pub fn speculation_depth(&self) -> usize {
        self.elems
            .iter()
            .map(|e| match e {
                StackElement::AtomBatch { count, consumed, .. } => {
                    (*count - *consumed) as usize
                }
                e if is_p0(e) => 1,
                _ => 0,
            })
            .sum()
    }

    pub fn pop_oldest(&mut self) -> Option<StackElement> {
        self.elems.pop_front()
    }

    pub fn push_front(&mut self, elem: StackElement) {
        self.elems.push_front(elem);
    }

    pub fn peek_oldest(&self) -> Option<&StackElement> {
        self.elems.front()
    }

    /// Drops `n` P0 units from the newest end (spec.md §4.2 "Cancel
    /// algorithm"). Non-P0 metadata encountered along the way is
    /// shelved and reinserted at the top afterward, preserving order.
    pub fn cancel(&mut self, mut n: usize) {
        let mut shelf = Vec::new();
        while n > 0 {
            let Some(back) = self.elems.pop_back() else {
                break;
            };
            match back {
                StackElement::AtomBatch { bits, count, consumed } if count > consumed => {
                    let remaining = count - consumed - 1;
                    n -= 1;
                    if remaining > 0 {
                        self.elems.push_back(StackElement::AtomBatch {
                            bits,
                            count: consumed + remaining,
                            consumed,
                        });
                    }
                }
                StackElement::AtomBatch { .. } => {
                    // Already fully committed; nothing left to cancel.
                }
                e if is_p0(&e) => {
                    n -= 1;
                }
                e => shelf.push(e),
            }
        }
        while let Some(e) = shelf.pop() {
            self.elems.push_back(e);
        }
    }

    /// Flips the newest atom batch's newest bit and discards any
    /// address elements newer than it (spec.md §4.2 "Mispredict").
    pub fn mispredict(&mut self) {
        let Some(pos) = self.elems.iter().rposition(|e| matches!(e, StackElement::AtomBatch { .. }))
        else {
            return;
        };
        let mut i = self.elems.len();
        while i > pos + 1 {
            i -= 1;
            if matches!(self.elems[i], StackElement::Address { .. }) {
                self.elems.remove(i);
            }
        }
        if let StackElement::AtomBatch { bits, count, .. } = &mut self.elems[pos] {
            if *count > 0 {
                *bits ^= 1 << (*count - 1);
            }
        }
    }

    /// Drains the whole stack, returning only terminal metadata (spec.md
    /// §4.2 "Discard"): markers, ITEs, timestamps, cycle counts, events.
    pub fn discard(&mut self) -> Vec<StackElement> {
        self.elems
            .drain(..)
            .filter(|e| {
                matches!(
                    e,
                    StackElement::SyncMarker
                        | StackElement::Ite
                        | StackElement::Timestamp { .. }
                        | StackElement::CycleCount { .. }
                        | StackElement::TsAndCc { .. }
                        | StackElement::Event { .. }
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_drops_newest_atom_preserving_shelved_event() {
        // [atom(EE), event, atom(E)] cancel(2) -> the newest atom(E) is
        // dropped whole (1), then the newest bit of atom(EE) is dropped
        // (1), leaving a single-atom batch (the older E) and the event
        // shelved back into place: [atom(E), event].
        let mut stack = SpeculationStack::new();
        stack.push(StackElement::AtomBatch {
            bits: 0b11,
            count: 2,
            consumed: 0,
        });
        stack.push(StackElement::Event { number: 3 });
        stack.push(StackElement::AtomBatch {
            bits: 0b1,
            count: 1,
            consumed: 0,
        });

        stack.cancel(2);

        assert_eq!(stack.len(), 2);
        let v: Vec<_> = stack.elems.iter().cloned().collect();
        assert_eq!(
            v,
            vec![
                StackElement::AtomBatch {
                    bits: 0b11,
                    count: 1,
                    consumed: 0
                },
                StackElement::Event { number: 3 },
            ]
        );
    }

    #[test]
    fn mispredict_flips_newest_atom_bit_and_drops_newer_address() {
        let mut stack = SpeculationStack::new();
        stack.push(StackElement::AtomBatch {
            bits: 0b11,
            count: 2,
            consumed: 0,
        });
        stack.push(StackElement::Address {
            addr: 0x2000,
            new_bits: 32,
            isa: Isa::A32,
        });

        stack.mispredict();

        assert_eq!(stack.len(), 1);
        assert_eq!(
            stack.peek_oldest(),
            Some(&StackElement::AtomBatch {
                bits: 0b01,
                count: 2,
                consumed: 0
            })
        );
    }

    #[test]
    fn discard_keeps_only_terminal_metadata() {
        let mut stack = SpeculationStack::new();
        stack.push(StackElement::AtomBatch {
            bits: 0b1,
            count: 1,
            consumed: 0,
        });
        stack.push(StackElement::Event { number: 1 });
        stack.push(StackElement::SyncMarker);

        let kept = stack.discard();
        assert!(stack.is_empty());
        assert_eq!(
            kept,
            vec![StackElement::Event { number: 1 }, StackElement::SyncMarker]
        );
    }

    #[test]
    fn speculation_depth_counts_unconsumed_atoms_and_p0_elements() {
        let mut stack = SpeculationStack::new();
        stack.push(StackElement::AtomBatch {
            bits: 0b101,
            count: 3,
            consumed: 1,
        });
        stack.push(StackElement::Exception {
            number: 1,
            branch_target: false,
            m_profile: false,
        });
        stack.push(StackElement::Context(PeContext::default()));
        assert_eq!(stack.speculation_depth(), 2 + 1 + 0);
    }
}
