//! Crate-wide error taxonomy (spec.md §7).
//!
//! `TraceError` is returned from setup/registration operations
//! (`set_config`, `Mapper::add_accessor`, ...). Protocol-layer failures
//! that occur mid-stream do not propagate as `Result`: they are surfaced
//! as in-band bad-packet/bad-sequence markers and logged (see
//! `Etm4Processor`/`Etm4Decoder`), matching the Propagation rules below.

use thiserror::Error;

/// Severity classification attached to every error a sink observes,
/// per spec.md §7's "every error emitted carries ... a severity
/// classification".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Resource error (e.g. address not accessible): decode continues.
    Warning,
    /// Protocol error: the owning state machine resets and resynchronizes.
    Error,
    /// Internal consistency violation or use-before-init: the pipeline
    /// for this source is terminated.
    Fatal,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TraceError {
    #[error("reserved packet header 0x{header:02x} at byte {index}")]
    ReservedHeader { index: usize, header: u8 },

    #[error("packet invalid for current configuration at byte {index}: {reason}")]
    ReservedConfiguration { index: usize, reason: &'static str },

    #[error("bad packet sequence at byte {index}: {reason}")]
    BadSequence { index: usize, reason: &'static str },

    #[error("protocol sequence error: {reason}")]
    Protocol { reason: &'static str },

    #[error("speculation depth {depth} exceeds configured max {max}")]
    SpeculationOverflow { depth: u8, max: u8 },

    #[error("return stack popped while empty")]
    ReturnStackUnderflow,

    #[error("commit request ({requested}) exceeds stack depth ({available})")]
    CommitOverrun { requested: usize, available: usize },

    #[error("operation requires set_config to run first")]
    NotInitialized,

    #[error("set_config called more than once")]
    AlreadyConfigured,

    #[error("accessor range overlaps an existing accessor in an intersecting memory space")]
    OverlappingAccessor,

    #[error("accessor has an empty or misaligned address range")]
    InvalidAccessorRange,

    #[error("internal consistency violation: {0}")]
    Internal(&'static str),
}

impl TraceError {
    pub fn severity(&self) -> Severity {
        use TraceError::*;
        match self {
            ReservedHeader { .. } | ReservedConfiguration { .. } | BadSequence { .. } => {
                Severity::Warning
            }
            Protocol { .. }
            | SpeculationOverflow { .. }
            | ReturnStackUnderflow
            | CommitOverrun { .. } => Severity::Error,
            NotInitialized
            | AlreadyConfigured
            | OverlappingAccessor
            | InvalidAccessorRange
            | Internal(_) => Severity::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_recoverable_severity() {
        assert_eq!(
            TraceError::Protocol { reason: "x" }.severity(),
            Severity::Error
        );
    }

    #[test]
    fn init_errors_are_fatal() {
        assert_eq!(TraceError::NotInitialized.severity(), Severity::Fatal);
    }
}
