//! A [sans-I/O](https://sans-io.readthedocs.io/how-to-sans-io.html) decoder
//! for ARM CoreSight hardware instruction-trace streams, as specified in
//! the ARM Embedded Trace Macrocell architecture (PTM, ETMv4) and the v9
//! Extended Trace Extension (ETE).
//!
//! Each protocol is a two-stage pipeline: a byte-driven **packet
//! processor** turns a raw trace byte stream into discrete protocol
//! packets, and a **packet decoder** consumes those packets and produces
//! a stream of generic [`element::TraceElement`]s — instruction ranges,
//! exceptions, context changes, timestamps. ETMv4/ETE additionally
//! resolve speculatively-traced program elements through a commit/cancel/
//! mispredict state machine ([`etm4::stack`]) before they reach the sink.
//!
//! Common abbreviations:
//!
//! - PE: processing element (the traced core);
//! - PC: program counter;
//! - EL: exception level;
//! - ISA: instruction set (A32/T32/A64);
//! - P0: a single commit-able unit of program order (an atom, exception,
//!   return, ...).
//!
//! This crate has no I/O of its own: callers push bytes (or, for PTM/
//! ETMv4 packets, already-decoded packets) into a processor/decoder pair
//! and drain the elements it produces through a [`sink`] implementation.
//! There is no internal threading or asynchrony (spec.md §5); the only
//! suspension point is a sink returning [`sink::Response::Wait`].

pub mod config;
pub mod element;
pub mod error;
pub mod etm4;
pub mod follower;
pub mod instr;
pub mod memory;
pub mod memspace;
pub mod ptm;
pub mod retstack;
pub mod sink;
pub mod timestamp;
pub mod varint;

pub use config::{Config, CoreProfile, PtmConfig, PtmRegisters, Registers};
pub use element::{ElementKind, InstrSubtype, InstrType, InstructionInfo, Isa, TraceElement};
pub use error::{Severity, TraceError};
pub use memspace::{ExceptionLevel, MemorySpace, SecurityState};
pub use sink::Response;
