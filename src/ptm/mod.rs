//! PTM protocol: packet processor and packet decoder (spec.md §4.3).

pub mod decoder;
pub mod packet;

pub use decoder::{DecoderState, PtmDecoder};
pub use packet::{Packet, PtmPacketSink, PtmProcessor};
