//! ETMv4/ETE protocol: packet processor, speculation stack, and packet
//! decoder (spec.md §4.1, §4.2).

pub mod decoder;
pub mod packet;
pub mod stack;

pub use decoder::{DecoderState, Etm4Decoder};
pub use packet::{Etm4Processor, Packet, PacketSink};
pub use stack::{ElemRes, SpeculationStack, StackElement};
