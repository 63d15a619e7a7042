//! PTM Packet Processor (spec.md §4.3): structurally identical to the
//! ETMv4/ETE processor but with PTM's much smaller packet vocabulary
//! and no speculation stack downstream.
//!
//! Grounded the same way as [`crate::etm4::packet`]: header byte
//! dispatched via `#[bitmatch]`, payload accumulated into a
//! pending-state variant, with `varint` standing in for this lineage's
//! own continuation-folding idiom. PTM's address and I-sync fields are
//! fixed-width (32-bit only, ARMv7 has no 64-bit PTM implementation) so
//! the pending-state shapes are simpler than ETMv4's.

use bitmatch::bitmatch;

use crate::config::PtmConfig;
use crate::element::Isa;
use crate::sink::Response;
use crate::varint;

/// One PTM protocol packet (spec.md §4.3's packet vocabulary: async,
/// I-sync, atom, branch-address, waypoint-update, context-id, VMID,
/// timestamp, trigger, exception-return, ignore).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    Async,
    ISync {
        addr: u64,
        isa: Isa,
        non_secure: bool,
    },
    WaypointUpdate {
        addr: u64,
        isa: Isa,
    },
    BranchAddress {
        addr: u64,
        isa: Isa,
        exception: bool,
        non_secure: bool,
    },
    /// `bits` packs E(1)/N(0) LSB-first for `count` atoms.
    Atom {
        bits: u32,
        count: u8,
    },
    ContextId {
        value: Option<u32>,
    },
    Vmid {
        value: Option<u32>,
    },
    Timestamp {
        value: u64,
        new_bits: u8,
    },
    Trigger,
    ExceptionReturn,
    Ignore,
    ReservedHeader {
        header: u8,
    },
    IncompleteEot,
}

#[derive(Debug, Clone)]
enum Pending {
    None,
    AsyncZeros { zeros: u32 },
    /// I-sync: 1 descriptor byte (ISA/security), then 4 address bytes,
    /// then `ctxt_bytes_needed` context-id bytes.
    ISync {
        descriptor: Option<u8>,
        addr_bytes: Vec<u8>,
        ctxt_bytes_needed: u8,
        ctxt_bytes: Vec<u8>,
    },
    WaypointUpdate {
        descriptor: Option<u8>,
        addr_bytes: Vec<u8>,
    },
    BranchAddress {
        addr_bytes: Vec<u8>,
    },
    FixedWidth {
        kind: FixedKind,
        needed: u8,
        bytes: Vec<u8>,
    },
    Timestamp {
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixedKind {
    ContextId,
    Vmid,
}

pub trait PtmPacketSink {
    fn packet_in(&mut self, index: usize, packet: Packet) -> Response;
}

pub struct PtmProcessor {
    config: Option<PtmConfig>,
    synced: bool,
    pending: Pending,
    pkt_start: usize,
}

impl Default for PtmProcessor {
    fn default() -> Self {
        PtmProcessor {
            config: None,
            synced: false,
            pending: Pending::None,
            pkt_start: 0,
        }
    }
}

impl PtmProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&mut self, config: PtmConfig) -> Result<(), crate::error::TraceError> {
        if self.config.is_some() {
            return Err(crate::error::TraceError::AlreadyConfigured);
        }
        self.config = Some(config);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.synced = false;
        self.pending = Pending::None;
    }

    pub fn flush(&mut self) {}

    pub fn eot(&mut self, index: usize, sink: &mut impl PtmPacketSink) -> Response {
        if !matches!(self.pending, Pending::None) {
            self.pending = Pending::None;
            return sink.packet_in(index, Packet::IncompleteEot);
        }
        Response::Continue
    }

    pub fn data_in(
        &mut self,
        index: usize,
        data: &[u8],
        sink: &mut impl PtmPacketSink,
    ) -> (usize, Response) {
        if self.config.is_none() {
            return (0, Response::FatalNotInitialized);
        }
        let mut consumed = 0;
        for &byte in data {
            let response = self.step(index + consumed, byte, sink);
            consumed += 1;
            if response == Response::Wait || response.is_fatal() {
                return (consumed, response);
            }
        }
        (consumed, Response::Continue)
    }

    fn step(&mut self, index: usize, byte: u8, sink: &mut impl PtmPacketSink) -> Response {
        if !self.synced {
            return self.step_unsynced(index, byte, sink);
        }

        let pending = std::mem::replace(&mut self.pending, Pending::None);
        match pending {
            Pending::None => {
                self.pkt_start = index;
                self.dispatch_header(index, byte, sink)
            }
            Pending::AsyncZeros { .. } => unreachable!("async handled pre-sync"),
            Pending::ISync {
                descriptor,
                mut addr_bytes,
                ctxt_bytes_needed,
                mut ctxt_bytes,
            } => {
                if descriptor.is_none() {
                    return self.continue_isync(index, byte, addr_bytes, ctxt_bytes_needed, sink);
                }
                if addr_bytes.len() < 4 {
                    addr_bytes.push(byte);
                    if addr_bytes.len() < 4 {
                        self.pending = Pending::ISync {
                            descriptor,
                            addr_bytes,
                            ctxt_bytes_needed,
                            ctxt_bytes,
                        };
                        return Response::Continue;
                    }
                    if ctxt_bytes_needed == 0 {
                        return self.finish_isync(index, descriptor.unwrap(), &addr_bytes, None, sink);
                    }
                    self.pending = Pending::ISync {
                        descriptor,
                        addr_bytes,
                        ctxt_bytes_needed,
                        ctxt_bytes,
                    };
                    return Response::Continue;
                }
                ctxt_bytes.push(byte);
                if (ctxt_bytes.len() as u8) >= ctxt_bytes_needed {
                    let value = decode_le(&ctxt_bytes);
                    return self.finish_isync(index, descriptor.unwrap(), &addr_bytes, value, sink);
                }
                self.pending = Pending::ISync {
                    descriptor,
                    addr_bytes,
                    ctxt_bytes_needed,
                    ctxt_bytes,
                };
                Response::Continue
            }
            Pending::WaypointUpdate {
                descriptor,
                mut addr_bytes,
            } => {
                if descriptor.is_none() {
                    self.pending = Pending::WaypointUpdate {
                        descriptor: Some(byte),
                        addr_bytes,
                    };
                    return Response::Continue;
                }
                addr_bytes.push(byte);
                if addr_bytes.len() < 4 {
                    self.pending = Pending::WaypointUpdate {
                        descriptor,
                        addr_bytes,
                    };
                    return Response::Continue;
                }
                let addr = u32::from_le_bytes(addr_bytes.try_into().unwrap()) as u64;
                let isa = if descriptor.unwrap() & 0x01 != 0 { Isa::T32 } else { Isa::A32 };
                sink.packet_in(self.pkt_start, Packet::WaypointUpdate { addr, isa })
            }
            Pending::BranchAddress {
                mut addr_bytes,
                descriptor,
            } => {
                if addr_bytes.len() < 4 {
                    addr_bytes.push(byte);
                    self.pending = Pending::BranchAddress { addr_bytes, descriptor };
                    return Response::Continue;
                }
                let addr = u32::from_le_bytes(addr_bytes.clone().try_into().unwrap()) as u64;
                let isa = if byte & 0x01 != 0 { Isa::T32 } else { Isa::A32 };
                let exception = byte & 0x02 != 0;
                let non_secure = byte & 0x04 != 0;
                sink.packet_in(
                    self.pkt_start,
                    Packet::BranchAddress { addr, isa, exception, non_secure },
                )
            }
            Pending::FixedWidth { kind, needed, mut bytes } => {
                bytes.push(byte);
                if (bytes.len() as u8) < needed {
                    self.pending = Pending::FixedWidth { kind, needed, bytes };
                    return Response::Continue;
                }
                let value = decode_le(&bytes);
                let pkt = match kind {
                    FixedKind::ContextId => Packet::ContextId { value },
                    FixedKind::Vmid => Packet::Vmid { value },
                };
                sink.packet_in(self.pkt_start, pkt)
            }
            Pending::Timestamp { mut bytes } => {
                bytes.push(byte);
                let (value, _, complete) = varint::read_timestamp(&bytes, 48);
                if !complete {
                    self.pending = Pending::Timestamp { bytes };
                    return Response::Continue;
                }
                let new_bits = ((bytes.len() as u8) * 7).min(48);
                sink.packet_in(self.pkt_start, Packet::Timestamp { value, new_bits })
            }
        }
    }

    fn continue_isync(
        &mut self,
        index: usize,
        byte: u8,
        addr_bytes: Vec<u8>,
        ctxt_bytes_needed: u8,
        sink: &mut impl PtmPacketSink,
    ) -> Response {
        self.pending = Pending::ISync {
            descriptor: Some(byte),
            addr_bytes,
            ctxt_bytes_needed,
            ctxt_bytes: Vec::new(),
        };
        let _ = index;
        let _ = sink;
        Response::Continue
    }

    fn finish_isync(
        &mut self,
        index: usize,
        descriptor: u8,
        addr_bytes: &[u8],
        ctxt: Option<u32>,
        sink: &mut impl PtmPacketSink,
    ) -> Response {
        let addr = u32::from_le_bytes(addr_bytes.try_into().unwrap()) as u64;
        let isa = if descriptor & 0x01 != 0 { Isa::T32 } else { Isa::A32 };
        let non_secure = descriptor & 0x02 != 0;
        let r = sink.packet_in(self.pkt_start, Packet::ISync { addr, isa, non_secure });
        if r != Response::Continue {
            return r;
        }
        if let Some(value) = ctxt {
            return sink.packet_in(index, Packet::ContextId { value: Some(value) });
        }
        Response::Continue
    }

    fn step_unsynced(&mut self, index: usize, byte: u8, sink: &mut impl PtmPacketSink) -> Response {
        let zeros = match self.pending {
            Pending::AsyncZeros { zeros } => zeros,
            _ => 0,
        };
        if byte == 0x00 {
            self.pending = Pending::AsyncZeros { zeros: zeros + 1 };
            Response::Continue
        } else if byte == 0x80 && zeros >= 5 {
            self.synced = true;
            self.pending = Pending::None;
            sink.packet_in(index, Packet::Async)
        } else {
            self.pending = Pending::AsyncZeros { zeros: 0 };
            Response::Continue
        }
    }

    #[bitmatch]
    fn dispatch_header(&mut self, index: usize, header: u8, sink: &mut impl PtmPacketSink) -> Response {
        let cfg = self.config.unwrap();
        #[bitmatch]
        match header {
            "0000_0000" => {
                self.pending = Pending::AsyncZeros { zeros: 1 };
                self.synced = false;
                Response::Continue
            }
            "0000_0001" => {
                self.pending = Pending::ISync {
                    descriptor: None,
                    addr_bytes: Vec::new(),
                    ctxt_bytes_needed: cfg.context_id_bytes,
                    ctxt_bytes: Vec::new(),
                };
                Response::Continue
            }
            "0000_0010" => {
                self.pending = Pending::WaypointUpdate {
                    descriptor: None,
                    addr_bytes: Vec::new(),
                };
                Response::Continue
            }
            "0000_0011" => sink.packet_in(index, Packet::Trigger),
            "0000_0100" => sink.packet_in(index, Packet::ExceptionReturn),
            "0000_0101" => sink.packet_in(index, Packet::Ignore),
            "0000_0110" => {
                self.pending = Pending::Timestamp { bytes: Vec::new() };
                Response::Continue
            }
            "0000_0111" => {
                if cfg.context_id_bytes == 0 {
                    return sink.packet_in(index, Packet::ContextId { value: None });
                }
                self.pending = Pending::FixedWidth {
                    kind: FixedKind::ContextId,
                    needed: cfg.context_id_bytes,
                    bytes: Vec::new(),
                };
                Response::Continue
            }
            "0000_1000" => {
                if cfg.vmid_bytes == 0 {
                    return sink.packet_in(index, Packet::Vmid { value: None });
                }
                self.pending = Pending::FixedWidth {
                    kind: FixedKind::Vmid,
                    needed: cfg.vmid_bytes,
                    bytes: Vec::new(),
                };
                Response::Continue
            }
            "01ff_cccc" => {
                let count = atom_format_count(f);
                sink.packet_in(
                    index,
                    Packet::Atom {
                        bits: c as u32 & atom_mask(count),
                        count,
                    },
                )
            }
            "1000_0000" => {
                self.pending = Pending::BranchAddress {
                    addr_bytes: Vec::new(),
                    descriptor: None,
                };
                Response::Continue
            }
            "hhhh_hhhh" => sink.packet_in(index, Packet::ReservedHeader { header: h }),
        }
    }
}

fn decode_le(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() {
        return None;
    }
    let mut v = 0u32;
    for (i, &b) in bytes.iter().enumerate().take(4) {
        v |= (b as u32) << (8 * i);
    }
    Some(v)
}

fn atom_format_count(fmt: u8) -> u8 {
    match fmt {
        0 => 1,
        1 => 2,
        2 => 3,
        _ => 4,
    }
}

fn atom_mask(count: u8) -> u32 {
    (1u32 << count) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PtmRegisters;

    fn cfg() -> PtmConfig {
        PtmConfig::from_registers(&PtmRegisters::default())
    }

    struct VecPacketSink(Vec<Packet>);
    impl PtmPacketSink for VecPacketSink {
        fn packet_in(&mut self, _index: usize, packet: Packet) -> Response {
            self.0.push(packet);
            Response::Continue
        }
    }

    #[test]
    fn async_sequence_synchronizes() {
        let mut p = PtmProcessor::new();
        p.set_config(cfg()).unwrap();
        let mut sink = VecPacketSink(vec![]);
        let (n, resp) = p.data_in(0, &[0, 0, 0, 0, 0, 0x80], &mut sink);
        assert_eq!(n, 6);
        assert_eq!(resp, Response::Continue);
        assert_eq!(sink.0, vec![Packet::Async]);
    }

    #[test]
    fn isync_without_context_decodes_address_and_isa() {
        let mut p = PtmProcessor::new();
        p.set_config(cfg()).unwrap();
        let mut sink = VecPacketSink(vec![]);
        p.data_in(0, &[0, 0, 0, 0, 0, 0x80], &mut sink);
        sink.0.clear();
        // header 0x01, descriptor byte (T32, non-secure) = 0x03, then
        // little-endian address 0x82 8d 01 c0 = 0xc0018d82.
        p.data_in(6, &[0x01, 0x03, 0x82, 0x8d, 0x01, 0xc0], &mut sink);
        assert_eq!(
            sink.0,
            vec![Packet::ISync { addr: 0xc0018d82, isa: Isa::T32, non_secure: true }]
        );
    }

    #[test]
    fn atom_format1_executed_bit() {
        let mut p = PtmProcessor::new();
        p.set_config(cfg()).unwrap();
        let mut sink = VecPacketSink(vec![]);
        p.data_in(0, &[0, 0, 0, 0, 0, 0x80], &mut sink);
        sink.0.clear();
        // "01ff_cccc" with ff=00 (count=1), cccc=0001 -> bits=1
        p.data_in(6, &[0b0100_0001], &mut sink);
        assert_eq!(sink.0, vec![Packet::Atom { bits: 1, count: 1 }]);
    }

    #[test]
    fn branch_address_decodes_descriptor_flags() {
        let mut p = PtmProcessor::new();
        p.set_config(cfg()).unwrap();
        let mut sink = VecPacketSink(vec![]);
        p.data_in(0, &[0, 0, 0, 0, 0, 0x80], &mut sink);
        sink.0.clear();
        p.data_in(6, &[0x80, 0x00, 0x30, 0x00, 0xc0, 0x01], &mut sink);
        assert_eq!(
            sink.0,
            vec![Packet::BranchAddress {
                addr: 0xc0003000,
                isa: Isa::T32,
                exception: false,
                non_secure: false,
            }]
        );
    }
}
