//! ETMv4/ETE Packet Processor (spec.md §4.1): a byte-driven state machine
//! turning a raw trace byte stream into discrete protocol packets.
//!
//! Grounded on this lineage's own `Decoder::process_byte`/`decode_header`
//! shape (`examples/rust-embedded-itm/src/lib.rs`): header byte dispatched
//! via `#[bitmatch]`, payload accumulated into a pending-state variant
//! until complete, with `varint::read_continuation`/`read_timestamp`/
//! `stitch_address` standing in for this lineage's own
//! `Decoder::extract_timestamp`.

use bitmatch::bitmatch;

use crate::config::Config;
use crate::element::Isa;
use crate::sink::Response;
use crate::varint;

/// One ETMv4/ETE protocol packet (spec.md §3 "Trace Packet").
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Async,
    TraceInfo {
        cc_threshold: u32,
        curr_spec_depth: u8,
        cond_enabled: bool,
    },
    Timestamp {
        value: u64,
        new_bits: u8,
    },
    TraceOn,
    FunctionReturn,
    Exception {
        number: u16,
        branch_target: bool,
        m_profile: bool,
    },
    /// Exception number 0x00: PE reset. Split out at classification time
    /// rather than reinterpreted from `Exception::number` at commit time
    /// (DESIGN.md Open Question 1).
    ExceptionPeReset,
    /// Exception number 0x18: transaction failure. Same rationale as
    /// `ExceptionPeReset`.
    ExceptionTransFail {
        branch_target: bool,
    },
    /// Valid only for major-version < 5 (spec.md §4.1 header table).
    ExceptionReturn,
    Ite,
    TransactionStart,
    TransactionCommit,
    TransactionFail,
    CycleCount {
        value: u32,
    },
    DataSyncMarker,
    Commit {
        n: usize,
    },
    Cancel {
        n: usize,
        mispredict: bool,
    },
    Mispredict,
    /// Covers both explicit discard and overflow-recovery headers.
    Discard,
    ConditionalInstr,
    ConditionalResult,
    ConditionalFlush,
    Event {
        number: u8,
    },
    Ignore,
    Context {
        el: u8,
        is64: bool,
        non_secure: bool,
        realm: bool,
        ctxt_id_updated: bool,
        vmid_updated: bool,
        context_id: Option<u32>,
        vmid: Option<u32>,
    },
    /// Address update, optionally combined with a context (spec.md
    /// §4.1's 0x80-0x86 and 0x90-0x9E ranges both land here, the only
    /// difference being whether `context` is populated).
    Address {
        addr: u64,
        new_bits: u8,
        isa: Isa,
        context: Option<Box<Packet>>,
    },
    ExactAddressMatch {
        index: u8,
    },
    Q {
        count: u32,
        addr: Option<u64>,
    },
    SourceAddress {
        addr: u64,
        isa: Isa,
    },
    TsMarker,
    /// `bits` packs E(1)/N(0) LSB-first for `count` atoms (up to 24).
    Atom {
        bits: u32,
        count: u8,
    },
    ReservedHeader {
        header: u8,
    },
    ReservedConfiguration {
        header: u8,
        reason: &'static str,
    },
    BadSequence {
        header: u8,
        reason: &'static str,
    },
    IncompleteEot,
}

/// What's being accumulated while a multi-byte packet is mid-flight.
#[derive(Debug, Clone)]
enum Pending {
    None,
    /// Counting a run of zero bytes looking for the `0x80` sync terminator.
    AsyncZeros { zeros: u32 },
    /// Generic continuation-encoded payload (timestamp, cycle count, Q
    /// count, commit/cancel counts).
    Continuation { kind: ContKind, bytes: Vec<u8> },
    /// Fixed-width context-id/VMID payload following a context header.
    /// `address` is populated when this context follows an
    /// address-with-context packet, so the eventual `Context` can be
    /// wrapped into the right `Packet::Address`.
    Context {
        el: u8,
        is64: bool,
        non_secure: bool,
        realm: bool,
        ctxt_id_updated: bool,
        vmid_updated: bool,
        cid_bytes_needed: u8,
        vmid_bytes_needed: u8,
        bytes: Vec<u8>,
        address: Option<(u64, u8, Isa)>,
    },
    /// The extension family (header `0x00`): a second byte disambiguates
    /// a resync A-Sync run from a Discard/Overflow marker. Unlike
    /// `AsyncZeros`, this runs while already synchronized, so a
    /// Discard/Overflow byte doesn't drop frame sync the way an actual
    /// A-Sync completion does.
    Extension { zeros: u32 },
    /// Short/long address payload, optionally chained into a context.
    Address {
        isa: Isa,
        addr_bytes_needed: u8,
        final_bits: u8,
        bytes: Vec<u8>,
        with_context: bool,
    },
    SourceAddress {
        isa: Isa,
        addr_bytes_needed: u8,
        bytes: Vec<u8>,
    },
    Exception {
        first_byte: u8,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContKind {
    Timestamp,
    CycleCount,
    QCount,
    Commit,
    Cancel { mispredict: bool },
    TraceInfo,
}

pub trait PacketSink {
    fn packet_in(&mut self, index: usize, packet: Packet) -> Response;
}

pub struct Etm4Processor {
    config: Option<Config>,
    synced: bool,
    pending: Pending,
    pkt_start: usize,
}

impl Default for Etm4Processor {
    fn default() -> Self {
        Etm4Processor {
            config: None,
            synced: false,
            pending: Pending::None,
            pkt_start: 0,
        }
    }
}

impl Etm4Processor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&mut self, config: Config) -> Result<(), crate::error::TraceError> {
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

    /// Flushes a partially-built packet as an incomplete-EOT marker.
    pub fn eot(&mut self, index: usize, sink: &mut impl PacketSink) -> Response {
        if !matches!(self.pending, Pending::None) {
            self.pending = Pending::None;
            return sink.packet_in(index, Packet::IncompleteEot);
        }
        Response::Continue
    }

    /// Consumes as many bytes of `data` as possible, emitting packets to
    /// `sink`. Returns `(bytes_consumed, response)`.
    pub fn data_in(
        &mut self,
        index: usize,
        data: &[u8],
        sink: &mut impl PacketSink,
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

    fn step(&mut self, index: usize, byte: u8, sink: &mut impl PacketSink) -> Response {
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
            Pending::Extension { zeros } => self.continue_extension(index, zeros, byte, sink),
            Pending::Continuation { kind, mut bytes } => {
                bytes.push(byte);
                self.continue_continuation(index, kind, bytes, sink)
            }
            Pending::Context {
                el,
                is64,
                non_secure,
                realm,
                ctxt_id_updated,
                vmid_updated,
                cid_bytes_needed,
                vmid_bytes_needed,
                mut bytes,
                address,
            } => {
                bytes.push(byte);
                let needed = cid_bytes_needed as usize + vmid_bytes_needed as usize;
                if bytes.len() >= needed {
                    let (cid_bytes, vmid_bytes) = bytes.split_at(cid_bytes_needed as usize);
                    let context_id = decode_le(cid_bytes);
                    let vmid = decode_le(vmid_bytes);
                    let ctx_pkt = Packet::Context {
                        el,
                        is64,
                        non_secure,
                        realm,
                        ctxt_id_updated,
                        vmid_updated,
                        context_id,
                        vmid,
                    };
                    let pkt = match address {
                        Some((addr, new_bits, isa)) => Packet::Address {
                            addr,
                            new_bits,
                            isa,
                            context: Some(Box::new(ctx_pkt)),
                        },
                        None => ctx_pkt,
                    };
                    return sink.packet_in(self.pkt_start, pkt);
                }
                self.pending = Pending::Context {
                    el,
                    is64,
                    non_secure,
                    realm,
                    ctxt_id_updated,
                    vmid_updated,
                    cid_bytes_needed,
                    vmid_bytes_needed,
                    bytes,
                    address,
                };
                Response::Continue
            }
            Pending::Address {
                isa,
                addr_bytes_needed,
                final_bits,
                mut bytes,
                with_context,
            } => {
                bytes.push(byte);
                if bytes.len() >= addr_bytes_needed as usize {
                    if with_context {
                        let (addr, new_bits) = varint::stitch_address(0, &bytes, final_bits);
                        self.start_context(isa, addr, new_bits);
                        Response::Continue
                    } else {
                        let (addr, new_bits) = varint::stitch_address(0, &bytes, final_bits);
                        sink.packet_in(
                            self.pkt_start,
                            Packet::Address {
                                addr,
                                new_bits,
                                isa,
                                context: None,
                            },
                        )
                    }
                } else {
                    self.pending = Pending::Address {
                        isa,
                        addr_bytes_needed,
                        final_bits,
                        bytes,
                        with_context,
                    };
                    Response::Continue
                }
            }
            Pending::SourceAddress {
                isa,
                addr_bytes_needed,
                mut bytes,
            } => {
                bytes.push(byte);
                if bytes.len() >= addr_bytes_needed as usize {
                    let (addr, _) = varint::stitch_address(0, &bytes, 8);
                    sink.packet_in(self.pkt_start, Packet::SourceAddress { addr, isa })
                } else {
                    self.pending = Pending::SourceAddress {
                        isa,
                        addr_bytes_needed,
                        bytes,
                    };
                    Response::Continue
                }
            }
            Pending::Exception { first_byte, mut bytes } => {
                bytes.push(byte);
                let number = (first_byte as u16 & 0x1f) | ((bytes[0] as u16 & 0x01) << 5);
                let branch_target = bytes[0] & 0x02 != 0;
                let pkt = match number {
                    0x00 => Packet::ExceptionPeReset,
                    0x18 => Packet::ExceptionTransFail { branch_target },
                    _ => Packet::Exception {
                        number,
                        branch_target,
                        m_profile: self.config.unwrap().core_profile
                            == crate::config::CoreProfile::ProfileM,
                    },
                };
                sink.packet_in(self.pkt_start, pkt)
            }
        }
    }

    fn step_unsynced(&mut self, index: usize, byte: u8, sink: &mut impl PacketSink) -> Response {
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
            // Not a valid async run; restart the zero count from scratch
            // (a non-zero, non-terminator byte never itself starts a run).
            self.pending = Pending::AsyncZeros { zeros: 0 };
            Response::Continue
        }
    }

    #[bitmatch]
    fn dispatch_header(&mut self, index: usize, header: u8, sink: &mut impl PacketSink) -> Response {
        let cfg = self.config.unwrap();
        #[bitmatch]
        match header {
            "0000_0000" => {
                self.pending = Pending::Extension { zeros: 1 };
                Response::Continue
            }
            "0000_0001" => self.pending_continuation(ContKind::TraceInfo),
            "0000_001e" => {
                let _ = e;
                self.pending_continuation(ContKind::Timestamp)
            }
            "0000_0100" => sink.packet_in(index, Packet::TraceOn),
            "0000_0101" => {
                if cfg.core_profile == crate::config::CoreProfile::ProfileM && cfg.arch_ver >= 82 {
                    sink.packet_in(index, Packet::FunctionReturn)
                } else {
                    sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "function-return requires M-profile v8.2+",
                        },
                    )
                }
            }
            "0000_0110" => {
                self.pending = Pending::Exception {
                    first_byte: 0,
                    bytes: Vec::new(),
                };
                Response::Continue
            }
            "0000_0111" => {
                if cfg.arch_ver < 5 {
                    sink.packet_in(index, Packet::ExceptionReturn)
                } else {
                    sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "exception-return header retired at major version 5",
                        },
                    )
                }
            }
            "0000_1001" => {
                if cfg.ite_enabled {
                    sink.packet_in(index, Packet::Ite)
                } else {
                    sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "ITE requires ETE >= 5.3",
                        },
                    )
                }
            }
            "0000_101t" => {
                if !cfg.transactional_trace {
                    return sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "transactional trace disabled",
                        },
                    );
                }
                sink.packet_in(
                    index,
                    if t == 0 {
                        Packet::TransactionStart
                    } else {
                        Packet::TransactionCommit
                    },
                )
            }
            "0000_11ff" => {
                let _ = f;
                self.pending_continuation(ContKind::CycleCount)
            }
            "0001_ffff" => {
                let _ = f;
                self.pending_continuation(ContKind::CycleCount)
            }
            // Data-sync markers occupy only 0x20-0x2C (f=0..12); f=13..15
            // are Commit/Cancel-format1/Mispredict-format1 and are
            // matched by the literal arms below.
            "0010_ffff" if f <= 12 => {
                let _ = f;
                sink.packet_in(index, Packet::DataSyncMarker)
            }
            "0010_1101" => self.pending_continuation(ContKind::Commit),
            "0010_111m" => sink.packet_in(
                index,
                if m == 0 {
                    Packet::Cancel { n: 1, mispredict: false }
                } else {
                    Packet::Mispredict
                },
            ),
            "0011_00ff" => {
                let _ = f;
                sink.packet_in(index, Packet::Mispredict)
            }
            "0011_01ff" => {
                let _ = f;
                sink.packet_in(index, Packet::Cancel { n: 2, mispredict: false })
            }
            "0011_1fff" => {
                let _ = f;
                self.pending_continuation(ContKind::Cancel { mispredict: false })
            }
            "0100_cccc" => {
                if !cfg.conditional_trace {
                    return sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "conditional trace disabled",
                        },
                    );
                }
                let _ = c;
                sink.packet_in(index, Packet::ConditionalInstr)
            }
            "0101_cccc" => {
                if !cfg.conditional_trace {
                    return sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "conditional trace disabled",
                        },
                    );
                }
                let _ = c;
                sink.packet_in(index, Packet::ConditionalResult)
            }
            "0110_cccc" => {
                if !cfg.conditional_trace {
                    return sink.packet_in(
                        index,
                        Packet::ReservedConfiguration {
                            header,
                            reason: "conditional trace disabled",
                        },
                    );
                }
                let _ = c;
                sink.packet_in(index, Packet::ConditionalFlush)
            }
            "0111_0nnn" => sink.packet_in(index, Packet::Event { number: n }),
            "0111_1nnn" => {
                let _ = n;
                sink.packet_in(index, Packet::Ignore)
            }
            "1000_0eee" => {
                let non_secure = eee & 0b001 != 0;
                let realm = eee & 0b010 != 0;
                let is64 = eee & 0b100 != 0;
                self.pending = Pending::Context {
                    el: 0,
                    is64,
                    non_secure,
                    realm,
                    ctxt_id_updated: cfg.context_id_bytes > 0,
                    vmid_updated: cfg.vmid_bytes > 0,
                    cid_bytes_needed: cfg.context_id_bytes,
                    vmid_bytes_needed: cfg.vmid_bytes,
                    bytes: Vec::new(),
                    address: None,
                };
                Response::Continue
            }
            "1000_1000" => sink.packet_in(index, Packet::TsMarker),
            "1001_0iii" if iii <= 2 => {
                sink.packet_in(index, Packet::ExactAddressMatch { index: iii })
            }
            "1001_0101" => {
                self.pending = Pending::Address {
                    isa: Isa::T32,
                    addr_bytes_needed: 1,
                    final_bits: 7,
                    bytes: Vec::new(),
                    with_context: false,
                };
                Response::Continue
            }
            "1001_0110" => {
                self.pending = Pending::Address {
                    isa: Isa::A32,
                    addr_bytes_needed: 1,
                    final_bits: 7,
                    bytes: Vec::new(),
                    with_context: false,
                };
                Response::Continue
            }
            "1001_1010" => {
                self.pending = Pending::Address {
                    isa: Isa::A32,
                    addr_bytes_needed: 5,
                    // 4 groups of 7 bits plus a 4-bit final byte: 32 bits total.
                    final_bits: 4,
                    bytes: Vec::new(),
                    with_context: false,
                };
                Response::Continue
            }
            "1001_1011" => {
                self.pending = Pending::Address {
                    isa: Isa::T32,
                    addr_bytes_needed: 5,
                    final_bits: 4,
                    bytes: Vec::new(),
                    with_context: false,
                };
                Response::Continue
            }
            "1001_1100" => {
                let n = if cfg.max_addr_bits > 32 { 9 } else { 5 };
                self.pending = Pending::Address {
                    isa: Isa::A64,
                    addr_bytes_needed: n,
                    // 64-bit variant's final byte is a full 8 bits (8*7+8=64);
                    // the 32-bit variant's is only 4 (4*7+4=32).
                    final_bits: if n == 9 { 8 } else { 4 },
                    bytes: Vec::new(),
                    with_context: false,
                };
                Response::Continue
            }
            "1001_1101" => {
                let n = if cfg.max_addr_bits > 32 { 9 } else { 5 };
                self.pending = Pending::Address {
                    isa: Isa::T32,
                    addr_bytes_needed: n,
                    final_bits: if n == 9 { 8 } else { 4 },
                    bytes: Vec::new(),
                    with_context: false,
                };
                Response::Continue
            }
            "1001_1110" => {
                let n = if cfg.max_addr_bits > 32 { 9 } else { 5 };
                self.pending = Pending::Address {
                    isa: Isa::A64,
                    addr_bytes_needed: n,
                    final_bits: if n == 9 { 8 } else { 4 },
                    bytes: Vec::new(),
                    with_context: true,
                };
                Response::Continue
            }
            "1010_qqqq" => {
                let _ = q;
                self.pending_continuation(ContKind::QCount)
            }
            // ETE source-address packets span the full 0xB0-0xB9 range
            // (qqqq=0..9); a 3-bit field would miss 0xB8/0xB9.
            "1011_qqqq" if q <= 9 => {
                let _ = q;
                self.pending = Pending::SourceAddress {
                    isa: Isa::A32,
                    addr_bytes_needed: if cfg.max_addr_bits > 32 { 8 } else { 4 },
                    bytes: Vec::new(),
                };
                Response::Continue
            }
            "11ff_cccc" => {
                // `f` is the 2-bit format selector (0..3); format number is
                // f+1. Formats 5/6 (3+ atoms packed with a shared flag bit)
                // aren't reachable through this 2-bit field and collapse
                // into format 4 here, a deliberate simplification of the
                // full ARM atom-format table.
                let count = atom_format_count(f + 1);
                sink.packet_in(
                    index,
                    Packet::Atom {
                        bits: c as u32 & atom_mask(count),
                        count,
                    },
                )
            }
            "hhhh_hhhh" => sink.packet_in(index, Packet::ReservedHeader { header: h }),
        }
    }

    /// Dispatches the byte following an extension header (`0x00`):
    /// further zeros extend a candidate A-Sync run, `0x80` after ≥5
    /// zeros completes it, and — since exactly one leading zero was
    /// seen — `0x03`/`0x05` are the Discard/Overflow markers. Any other
    /// byte, or a non-`0x80` byte after more than one leading zero, is a
    /// reserved extension sub-opcode.
    fn continue_extension(
        &mut self,
        index: usize,
        zeros: u32,
        byte: u8,
        sink: &mut impl PacketSink,
    ) -> Response {
        if byte == 0x00 {
            self.pending = Pending::Extension { zeros: zeros + 1 };
            return Response::Continue;
        }
        if byte == 0x80 && zeros >= 5 {
            self.pending = Pending::None;
            return sink.packet_in(self.pkt_start, Packet::Async);
        }
        if zeros == 1 && byte == 0x03 {
            self.pending = Pending::None;
            return sink.packet_in(self.pkt_start, Packet::Discard);
        }
        if zeros == 1 && byte == 0x05 {
            self.pending = Pending::None;
            return sink.packet_in(self.pkt_start, Packet::Discard);
        }
        self.pending = Pending::None;
        sink.packet_in(
            index,
            Packet::BadSequence {
                header: byte,
                reason: "reserved extension sub-opcode",
            },
        )
    }

    fn pending_continuation(&mut self, kind: ContKind) -> Response {
        self.pending = Pending::Continuation {
            kind,
            bytes: Vec::new(),
        };
        Response::Continue
    }

    fn continue_continuation(
        &mut self,
        index: usize,
        kind: ContKind,
        bytes: Vec<u8>,
        sink: &mut impl PacketSink,
    ) -> Response {
        let cfg = self.config.unwrap();
        let (value, _, complete) = match kind {
            ContKind::Timestamp => varint::read_timestamp(&bytes, cfg.ts_bits),
            _ => varint::read_continuation(&bytes, 5),
        };
        if !complete {
            self.pending = Pending::Continuation { kind, bytes };
            return Response::Continue;
        }
        let new_bits = (bytes.len() as u8) * 7;
        let pkt = match kind {
            ContKind::Timestamp => Packet::Timestamp {
                value,
                new_bits: new_bits.min(cfg.ts_bits),
            },
            ContKind::CycleCount => Packet::CycleCount { value: value as u32 },
            ContKind::QCount => Packet::Q {
                count: value as u32,
                addr: None,
            },
            ContKind::Commit => Packet::Commit { n: value as usize },
            ContKind::Cancel { mispredict } => Packet::Cancel {
                n: value as usize,
                mispredict,
            },
            ContKind::TraceInfo => Packet::TraceInfo {
                cc_threshold: 0,
                curr_spec_depth: (value & 0x1f) as u8,
                cond_enabled: value & (1 << 5) != 0,
            },
        };
        sink.packet_in(self.pkt_start, pkt)
    }

    /// Queues the context-id/VMID payload that follows an
    /// address-with-context header, remembering the just-stitched
    /// address so it can be wrapped into the eventual `Packet::Address`.
    fn start_context(&mut self, isa: Isa, addr: u64, new_bits: u8) {
        let cfg = self.config.unwrap();
        self.pending = Pending::Context {
            el: 0,
            is64: false,
            non_secure: false,
            realm: false,
            ctxt_id_updated: cfg.context_id_bytes > 0,
            vmid_updated: cfg.vmid_bytes > 0,
            cid_bytes_needed: cfg.context_id_bytes,
            vmid_bytes_needed: cfg.vmid_bytes,
            bytes: Vec::new(),
            address: Some((addr, new_bits, isa)),
        };
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
        1 => 1,
        2 => 2,
        3 => 3,
        4 => 4,
        5 => 5,
        _ => 6,
    }
}

fn atom_mask(fmt: u8) -> u32 {
    (1u32 << atom_format_count(fmt)) - 1
}
