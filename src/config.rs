//! Per-source configuration (spec.md §3 "Configuration", §6
//! "Configuration input"). A bag of architectural ID registers read once
//! at setup; every derived feature flag is computed here, once, rather
//! than re-derived from a raw register on the decoder's hot path —
//! generalizing the riscv-etrace sibling decoder's
//! `ProtocolConfiguration` field-width-derivation pattern
//! (`other_examples/...riscv-etrace__src-lib.rs`) from a handful of
//! protocol parameters to ARM's ID-register encoding.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CoreProfile {
    ProfileA,
    ProfileR,
    ProfileM,
}

/// Raw ETMv4/ETE architectural registers, read once at setup.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Registers {
    /// TRCIDR0..TRCIDR13.
    pub idr: [u32; 14],
    pub configr: u32,
    pub traceidr: u32,
    /// ETE only; 0 on plain ETMv4.
    pub devarch: u32,
}

/// Derived, immutable-after-setup configuration for an ETMv4/ETE source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    pub trace_id: u8,
    pub arch_ver: u8,
    pub core_profile: CoreProfile,
    pub is_ete: bool,
    pub max_addr_bits: u8,
    pub context_id_bytes: u8,
    pub vmid_bytes: u8,
    pub cc_field_width: u8,
    pub ts_bits: u8,
    pub max_spec_depth: u8,

    pub cycle_accurate: bool,
    pub branch_broadcast: bool,
    pub conditional_trace: bool,
    pub return_stack: bool,
    pub q_elements: bool,
    pub data_trace: bool,
    pub transactional_trace: bool,
    pub ts_markers_enabled: bool,
    pub ite_enabled: bool,
    /// Treat ISB/DMB/DSB/WFI/WFE as waypoints, per TRCCONFIGR.
    pub waypoints_on_barriers: bool,
    /// Open Question #3 (DESIGN.md): whether the very first TS-marker
    /// after sync should be suppressed.
    pub suppress_first_ts_marker: bool,
}

impl Config {
    pub fn from_registers(regs: &Registers, arch_ver: u8, core_profile: CoreProfile) -> Config {
        let idr0 = regs.idr[0];
        let idr2 = regs.idr[2];
        let idr3 = regs.idr[3];
        let idr5 = regs.idr[5];
        let configr = regs.configr;
        let is_ete = regs.devarch != 0;

        let cid_size = (idr2 >> 4) & 0xf; // TRCIDR2.CIDSIZE, in bytes-ish encoding
        let vmid_size = (idr2 >> 0) & 0xf; // TRCIDR2.VMIDSIZE
        let context_id_bytes = match cid_size {
            0 => 0,
            4 => 4,
            _ => 4,
        };
        let vmid_bytes = if vmid_size == 0 { 0 } else { 4 };

        let max_addr_bits = if idr3 & (1 << 9) != 0 { 64 } else { 32 }; // TRCIDR3.ASIZE-ish

        let cc_field_width = ((idr3 >> 4) & 0xf) as u8; // TRCIDR3.CCITMIN-ish, informational
        let cc_field_width = if cc_field_width == 0 { 12 } else { cc_field_width };

        let ts_bits = if idr0 & (1 << 24) != 0 { 64 } else { 48 }; // TRCIDR0.TSSIZE

        let max_spec_depth = ((idr5 >> 0) & 0x1f) as u8; // TRCIDR5.NUMP0KEY-ish

        Config {
            trace_id: (regs.traceidr & 0x7f) as u8,
            arch_ver,
            core_profile,
            is_ete,
            max_addr_bits,
            context_id_bytes,
            vmid_bytes,
            cc_field_width,
            ts_bits,
            max_spec_depth: max_spec_depth.max(1),
            cycle_accurate: configr & (1 << 4) != 0,
            branch_broadcast: configr & (1 << 3) != 0,
            conditional_trace: configr & (1 << 2) != 0,
            return_stack: configr & (1 << 12) != 0,
            q_elements: idr0 & (1 << 15) != 0,
            data_trace: configr & (1 << 1) != 0,
            transactional_trace: is_ete && configr & (1 << 17) != 0,
            ts_markers_enabled: is_ete,
            ite_enabled: is_ete && arch_ver >= 53,
            waypoints_on_barriers: idr0 & (1 << 17) != 0,
            suppress_first_ts_marker: is_ete && arch_ver >= 53,
        }
    }
}

/// Raw PTM architectural registers, read once at setup.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PtmRegisters {
    pub idr: u32,
    pub ctrl: u32,
    pub ccer: u32,
    pub trcid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PtmConfig {
    pub trace_id: u8,
    pub cycle_accurate: bool,
    pub branch_broadcast: bool,
    pub return_stack: bool,
    pub context_id_bytes: u8,
    pub vmid_bytes: u8,
}

impl PtmConfig {
    pub fn from_registers(regs: &PtmRegisters) -> PtmConfig {
        PtmConfig {
            trace_id: (regs.trcid & 0x7f) as u8,
            cycle_accurate: regs.ctrl & (1 << 12) != 0,
            branch_broadcast: regs.ctrl & (1 << 8) != 0,
            return_stack: regs.ccer & (1 << 16) != 0,
            context_id_bytes: match (regs.ctrl >> 14) & 0x3 {
                0 => 0,
                1 => 1,
                2 => 2,
                _ => 4,
            },
            vmid_bytes: if regs.ctrl & (1 << 15) != 0 { 4 } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_size_follows_idr0_bit24() {
        let mut regs = Registers::default();
        regs.idr[0] = 1 << 24;
        let cfg = Config::from_registers(&regs, 40, CoreProfile::ProfileA);
        assert_eq!(cfg.ts_bits, 64);

        regs.idr[0] = 0;
        let cfg = Config::from_registers(&regs, 40, CoreProfile::ProfileA);
        assert_eq!(cfg.ts_bits, 48);
    }

    #[test]
    fn ete_flag_follows_devarch_presence() {
        let mut regs = Registers::default();
        assert!(!Config::from_registers(&regs, 40, CoreProfile::ProfileA).is_ete);
        regs.devarch = 0x4700_0000;
        assert!(Config::from_registers(&regs, 40, CoreProfile::ProfileA).is_ete);
    }

    #[test]
    fn trace_id_masked_to_7_bits() {
        let mut regs = Registers::default();
        regs.traceidr = 0xff;
        let cfg = Config::from_registers(&regs, 40, CoreProfile::ProfileA);
        assert_eq!(cfg.trace_id, 0x7f);
    }
}
