//! Timestamp enrichment (ambient, supplemental — see SPEC_FULL.md §2).
//!
//! `TraceElement::Timestamp` carries a raw tick count off the trace
//! clock. This module turns that count into a calendar instant given a
//! configured clock frequency and baseline, generalized from this
//! lineage's `Timestamp`/`TimestampedContext`/`pull_with_timestamp`
//! local+global timestamp accumulation (`itm::lib::pull_with_timestamp`)
//! down to ETMv4/ETE/PTM's single flat 48/64-bit timestamp field: there
//! is no local/global split to reconcile here, only a raw counter to
//! convert.

use chrono::{DateTime, Duration, Utc};

/// Maps a raw trace timestamp tick count to wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct ClockConfig {
    /// Trace clock frequency in Hz.
    pub freq_hz: u64,
    /// Wall-clock instant corresponding to tick 0.
    pub baseline: DateTime<Utc>,
}

impl ClockConfig {
    pub fn new(freq_hz: u64, baseline: DateTime<Utc>) -> Self {
        ClockConfig { freq_hz, baseline }
    }

    /// Converts a raw tick count into a calendar instant. Returns
    /// `None` if `freq_hz` is zero (unconfigured clock).
    pub fn to_datetime(&self, ticks: u64) -> Option<DateTime<Utc>> {
        if self.freq_hz == 0 {
            return None;
        }
        let whole_secs = ticks / self.freq_hz;
        let rem_ticks = ticks % self.freq_hz;
        let nanos = (rem_ticks as u128 * 1_000_000_000u128 / self.freq_hz as u128) as i64;
        self.baseline
            .checked_add_signed(Duration::seconds(whole_secs as i64))?
            .checked_add_signed(Duration::nanoseconds(nanos))
    }
}

/// Accumulates consecutive `TraceElement::Timestamp` ticks into an
/// always-increasing raw counter, since ETMv4/ETE/PTM timestamps carry
/// only the bits that changed since the last one
/// (`new_bits`) rather than always the full value.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampAccumulator {
    value: u64,
    seen: bool,
}

impl TimestampAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a newly observed timestamp packet's value and the
    /// number of bits it updated, returning the accumulated absolute
    /// tick count.
    pub fn update(&mut self, raw_value: u64, new_bits: u8) -> u64 {
        if !self.seen || new_bits >= 64 {
            self.value = raw_value;
        } else {
            let mask = (1u64 << new_bits) - 1;
            self.value = (self.value & !mask) | (raw_value & mask);
        }
        self.seen = true;
        self.value
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn converts_ticks_to_seconds_offset() {
        let cfg = ClockConfig::new(1_000_000, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let dt = cfg.to_datetime(2_000_000).unwrap();
        assert_eq!((dt - cfg.baseline).num_seconds(), 2);
    }

    #[test]
    fn zero_frequency_is_unconvertible() {
        let cfg = ClockConfig::new(0, Utc::now());
        assert!(cfg.to_datetime(100).is_none());
    }

    #[test]
    fn accumulator_first_value_is_taken_whole() {
        let mut acc = TimestampAccumulator::new();
        assert_eq!(acc.update(0x1234, 16), 0x1234);
    }

    #[test]
    fn accumulator_merges_partial_updates_into_prior_value() {
        let mut acc = TimestampAccumulator::new();
        acc.update(0xFFFF_FFFF, 64);
        let merged = acc.update(0x00AB, 8);
        assert_eq!(merged, 0xFFFF_FFAB);
    }
}
