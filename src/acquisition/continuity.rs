//! Sample counter continuity
//!
//! The hardware delivers a 32-bit wrapping sample counter. [`ContinuityTracker`]
//! turns it into a monotonic 64-bit counter; [`MissingSampleMonitor`] decides
//! how loudly gaps in that counter are reported.

use crate::runtime::errors::{Severity, StageError, StageResult};
use std::time::{Duration, Instant};

/// Period of the raw hardware counter
pub const COUNTER_PERIOD: u64 = 1 << 32;

/// Extends a wrapping 32-bit counter to 64 bits
#[derive(Clone, Debug, Default)]
pub struct ContinuityTracker {
    last_raw: Option<u32>,
    wrap_offset: u64,
}

impl ContinuityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous run
    pub fn reset(&mut self) {
        self.last_raw = None;
        self.wrap_offset = 0;
    }

    pub fn wrap_offset(&self) -> u64 {
        self.wrap_offset
    }

    /// Convert one batch of raw counter values
    ///
    /// A value smaller than its predecessor marks a wrap; the offset applies
    /// from that index on. A second wrap inside the same batch means more than
    /// a full counter period was lost and is refused; the tracker state is left
    /// untouched in that case.
    pub fn extend(&mut self, raw: &[u32]) -> StageResult<Vec<u64>> {
        let mut last = self.last_raw;
        let mut offset = self.wrap_offset;
        let mut wrapped = false;
        let mut out = Vec::with_capacity(raw.len());

        for (i, &value) in raw.iter().enumerate() {
            if let Some(previous) = last
                && value < previous
            {
                if wrapped {
                    return Err(StageError::Continuity(format!(
                        "counter wrapped twice within one batch (index {}, {} -> {})",
                        i, previous, value
                    )));
                }
                wrapped = true;
                offset += COUNTER_PERIOD;
            }
            out.push(offset + value as u64);
            last = Some(value);
        }

        self.last_raw = last;
        self.wrap_offset = offset;
        Ok(out)
    }
}

/// Window in which missing samples are accumulated
pub const MISSING_WINDOW: Duration = Duration::from_secs(30);

/// Missing samples within one window tolerated before escalating
pub const MISSING_THRESHOLD: u64 = 2;

/// Accounting of lost samples over a sliding window
///
/// Short bursts are only logged; once the samples lost since the last report
/// inside the window exceed the threshold the loss is escalated to `Notify`.
#[derive(Clone, Debug)]
pub struct MissingSampleMonitor {
    window: Duration,
    threshold: u64,
    interval: u64,
    total: u64,
    last_loss: Option<Instant>,
}

impl Default for MissingSampleMonitor {
    fn default() -> Self {
        Self::new(MISSING_WINDOW, MISSING_THRESHOLD)
    }
}

impl MissingSampleMonitor {
    pub fn new(window: Duration, threshold: u64) -> Self {
        Self {
            window,
            threshold,
            interval: 0,
            total: 0,
            last_loss: None,
        }
    }

    pub fn reset(&mut self) {
        self.interval = 0;
        self.total = 0;
        self.last_loss = None;
    }

    /// Samples lost since the last reset
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Account for `missing` samples observed at `now`
    ///
    /// Returns `Notify` when the loss has to be shown to the user and
    /// `Ignorable` when it only goes to the log.
    pub fn record(&mut self, missing: u64, now: Instant) -> Severity {
        self.total += missing;
        match self.last_loss {
            Some(last) if now.duration_since(last) <= self.window => self.interval += missing,
            _ => self.interval = missing,
        }
        self.last_loss = Some(now);

        if self.interval > self.threshold {
            self.interval = 0;
            Severity::Notify
        } else {
            Severity::Ignorable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_properties(raw: &[u32], out: &[u64]) {
        assert_eq!(raw.len(), out.len());
        for w in out.windows(2) {
            assert!(w[1] >= w[0], "counter went backwards: {:?}", w);
        }
        for (r, o) in raw.iter().zip(out) {
            assert_eq!(o % COUNTER_PERIOD, *r as u64);
        }
    }

    #[test]
    fn test_counter_is_monotonic_across_batches() {
        let mut tracker = ContinuityTracker::new();
        let first = [u32::MAX - 2, u32::MAX - 1];
        let second = [u32::MAX, 0, 1, 2];

        let a = tracker.extend(&first).unwrap();
        let b = tracker.extend(&second).unwrap();
        check_properties(&first, &a);
        check_properties(&second, &b);
        assert!(b[0] > a[1]);
        assert_eq!(b[1], COUNTER_PERIOD);
        assert_eq!(tracker.wrap_offset(), COUNTER_PERIOD);
    }

    #[test]
    fn test_offset_starts_at_the_wrap_index() {
        let mut tracker = ContinuityTracker::new();
        let out = tracker.extend(&[u32::MAX - 1, u32::MAX, 0, 1]).unwrap();
        assert_eq!(out[0], (u32::MAX - 1) as u64);
        assert_eq!(out[1], u32::MAX as u64);
        assert_eq!(out[2], COUNTER_PERIOD);
        assert_eq!(out[3], COUNTER_PERIOD + 1);
    }

    #[test]
    fn test_wrap_at_batch_boundary() {
        let mut tracker = ContinuityTracker::new();
        tracker.extend(&[10, 20, u32::MAX]).unwrap();
        let out = tracker.extend(&[0, 5]).unwrap();
        assert_eq!(out, vec![COUNTER_PERIOD, COUNTER_PERIOD + 5]);
    }

    #[test]
    fn test_double_wrap_in_one_batch_is_fatal() {
        let mut tracker = ContinuityTracker::new();
        tracker.extend(&[100]).unwrap();
        let result = tracker.extend(&[u32::MAX, 3, u32::MAX - 5, 2]);
        let err = result.unwrap_err();
        assert!(matches!(err, StageError::Continuity(_)));
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(tracker.wrap_offset(), 0, "a refused batch leaves the state alone");
    }

    #[test]
    fn test_first_value_zero_is_not_a_wrap() {
        let mut tracker = ContinuityTracker::new();
        assert_eq!(tracker.extend(&[0, 1, 2]).unwrap(), vec![0, 1, 2]);
        tracker.reset();
        assert_eq!(tracker.extend(&[7]).unwrap(), vec![7]);
    }

    #[test]
    fn test_missing_sample_escalation() {
        let mut monitor = MissingSampleMonitor::default();
        let t0 = Instant::now();

        assert_eq!(monitor.record(1, t0), Severity::Ignorable);
        assert_eq!(monitor.record(1, t0 + Duration::from_secs(1)), Severity::Ignorable);
        // third sample within the window crosses the threshold
        assert_eq!(monitor.record(1, t0 + Duration::from_secs(2)), Severity::Notify);
        // interval restarted after the report
        assert_eq!(monitor.record(2, t0 + Duration::from_secs(3)), Severity::Ignorable);
        assert_eq!(monitor.total(), 5);
    }

    #[test]
    fn test_missing_samples_outside_window_restart_the_interval() {
        let mut monitor = MissingSampleMonitor::default();
        let t0 = Instant::now();
        assert_eq!(monitor.record(2, t0), Severity::Ignorable);
        assert_eq!(monitor.record(2, t0 + Duration::from_secs(40)), Severity::Ignorable);
        assert_eq!(monitor.record(5, t0 + Duration::from_secs(41)), Severity::Notify);
    }
}
