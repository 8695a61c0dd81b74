//! Down-sampling with anti-aliasing
//!
//! Raw samples are grouped into bins of `divisor` samples. Only complete bins
//! are processed; the raw samples of an incomplete bin are held back and
//! prepended to the next batch, so nothing is dropped or duplicated between
//! reads. Each channel runs through a 4th order Butterworth low-pass whose
//! state persists across calls before every `divisor`-th sample is taken.

use crate::dsp::IirFilter;
use crate::runtime::errors::{StageError, StageResult};

/// Order of the anti-aliasing low-pass
pub const ANTI_ALIAS_ORDER: usize = 4;

/// Cutoff relative to the output rate
pub const ANTI_ALIAS_FACTOR: f64 = 0.333;

/// Output of one [`Decimator::process`] call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decimated {
    /// One row per channel
    pub data: Vec<Vec<f64>>,
    pub trigger: Vec<u32>,
    pub counter: Vec<u64>,
}

impl Decimated {
    pub fn samples(&self) -> usize {
        self.trigger.len()
    }
}

#[derive(Clone, Debug)]
pub struct Decimator {
    divisor: usize,
    filters: Vec<IirFilter>,
    pending: Vec<Vec<f64>>,
    pending_trigger: Vec<u32>,
    pending_counter: Vec<u64>,
}

impl Decimator {
    /// `sample_rate` is the input (hardware) rate
    pub fn new(channels: usize, sample_rate: f64, divisor: usize) -> StageResult<Self> {
        if divisor == 0 {
            return Err(StageError::Config("decimation divisor must be at least 1".into()));
        }
        let filters = if divisor > 1 {
            let cutoff = sample_rate * ANTI_ALIAS_FACTOR / divisor as f64;
            let design = IirFilter::butter_lowpass(ANTI_ALIAS_ORDER, cutoff, sample_rate)?;
            vec![design; channels]
        } else {
            Vec::new()
        };
        Ok(Self {
            divisor,
            filters,
            pending: vec![Vec::new(); channels],
            pending_trigger: Vec::new(),
            pending_counter: Vec::new(),
        })
    }

    pub fn divisor(&self) -> usize {
        self.divisor
    }

    pub fn channels(&self) -> usize {
        self.pending.len()
    }

    /// Raw samples held back for the next call
    pub fn pending_samples(&self) -> usize {
        self.pending_trigger.len()
    }

    pub fn reset(&mut self) {
        self.filters.iter_mut().for_each(IirFilter::reset);
        self.pending.iter_mut().for_each(Vec::clear);
        self.pending_trigger.clear();
        self.pending_counter.clear();
    }

    /// Decimate one batch of raw samples
    pub fn process(&mut self, data: &[Vec<f64>], trigger: &[u32], counter: &[u64]) -> StageResult<Decimated> {
        let samples = trigger.len();
        if data.len() != self.pending.len() {
            return Err(StageError::Shape(format!(
                "decimator set up for {} channels, got {}",
                self.pending.len(),
                data.len()
            )));
        }
        if counter.len() != samples || data.iter().any(|row| row.len() != samples) {
            return Err(StageError::Shape("channel, trigger and counter rows differ in length".into()));
        }

        if self.divisor == 1 {
            return Ok(Decimated {
                data: data.to_vec(),
                trigger: trigger.to_vec(),
                counter: counter.to_vec(),
            });
        }

        let d = self.divisor;
        let total = self.pending_trigger.len() + samples;
        let aligned = total / d * d;

        let mut out: Vec<Vec<f64>> = Vec::with_capacity(data.len());
        for ((row, pending), filter) in data.iter().zip(self.pending.iter_mut()).zip(self.filters.iter_mut()) {
            let mut joined = std::mem::take(pending);
            joined.extend_from_slice(row);
            *pending = joined.split_off(aligned);
            filter.filter_in_place(&mut joined);
            // first sample of each bin
            out.push(joined.into_iter().step_by(d).collect());
        }

        let mut joined_trigger = std::mem::take(&mut self.pending_trigger);
        joined_trigger.extend_from_slice(trigger);
        self.pending_trigger = joined_trigger.split_off(aligned);
        let trigger: Vec<u32> = joined_trigger
            .chunks_exact(d)
            .map(|bin| bin.iter().fold(0, |acc, &t| acc | t))
            .collect();

        let mut joined_counter = std::mem::take(&mut self.pending_counter);
        joined_counter.extend_from_slice(counter);
        self.pending_counter = joined_counter.split_off(aligned);
        let counter: Vec<u64> = joined_counter
            .into_iter()
            .step_by(d)
            .map(|c| c / d as u64)
            .collect();

        Ok(Decimated {
            data: out,
            trigger,
            counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(range: std::ops::Range<usize>) -> (Vec<Vec<f64>>, Vec<u32>, Vec<u64>) {
        let values: Vec<f64> = range.clone().map(|i| ((i * 13) % 29) as f64 - 14.0).collect();
        let counter: Vec<u64> = range.clone().map(|i| i as u64).collect();
        (vec![values.clone(), values], vec![0; range.len()], counter)
    }

    #[test]
    fn test_lossless_carry_over() {
        let mut decimator = Decimator::new(2, 5000.0, 4).unwrap();
        let mut consumed = 0;
        let mut bins = 0;
        for len in [7, 3, 11, 1, 0, 9] {
            let (data, trigger, counter) = batch(consumed..consumed + len);
            let out = decimator.process(&data, &trigger, &counter).unwrap();
            consumed += len;
            bins += out.samples();
            assert_eq!(out.data[0].len(), out.samples());
            assert!(decimator.pending_samples() < 4);
            assert_eq!(bins * 4 + decimator.pending_samples(), consumed);
        }
    }

    #[test]
    fn test_chunked_equals_whole() {
        let (data, trigger, counter) = batch(0..1000);
        let mut whole = Decimator::new(2, 10_000.0, 5).unwrap();
        let mut chunked = whole.clone();

        let expected = whole.process(&data, &trigger, &counter).unwrap();

        let split = 333;
        let head: Vec<Vec<f64>> = data.iter().map(|r| r[..split].to_vec()).collect();
        let tail: Vec<Vec<f64>> = data.iter().map(|r| r[split..].to_vec()).collect();
        let mut got = chunked.process(&head, &trigger[..split], &counter[..split]).unwrap();
        let rest = chunked.process(&tail, &trigger[split..], &counter[split..]).unwrap();
        for (row, more) in got.data.iter_mut().zip(rest.data) {
            row.extend(more);
        }
        got.counter.extend(rest.counter);

        assert_eq!(expected.samples(), 200);
        assert_eq!(got.data[0].len(), 200);
        assert_eq!(got.counter, expected.counter);
        for (e, g) in expected.data[0].iter().zip(&got.data[0]) {
            assert!((e - g).abs() < 1e-9, "{} != {}", e, g);
        }
    }

    #[test]
    fn test_trigger_is_or_reduced_per_bin() {
        let mut decimator = Decimator::new(1, 1000.0, 4).unwrap();
        let trigger = vec![0, 0, 0, 0, 0, 0x10, 0, 0x01, 0, 0, 0, 0];
        let counter: Vec<u64> = (0..12).collect();
        let out = decimator.process(&[vec![0.0; 12]], &trigger, &counter).unwrap();
        assert_eq!(out.trigger, vec![0, 0x11, 0]);
        assert_eq!(out.counter, vec![0, 1, 2]);
    }

    #[test]
    fn test_reset_restarts_bins_at_the_next_batch() {
        let mut decimator = Decimator::new(1, 1000.0, 4).unwrap();
        let out = decimator.process(&[vec![0.0; 6]], &[0; 6], &[0, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(out.counter, vec![0]);
        assert_eq!(decimator.pending_samples(), 2);

        decimator.reset();
        assert_eq!(decimator.pending_samples(), 0);
        let counter: Vec<u64> = (100..108).collect();
        let out = decimator.process(&[vec![0.0; 8]], &[0; 8], &counter).unwrap();
        // bins start at the first sample after the reset, not at the dropped remainder
        assert_eq!(out.counter, vec![25, 26]);
    }

    #[test]
    fn test_divisor_one_is_passthrough() {
        let mut decimator = Decimator::new(2, 500.0, 1).unwrap();
        let (data, trigger, counter) = batch(0..10);
        let out = decimator.process(&data, &trigger, &counter).unwrap();
        assert_eq!(out.data, data);
        assert_eq!(out.counter, counter);
        assert_eq!(decimator.pending_samples(), 0);
    }

    #[test]
    fn test_constant_signal_settles_to_its_level() {
        let mut decimator = Decimator::new(1, 10_000.0, 10).unwrap();
        let n = 20_000;
        let out = decimator
            .process(&[vec![3.0; n]], &vec![0; n], &(0..n as u64).collect::<Vec<_>>())
            .unwrap();
        assert!((out.data[0].last().unwrap() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_shape_errors() {
        let mut decimator = Decimator::new(2, 1000.0, 2).unwrap();
        assert!(decimator.process(&[vec![0.0; 4]], &[0; 4], &[0; 4]).is_err());
        assert!(decimator.process(&[vec![0.0; 4], vec![0.0; 3]], &[0; 4], &[0; 4]).is_err());
        assert!(Decimator::new(2, 1000.0, 0).is_err());
    }
}
