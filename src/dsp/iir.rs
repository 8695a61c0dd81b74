//! Butterworth IIR design and stateful filtering
//!
//! Filters are designed from the analog Butterworth prototype with real
//! polynomial arithmetic and mapped to the z-plane with the bilinear
//! transform (pre-warped band edges). Low-pass and high-pass designs become
//! one second order section per prototype pole pair; a band-stop turns every
//! prototype pole pair into a fourth order section.
//!
//! Each section runs in Direct Form II Transposed and keeps its delay line
//! between calls, so a signal filtered in arbitrary chunks gives the same
//! output as filtering it in one piece.

use crate::runtime::errors::{StageError, StageResult};
use std::f64::consts::PI;

/// One IIR section: H(z) = B(z^-1) / A(z^-1), normalized so `a[0] == 1`
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    b: Vec<f64>,
    a: Vec<f64>,
    /// Delay line, one entry per order
    z: Vec<f64>,
}

impl Section {
    pub fn new(mut b: Vec<f64>, mut a: Vec<f64>) -> StageResult<Self> {
        let a0 = a.first().copied().unwrap_or(0.0);
        if a0 == 0.0 || !a0.is_finite() {
            return Err(StageError::Config("filter denominator must start with a non-zero coefficient".into()));
        }
        let order = a.len().max(b.len()).saturating_sub(1);
        b.resize(order + 1, 0.0);
        a.resize(order + 1, 0.0);
        for c in b.iter_mut().chain(a.iter_mut()) {
            *c /= a0;
        }
        Ok(Self {
            b,
            a,
            z: vec![0.0; order],
        })
    }

    pub fn order(&self) -> usize {
        self.z.len()
    }

    pub fn numerator(&self) -> &[f64] {
        &self.b
    }

    pub fn denominator(&self) -> &[f64] {
        &self.a
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let n = self.z.len();
        if n == 0 {
            return self.b[0] * x;
        }
        let y = self.b[0] * x + self.z[0];
        for i in 0..n - 1 {
            self.z[i] = self.b[i + 1] * x - self.a[i + 1] * y + self.z[i + 1];
        }
        self.z[n - 1] = self.b[n] * x - self.a[n] * y;
        y
    }

    pub fn reset(&mut self) {
        self.z.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Cascade of sections with persistent state
#[derive(Clone, Debug, PartialEq)]
pub struct IirFilter {
    sections: Vec<Section>,
}

impl IirFilter {
    pub fn new(sections: Vec<Section>) -> Self {
        Self { sections }
    }

    /// Butterworth low-pass of the given order, cutoff in Hz
    pub fn butter_lowpass(order: usize, cutoff: f64, sample_rate: f64) -> StageResult<Self> {
        let w = prewarp(cutoff, sample_rate)?;
        let sections = prototype(order)?
            .into_iter()
            .map(|d| {
                let m = d.len() - 1;
                let den: Vec<f64> = d.iter().enumerate().map(|(k, c)| c * w.powi((m - k) as i32)).collect();
                let num = vec![w.powi(m as i32)];
                bilinear(&num, &den)
            })
            .collect::<StageResult<Vec<_>>>()?;
        Ok(Self::new(sections))
    }

    /// Butterworth high-pass of the given order, cutoff in Hz
    pub fn butter_highpass(order: usize, cutoff: f64, sample_rate: f64) -> StageResult<Self> {
        let w = prewarp(cutoff, sample_rate)?;
        let sections = prototype(order)?
            .into_iter()
            .map(|d| {
                let m = d.len() - 1;
                let mut den = vec![0.0; m + 1];
                for (k, c) in d.iter().enumerate() {
                    den[m - k] = c * w.powi(k as i32);
                }
                let mut num = vec![0.0; m + 1];
                num[m] = 1.0;
                bilinear(&num, &den)
            })
            .collect::<StageResult<Vec<_>>>()?;
        Ok(Self::new(sections))
    }

    /// Butterworth band-stop of the given prototype order between two edges in Hz
    pub fn butter_bandstop(order: usize, low: f64, high: f64, sample_rate: f64) -> StageResult<Self> {
        if low >= high {
            return Err(StageError::Config(format!(
                "band-stop edges must be increasing ({} >= {})",
                low, high
            )));
        }
        let w1 = prewarp(low, sample_rate)?;
        let w2 = prewarp(high, sample_rate)?;
        let bandwidth = w2 - w1;
        // s^2 + w0^2
        let resonator = [w1 * w2, 0.0, 1.0];

        let sections = prototype(order)?
            .into_iter()
            .map(|d| {
                let m = d.len() - 1;
                let num = poly_pow(&resonator, m);
                let mut den = vec![0.0];
                for (k, c) in d.iter().enumerate() {
                    let mut term = poly_mul(&poly_monomial(k), &poly_pow(&resonator, m - k));
                    let scale = c * bandwidth.powi(k as i32);
                    term.iter_mut().for_each(|t| *t *= scale);
                    den = poly_add(&den, &term);
                }
                bilinear(&num, &den)
            })
            .collect::<StageResult<Vec<_>>>()?;
        Ok(Self::new(sections))
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        self.sections.iter_mut().fold(x, |acc, s| s.process(acc))
    }

    /// Filter a buffer in place, continuing from the stored state
    pub fn filter_in_place(&mut self, signal: &mut [f64]) {
        for sample in signal.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    pub fn filter(&mut self, signal: &[f64]) -> Vec<f64> {
        signal.iter().map(|&x| self.process(x)).collect()
    }

    pub fn reset(&mut self) {
        self.sections.iter_mut().for_each(Section::reset);
    }
}

/// Pre-warped analog frequency for the bilinear transform with s = (1 - z^-1) / (1 + z^-1)
fn prewarp(frequency: f64, sample_rate: f64) -> StageResult<f64> {
    if !(sample_rate > 0.0) {
        return Err(StageError::Config(format!("invalid sample rate {}", sample_rate)));
    }
    if !(frequency > 0.0 && frequency < sample_rate / 2.0) {
        return Err(StageError::Config(format!(
            "frequency {} Hz outside (0, {}) Hz",
            frequency,
            sample_rate / 2.0
        )));
    }
    Ok((PI * frequency / sample_rate).tan())
}

/// Normalized Butterworth prototype as real factors (ascending powers of s)
fn prototype(order: usize) -> StageResult<Vec<Vec<f64>>> {
    if order == 0 {
        return Err(StageError::Config("filter order must be at least 1".into()));
    }
    let n = order as f64;
    let mut factors: Vec<Vec<f64>> = (0..order / 2)
        .map(|k| {
            let q = 2.0 * (PI * (2 * k + 1) as f64 / (2.0 * n)).sin();
            vec![1.0, q, 1.0]
        })
        .collect();
    if order % 2 == 1 {
        factors.push(vec![1.0, 1.0]);
    }
    Ok(factors)
}

/// Map analog N(s)/D(s) to the z-plane
fn bilinear(num: &[f64], den: &[f64]) -> StageResult<Section> {
    let n = den.len().max(num.len()) - 1;
    let minus = [1.0, -1.0];
    let plus = [1.0, 1.0];
    let map = |p: &[f64]| {
        let mut out = vec![0.0; n + 1];
        for (k, &c) in p.iter().enumerate() {
            if c == 0.0 {
                continue;
            }
            let term = poly_mul(&poly_pow(&minus, k), &poly_pow(&plus, n - k));
            for (o, t) in out.iter_mut().zip(term) {
                *o += c * t;
            }
        }
        out
    };
    Section::new(map(num), map(den))
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        for (j, &y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn poly_pow(base: &[f64], exponent: usize) -> Vec<f64> {
    (0..exponent).fold(vec![1.0], |acc, _| poly_mul(&acc, base))
}

fn poly_add(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len().max(b.len())];
    for (i, &x) in a.iter().enumerate() {
        out[i] += x;
    }
    for (i, &y) in b.iter().enumerate() {
        out[i] += y;
    }
    out
}

/// s^k
fn poly_monomial(k: usize) -> Vec<f64> {
    let mut out = vec![0.0; k + 1];
    out[k] = 1.0;
    out
}
