//! Core data types flowing through the pipeline
//!
//! A [`StreamBlock`] is one acquisition cycle worth of samples plus the
//! metadata describing them. Cloning a block is cheap: the numeric buffers
//! (samples, trigger, counter) are shared through `Arc` and only copied when a
//! holder mutates them (`Arc::make_mut`), while descriptor and marker lists are
//! always deep-copied so each consumer may rewrite them independently.

use super::errors::{StageError, StageResult};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Impedance value reported for an electrode that could not be measured (ohm)
pub const IMPEDANCE_INVALID: f64 = 999_900.0;

/// Column indices of an impedance block
pub const IMPEDANCE_DATA: usize = 0;
pub const IMPEDANCE_REF: usize = 1;
pub const IMPEDANCE_GND: usize = 2;

/// Logical group of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelGroup {
    Signal,
    Auxiliary,
    Derived,
}

/// Per-channel filter configuration; a cutoff of 0 disables that filter
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub low_pass: f64,
    pub high_pass: f64,
    pub notch: bool,
}

/// Which impedance values a channel delivers in impedance mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpedanceSlots {
    pub data: bool,
    pub reference: bool,
    pub ground: bool,
}

/// Description of one data row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDescriptor {
    /// Hardware input number (1-based)
    pub input: usize,
    /// Group of the hardware input
    pub input_group: ChannelGroup,
    /// Group the channel is currently assigned to
    pub group: ChannelGroup,
    pub enabled: bool,
    pub name: String,
    /// Name of the reference this channel is measured against
    pub reference_name: String,
    pub filter: FilterSettings,
    pub is_reference: bool,
    pub unit: String,
    pub impedance: ImpedanceSlots,
}

impl Default for ChannelDescriptor {
    fn default() -> Self {
        Self {
            input: 0,
            input_group: ChannelGroup::Signal,
            group: ChannelGroup::Signal,
            enabled: true,
            name: String::new(),
            reference_name: String::new(),
            filter: FilterSettings::default(),
            is_reference: false,
            unit: "µV".to_string(),
            impedance: ImpedanceSlots::default(),
        }
    }
}

impl ChannelDescriptor {
    /// Create a signal channel with the given input number and name
    pub fn signal(input: usize, name: impl Into<String>) -> Self {
        Self {
            input,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create an auxiliary channel with the given input number and name
    pub fn auxiliary(input: usize, name: impl Into<String>) -> Self {
        Self {
            input,
            input_group: ChannelGroup::Auxiliary,
            group: ChannelGroup::Auxiliary,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Identity of the channel across reconfigurations
    pub fn key(&self) -> (ChannelGroup, usize, ChannelGroup) {
        (self.input_group, self.input, self.group)
    }
}

/// Acquisition mode carried by every block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    #[default]
    Normal,
    Test,
    Impedance,
}

/// Annotation attached to a sample position
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    /// Sample position (stream absolute once it leaves the source)
    pub position: i64,
    pub points: u32,
    /// 0 = all channels
    pub channel: i32,
    pub kind: String,
    pub description: String,
    /// Marker carries a wall-clock timestamp
    pub with_date: bool,
    pub timestamp: Option<DateTime<Local>>,
}

impl Marker {
    pub fn new(position: i64, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            position,
            points: 1,
            channel: 0,
            kind: kind.into(),
            description: description.into(),
            with_date: false,
            timestamp: None,
        }
    }

    /// Attach the current wall-clock time
    pub fn dated(mut self, time: DateTime<Local>) -> Self {
        self.with_date = true;
        self.timestamp = Some(time);
        self
    }
}

/// Channel-major sample matrix with a shared backing buffer
#[derive(Clone, Debug, PartialEq)]
pub struct SampleMatrix {
    rows: usize,
    cols: usize,
    data: Arc<Vec<f64>>,
}

impl SampleMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: Arc::new(vec![0.0; rows * cols]),
        }
    }

    /// Build from a flat channel-major buffer
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> StageResult<Self> {
        if data.len() != rows * cols {
            return Err(StageError::Shape(format!(
                "buffer of {} values cannot hold {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            rows,
            cols,
            data: Arc::new(data),
        })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> StageResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(StageError::Shape("rows differ in length".to_string()));
        }
        let n = rows.len();
        Self::from_vec(n, cols, rows.into_iter().flatten().collect())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Mutable access to one row; copies the buffer if it is shared
    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        let cols = self.cols;
        &mut Arc::make_mut(&mut self.data)[index * cols..(index + 1) * cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// True when another holder shares the same buffer
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    /// New matrix containing only the given rows, in the given order
    pub fn select_rows(&self, indices: &[usize]) -> SampleMatrix {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        SampleMatrix {
            rows: indices.len(),
            cols: self.cols,
            data: Arc::new(data),
        }
    }

    /// Sample-major (interleaved) copy: all channels of sample 0, then sample 1, ...
    pub fn interleaved(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.data.len());
        for c in 0..self.cols {
            for r in 0..self.rows {
                out.push(self.get(r, c));
            }
        }
        out
    }
}

/// Processing time accumulated while a block travels the chain
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub processing_time: Duration,
}

/// The unit of data passed between stages
#[derive(Clone, Debug)]
pub struct StreamBlock {
    pub sample_rate: f64,
    /// Shared; copy-on-write through [`SampleMatrix::row_mut`]
    pub data: SampleMatrix,
    /// Trigger bit mask per sample (shared)
    pub trigger: Arc<Vec<u32>>,
    /// Monotonic sample counter per sample (shared)
    pub counter: Arc<Vec<u64>>,
    /// One descriptor per data row (owned per copy)
    pub channels: Vec<ChannelDescriptor>,
    /// Owned per copy
    pub markers: Vec<Marker>,
    pub mode: RecordingMode,
    /// Total samples produced by the source since start
    pub sample_counter: u64,
    pub block_time: DateTime<Local>,
    pub telemetry: Telemetry,
}

impl Default for StreamBlock {
    fn default() -> Self {
        Self::empty(Vec::new(), 0.0)
    }
}

impl StreamBlock {
    /// Block with a channel layout but no samples; used for configuration updates
    pub fn empty(channels: Vec<ChannelDescriptor>, sample_rate: f64) -> Self {
        Self {
            sample_rate,
            data: SampleMatrix::zeros(channels.len(), 0),
            trigger: Arc::new(Vec::new()),
            counter: Arc::new(Vec::new()),
            channels,
            markers: Vec::new(),
            mode: RecordingMode::Normal,
            sample_counter: 0,
            block_time: Local::now(),
            telemetry: Telemetry::default(),
        }
    }

    /// Assemble a data block and check its shape
    pub fn new(
        sample_rate: f64,
        channels: Vec<ChannelDescriptor>,
        data: SampleMatrix,
        trigger: Vec<u32>,
        counter: Vec<u64>,
    ) -> StageResult<Self> {
        let block = Self {
            sample_rate,
            data,
            trigger: Arc::new(trigger),
            counter: Arc::new(counter),
            channels,
            markers: Vec::new(),
            mode: RecordingMode::Normal,
            sample_counter: 0,
            block_time: Local::now(),
            telemetry: Telemetry::default(),
        };
        block.validate()?;
        Ok(block)
    }

    /// Impedance block: one row per channel, columns DATA, REF and GND in ohm
    pub fn impedance(channels: Vec<ChannelDescriptor>, values: SampleMatrix) -> StageResult<Self> {
        let mut block = Self::new(0.0, channels, values, vec![0; 3], vec![0; 3])?;
        block.mode = RecordingMode::Impedance;
        Ok(block)
    }

    /// Number of samples per channel
    pub fn samples(&self) -> usize {
        self.data.cols()
    }

    pub fn validate(&self) -> StageResult {
        if self.channels.len() != self.data.rows() {
            return Err(StageError::Shape(format!(
                "{} channel descriptors for {} data rows",
                self.channels.len(),
                self.data.rows()
            )));
        }
        if self.trigger.len() != self.data.cols() || self.counter.len() != self.data.cols() {
            return Err(StageError::Shape(format!(
                "trigger ({}) and counter ({}) rows must match {} samples",
                self.trigger.len(),
                self.counter.len(),
                self.data.cols()
            )));
        }
        Ok(())
    }

    /// Mutable trigger row; copies the buffer if it is shared
    pub fn trigger_mut(&mut self) -> &mut Vec<u32> {
        Arc::make_mut(&mut self.trigger)
    }

    /// Replace samples and descriptors together
    pub fn replace_channels(
        &mut self,
        channels: Vec<ChannelDescriptor>,
        data: SampleMatrix,
    ) -> StageResult {
        self.channels = channels;
        self.data = data;
        self.validate()
    }
}

impl fmt::Display for StreamBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "StreamBlock[{:?}, {} ch x {} @ {} Hz, markers={}]",
            self.mode,
            self.data.rows(),
            self.data.cols(),
            self.sample_rate,
            self.markers.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_channel_block() -> StreamBlock {
        let channels = vec![
            ChannelDescriptor::signal(1, "Fp1"),
            ChannelDescriptor::signal(2, "Fp2"),
        ];
        let data = SampleMatrix::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        StreamBlock::new(500.0, channels, data, vec![0, 1, 0], vec![10, 11, 12]).unwrap()
    }

    #[test]
    fn test_shape_invariants() {
        let channels = vec![ChannelDescriptor::signal(1, "Cz")];
        let data = SampleMatrix::zeros(2, 4);
        let result = StreamBlock::new(100.0, channels, data, vec![0; 4], vec![0; 4]);
        assert!(matches!(result, Err(StageError::Shape(_))));

        let channels = vec![ChannelDescriptor::signal(1, "Cz")];
        let data = SampleMatrix::zeros(1, 4);
        let result = StreamBlock::new(100.0, channels, data, vec![0; 3], vec![0; 4]);
        assert!(result.is_err(), "trigger length must match sample count");
    }

    #[test]
    fn test_clone_shares_buffers_but_not_metadata() {
        let block = two_channel_block();
        let mut copy = block.clone();
        assert!(block.data.is_shared());
        assert!(Arc::ptr_eq(&block.counter, &copy.counter));

        copy.channels[0].name = "renamed".to_string();
        copy.markers.push(Marker::new(11, "Stimulus", "S  1"));
        assert_eq!(block.channels[0].name, "Fp1");
        assert!(block.markers.is_empty());

        copy.data.row_mut(0)[0] = 99.0;
        assert_eq!(block.data.get(0, 0), 1.0, "original buffer must not change");
        assert_eq!(copy.data.get(0, 0), 99.0);
    }

    #[test]
    fn test_interleaved_and_select() {
        let block = two_channel_block();
        assert_eq!(block.data.interleaved(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let second = block.data.select_rows(&[1]);
        assert_eq!(second.rows(), 1);
        assert_eq!(second.row(0), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_channel_key() {
        let a = ChannelDescriptor::signal(3, "C3");
        let b = ChannelDescriptor::auxiliary(3, "AUX3");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), (ChannelGroup::Signal, 3, ChannelGroup::Signal));
    }
}
