//! Hardware boundary
//!
//! A device delivers frames of 32-bit little-endian integers: one value per
//! input channel, then the trigger word, then the wrapping sample counter.
//! [`decode_frames`] splits a byte buffer into those rows.

use crate::runtime::block::{ChannelDescriptor, RecordingMode};
use crate::runtime::errors::{StageError, StageResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::f64::consts::PI;
use std::io::Cursor;
use std::time::Instant;

/// Size of one value in a frame
pub const VALUE_SIZE: usize = 4;

/// Bytes per frame for a device with `inputs` channels
pub fn frame_size(inputs: usize) -> usize {
    (inputs + 2) * VALUE_SIZE
}

/// Decoded raw frames, one row per input channel
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawFrames {
    pub values: Vec<Vec<i32>>,
    pub trigger: Vec<u32>,
    pub counter: Vec<u32>,
}

impl RawFrames {
    pub fn samples(&self) -> usize {
        self.counter.len()
    }
}

/// Decode the complete frames at the front of `bytes`
///
/// Returns the frames and the number of bytes consumed; a trailing partial
/// frame is left for the caller to complete with the next read.
pub fn decode_frames(bytes: &[u8], inputs: usize) -> StageResult<(RawFrames, usize)> {
    let size = frame_size(inputs);
    let count = bytes.len() / size;
    let consumed = count * size;

    let mut frames = RawFrames {
        values: vec![Vec::with_capacity(count); inputs],
        trigger: Vec::with_capacity(count),
        counter: Vec::with_capacity(count),
    };
    let mut cursor = Cursor::new(&bytes[..consumed]);
    for _ in 0..count {
        for row in frames.values.iter_mut() {
            row.push(cursor.read_i32::<LittleEndian>()?);
        }
        frames.trigger.push(cursor.read_u32::<LittleEndian>()?);
        frames.counter.push(cursor.read_u32::<LittleEndian>()?);
    }
    Ok((frames, consumed))
}

/// Append frames to `out` in device byte order
pub fn encode_frames(out: &mut Vec<u8>, frames: &RawFrames) -> StageResult {
    if frames.trigger.len() != frames.samples() || frames.values.iter().any(|r| r.len() != frames.samples()) {
        return Err(StageError::Shape("raw frame rows differ in length".into()));
    }
    for i in 0..frames.samples() {
        for row in &frames.values {
            out.write_i32::<LittleEndian>(row[i])?;
        }
        out.write_u32::<LittleEndian>(frames.trigger[i])?;
        out.write_u32::<LittleEndian>(frames.counter[i])?;
    }
    Ok(())
}

/// Driver of an acquisition device
pub trait HardwareDevice: Send {
    fn name(&self) -> &str;

    /// Input channels in frame order
    fn inputs(&self) -> Vec<ChannelDescriptor>;

    /// Value of one digit in µV
    fn resolution(&self) -> f64;

    /// Configure and start acquisition at the hardware rate
    fn open(&mut self, mode: RecordingMode, sample_rate: f64) -> StageResult;

    fn close(&mut self);

    /// Append the bytes available right now to `buffer`; `Ok(0)` if none are
    fn read(&mut self, buffer: &mut Vec<u8>) -> StageResult<usize>;

    /// Impedance per input in ohm, followed by the ground electrode
    fn read_impedances(&mut self) -> StageResult<Option<Vec<f64>>>;

    /// Link errors counted by the device since it was opened
    fn error_count(&self) -> u64 {
        0
    }
}

/// Amplitude of the simulated signals in µV
const SIMULATED_AMPLITUDE: f64 = 100.0;

/// Software device producing sines on every input
///
/// Frames are produced at the configured rate in real time. Input `n` carries
/// a sine of `n` Hz (signal inputs) or a slow 1 Hz sine (auxiliary inputs);
/// test mode replaces them by a 5 Hz square wave. A trigger pulse of three
/// samples is set on bit 0 every ten seconds.
#[derive(Debug)]
pub struct SimulatedDevice {
    signal_inputs: usize,
    aux_inputs: usize,
    resolution: f64,
    mode: RecordingMode,
    sample_rate: f64,
    /// Counter of the next frame
    next_counter: u64,
    opened: Option<Instant>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(32, 8)
    }
}

impl SimulatedDevice {
    pub fn new(signal_inputs: usize, aux_inputs: usize) -> Self {
        Self {
            signal_inputs,
            aux_inputs,
            resolution: 0.1,
            mode: RecordingMode::Normal,
            sample_rate: 0.0,
            next_counter: 0,
            opened: None,
        }
    }

    fn value(&self, input: usize, counter: u64) -> f64 {
        let t = counter as f64 / self.sample_rate;
        match self.mode {
            RecordingMode::Test => {
                if (t * 5.0).fract() < 0.5 {
                    SIMULATED_AMPLITUDE
                } else {
                    -SIMULATED_AMPLITUDE
                }
            }
            _ => {
                let freq = if input < self.signal_inputs {
                    (input + 1) as f64
                } else {
                    1.0
                };
                SIMULATED_AMPLITUDE * (2.0 * PI * freq * t).sin()
            }
        }
    }

    fn trigger(&self, counter: u64) -> u32 {
        let period = (self.sample_rate * 10.0) as u64;
        if period > 0 && counter % period < 3 { 1 } else { 0 }
    }
}

impl HardwareDevice for SimulatedDevice {
    fn name(&self) -> &str {
        "Simulated amplifier"
    }

    fn inputs(&self) -> Vec<ChannelDescriptor> {
        let signal = (1..=self.signal_inputs).map(|i| ChannelDescriptor::signal(i, format!("Ch{}", i)));
        let aux = (1..=self.aux_inputs).map(|i| ChannelDescriptor::auxiliary(i, format!("Aux{}", i)));
        signal.chain(aux).collect()
    }

    fn resolution(&self) -> f64 {
        self.resolution
    }

    fn open(&mut self, mode: RecordingMode, sample_rate: f64) -> StageResult {
        if !(sample_rate > 0.0) {
            return Err(StageError::Hardware(format!("unsupported sample rate {}", sample_rate)));
        }
        self.mode = mode;
        self.sample_rate = sample_rate;
        self.next_counter = 0;
        self.opened = Some(Instant::now());
        Ok(())
    }

    fn close(&mut self) {
        self.opened = None;
    }

    fn read(&mut self, buffer: &mut Vec<u8>) -> StageResult<usize> {
        let Some(opened) = self.opened else {
            return Err(StageError::Hardware("device is not open".into()));
        };
        let due = (opened.elapsed().as_secs_f64() * self.sample_rate) as u64;
        if due <= self.next_counter {
            return Ok(0);
        }
        let inputs = self.signal_inputs + self.aux_inputs;
        let count = (due - self.next_counter) as usize;
        let mut frames = RawFrames {
            values: vec![Vec::with_capacity(count); inputs],
            trigger: Vec::with_capacity(count),
            counter: Vec::with_capacity(count),
        };
        for counter in self.next_counter..due {
            for (input, row) in frames.values.iter_mut().enumerate() {
                row.push((self.value(input, counter) / self.resolution).round() as i32);
            }
            frames.trigger.push(self.trigger(counter));
            frames.counter.push(counter as u32);
        }
        self.next_counter = due;

        let before = buffer.len();
        encode_frames(buffer, &frames)?;
        Ok(buffer.len() - before)
    }

    fn read_impedances(&mut self) -> StageResult<Option<Vec<f64>>> {
        if self.opened.is_none() {
            return Err(StageError::Hardware("device is not open".into()));
        }
        let inputs = self.signal_inputs + self.aux_inputs;
        let mut values: Vec<f64> = (0..inputs).map(|i| 2_000.0 + 1_000.0 * (i % 10) as f64).collect();
        // ground
        values.push(1_500.0);
        Ok(Some(values))
    }
}
