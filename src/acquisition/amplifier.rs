//! Amplifier source stage
//!
//! Polls a [`HardwareDevice`], extends the sample counter, down-samples and
//! scales the raw values to µV and hands out one block per poll. In impedance
//! mode the device is asked for electrode impedances once per second instead.

use super::continuity::ContinuityTracker;
use super::decimation::Decimator;
use super::device::{HardwareDevice, decode_frames};
use crate::runtime::block::{ChannelDescriptor, ChannelGroup, RecordingMode, SampleMatrix, StreamBlock};
use crate::runtime::block::{IMPEDANCE_DATA, IMPEDANCE_GND};
use crate::runtime::errors::{StageError, StageResult};
use crate::runtime::event::{EventKind, EventSink, ModuleEvent};
use crate::runtime::node::{LifecycleRequest, Module, ModuleContext, Output};
use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Interval between impedance readings
pub const IMPEDANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplifierSettings {
    /// Output sample rate in Hz
    pub sample_rate: f64,
    /// The device runs at `sample_rate * divisor`
    pub divisor: usize,
    pub mode: RecordingMode,
    /// Blocks dropped after start while the device settles
    pub skip_blocks: usize,
    /// Consecutive empty polls before the link counts as broken
    pub timeout_polls: u32,
    /// Overrides for the device inputs, matched by group and input number
    pub channels: Vec<ChannelDescriptor>,
}

impl Default for AmplifierSettings {
    fn default() -> Self {
        Self {
            sample_rate: 500.0,
            divisor: 1,
            mode: RecordingMode::Normal,
            skip_blocks: 5,
            timeout_polls: 100,
            channels: Vec::new(),
        }
    }
}

pub struct Amplifier {
    device: Box<dyn HardwareDevice>,
    settings: AmplifierSettings,
    events: EventSink,
    /// Selected channels and their column in the device frame
    layout: Vec<ChannelDescriptor>,
    columns: Vec<usize>,
    inputs: usize,
    tracker: ContinuityTracker,
    decimator: Option<Decimator>,
    /// Bytes of an incomplete frame from the previous read
    partial: Vec<u8>,
    skip: usize,
    empty_polls: u32,
    sample_counter: u64,
    start_time: DateTime<Local>,
    last_impedance: Option<Instant>,
}

impl Amplifier {
    pub fn new(device: Box<dyn HardwareDevice>, settings: AmplifierSettings) -> StageResult<Self> {
        if settings.divisor == 0 || !(settings.sample_rate > 0.0) {
            return Err(StageError::Config(format!(
                "invalid sample rate {} Hz / divisor {}",
                settings.sample_rate, settings.divisor
            )));
        }
        let mut amplifier = Self {
            device,
            settings,
            events: EventSink::default(),
            layout: Vec::new(),
            columns: Vec::new(),
            inputs: 0,
            tracker: ContinuityTracker::new(),
            decimator: None,
            partial: Vec::new(),
            skip: 0,
            empty_polls: 0,
            sample_counter: 0,
            start_time: Local::now(),
            last_impedance: None,
        };
        amplifier.select_channels();
        Ok(amplifier)
    }

    pub fn from_settings(device: Box<dyn HardwareDevice>, settings: &Value) -> StageResult<Self> {
        Self::new(device, parse_settings(settings)?)
    }

    pub fn mode(&self) -> RecordingMode {
        self.settings.mode
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.layout
    }

    fn hardware_rate(&self) -> f64 {
        self.settings.sample_rate * self.settings.divisor as f64
    }

    /// Enabled and reference inputs, with the settings overrides applied
    fn select_channels(&mut self) {
        let inputs = self.device.inputs();
        self.inputs = inputs.len();
        self.layout.clear();
        self.columns.clear();
        for (column, input) in inputs.into_iter().enumerate() {
            let channel = self
                .settings
                .channels
                .iter()
                .find(|c| c.input_group == input.input_group && c.input == input.input)
                .cloned()
                .unwrap_or(input);
            if channel.enabled || channel.is_reference {
                self.layout.push(channel);
                self.columns.push(column);
            }
        }
        if self.settings.mode == RecordingMode::Impedance {
            for channel in self.layout.iter_mut() {
                let signal = channel.group == ChannelGroup::Signal;
                channel.impedance.data = signal;
                channel.impedance.ground = signal;
                channel.impedance.reference = false;
            }
        }
    }

    fn read_impedances(&mut self) -> StageResult<Output> {
        if self
            .last_impedance
            .is_some_and(|t| t.elapsed() < IMPEDANCE_INTERVAL)
        {
            return Ok(Output::NoData);
        }
        self.last_impedance = Some(Instant::now());

        let Some(values) = self.device.read_impedances()? else {
            return Ok(Output::NoData);
        };
        let ground = values.last().copied().unwrap_or(0.0);
        let mut matrix = SampleMatrix::zeros(self.layout.len(), 3);
        for (row, (channel, &column)) in self.layout.iter().zip(&self.columns).enumerate() {
            if channel.impedance.data {
                let cells = matrix.row_mut(row);
                cells[IMPEDANCE_DATA] = values.get(column).copied().unwrap_or(0.0);
                cells[IMPEDANCE_GND] = ground;
            }
        }
        let mut block = StreamBlock::impedance(self.layout.clone(), matrix)?;
        block.sample_rate = self.settings.sample_rate;
        Ok(Output::Block(block))
    }

    fn read_data(&mut self) -> StageResult<Output> {
        let read = self.device.read(&mut self.partial)?;
        if read == 0 {
            self.empty_polls += 1;
            if self.empty_polls > self.settings.timeout_polls {
                self.empty_polls = 0;
                return Err(StageError::Hardware("connection to hardware is broken!".into()));
            }
            return Ok(Output::NoData);
        }
        self.empty_polls = 0;

        let (frames, consumed) = decode_frames(&self.partial, self.inputs)?;
        self.partial.drain(..consumed);
        if frames.samples() == 0 {
            return Ok(Output::NoData);
        }
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(Output::NoData);
        }

        let counter = self.tracker.extend(&frames.counter)?;
        let resolution = self.device.resolution();
        let rows: Vec<Vec<f64>> = self
            .columns
            .iter()
            .map(|&c| frames.values[c].iter().map(|&v| v as f64 * resolution).collect())
            .collect();

        let decimator = self
            .decimator
            .as_mut()
            .ok_or_else(|| StageError::Module("amplifier not started".into()))?;
        let decimated = decimator.process(&rows, &frames.trigger, &counter)?;
        if decimated.samples() == 0 {
            return Ok(Output::NoData);
        }

        let first = decimated.counter[0];
        let mut block = StreamBlock::new(
            self.settings.sample_rate,
            self.layout.clone(),
            SampleMatrix::from_rows(decimated.data)?,
            decimated.trigger,
            decimated.counter,
        )?;
        block.mode = self.settings.mode;
        self.sample_counter += block.samples() as u64;
        block.sample_counter = self.sample_counter;
        let offset = first as f64 / self.settings.sample_rate;
        block.block_time = self.start_time + TimeDelta::microseconds((offset * 1e6) as i64);
        Ok(Output::Block(block))
    }

    /// Switch the recording mode; restarts acquisition when it is running
    fn change_mode(&mut self, mode: RecordingMode) -> Option<LifecycleRequest> {
        info!("[Amplifier] Mode change to {:?}", mode);
        self.settings.mode = mode;
        self.select_channels();
        Some(LifecycleRequest::Restart)
    }
}

fn parse_settings(settings: &Value) -> StageResult<AmplifierSettings> {
    if settings.is_null() {
        return Ok(AmplifierSettings::default());
    }
    serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))
}

fn mode_name(mode: RecordingMode) -> &'static str {
    match mode {
        RecordingMode::Normal => "recording",
        RecordingMode::Test => "test signal",
        RecordingMode::Impedance => "impedance",
    }
}

impl Module for Amplifier {
    fn name(&self) -> &str {
        "Amplifier"
    }

    fn kind(&self) -> &str {
        "amplifier"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        self.events = ctx.events;
    }

    fn on_start(&mut self) -> StageResult {
        self.select_channels();
        if self.layout.is_empty() {
            return Err(StageError::Config("no input channels selected!".into()));
        }
        let rate = self.hardware_rate();
        self.decimator = Some(Decimator::new(self.layout.len(), rate, self.settings.divisor)?);
        self.tracker.reset();
        self.partial.clear();
        self.skip = self.settings.skip_blocks;
        self.empty_polls = 0;
        self.sample_counter = 0;
        self.last_impedance = None;

        self.device.open(self.settings.mode, rate)?;
        self.start_time = Local::now();

        self.events.log_message(format!(
            "Start {} at {:.0}Hz with {} channels",
            mode_name(self.settings.mode),
            self.settings.sample_rate,
            self.layout.len()
        ));
        self.events.status("Mode", format!("{:?}", self.settings.mode));
        Ok(())
    }

    fn on_stop(&mut self) -> StageResult {
        let errors = self.device.error_count();
        self.device.close();
        self.decimator = None;

        let mut info = format!("Stop {}", mode_name(self.settings.mode));
        if errors > 0 && self.settings.mode != RecordingMode::Impedance {
            info.push_str(&format!(" (device errors = {})", errors));
        }
        self.events.log_message(info);
        self.events.status("Mode", "Stopped");
        Ok(())
    }

    fn configuration(&self) -> Option<StreamBlock> {
        let mut params = StreamBlock::empty(self.layout.clone(), self.settings.sample_rate);
        params.mode = self.settings.mode;
        Some(params)
    }

    fn on_update(&mut self, params: StreamBlock) -> StageResult<StreamBlock> {
        self.events
            .status("Rate", format!("{:.0} Hz", self.settings.sample_rate));
        Ok(params)
    }

    fn on_input(&mut self, _block: StreamBlock) -> StageResult {
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        match self.settings.mode {
            RecordingMode::Impedance => self.read_impedances(),
            RecordingMode::Normal | RecordingMode::Test => self.read_data(),
        }
    }

    fn on_event(&mut self, event: &ModuleEvent) -> Option<LifecycleRequest> {
        match &event.kind {
            EventKind::Command(_) if event.info == "StartRecording" => self.change_mode(RecordingMode::Normal),
            EventKind::Command(_) if event.info == "StartTest" => self.change_mode(RecordingMode::Test),
            EventKind::Command(_) if event.info == "StartImpedance" => self.change_mode(RecordingMode::Impedance),
            _ => None,
        }
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(&self.settings).ok()
    }

    fn apply_settings(&mut self, settings: &Value) -> StageResult {
        let settings = parse_settings(settings)?;
        if settings.divisor == 0 || !(settings.sample_rate > 0.0) {
            return Err(StageError::Config("invalid sample rate or divisor".into()));
        }
        debug!("[Amplifier] New settings {:?}", settings);
        self.settings = settings;
        self.select_channels();
        Ok(())
    }

    fn terminate(&mut self) {
        self.device.close();
    }
}
