//! Re-referencing
//!
//! Signal channels flagged as reference are averaged and the average is
//! subtracted from every other enabled signal channel. Reference channels are
//! then dropped from the output unless the stage is told to keep them.
//! Impedance and test blocks pass with all channels but without re-referencing.

use crate::runtime::block::{ChannelDescriptor, ChannelGroup, RecordingMode, StreamBlock};
use crate::runtime::errors::{Severity, StageError, StageResult};
use crate::runtime::event::EventSink;
use crate::runtime::node::{Module, ModuleContext, Output};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    /// Remove reference channels from recorded data
    pub hide_reference: bool,
    /// Montage overrides (name, enabled, reference flag), matched by input group and input
    pub channels: Vec<ChannelDescriptor>,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            hide_reference: true,
            channels: Vec::new(),
        }
    }
}

/// Row selection computed from one channel layout
#[derive(Clone, Debug, Default)]
struct Selection {
    inputs: Vec<(ChannelGroup, usize)>,
    mode: RecordingMode,
    signal: Vec<usize>,
    reference: Vec<usize>,
    output: Vec<usize>,
    channels: Vec<ChannelDescriptor>,
    /// Display name of the combined reference
    reference_name: String,
}

impl Selection {
    fn matches(&self, block: &StreamBlock) -> bool {
        self.mode == block.mode
            && self.inputs.len() == block.channels.len()
            && self
                .inputs
                .iter()
                .zip(&block.channels)
                .all(|(&(group, input), c)| group == c.input_group && input == c.input)
    }
}

pub struct Reference {
    settings: ReferenceSettings,
    events: EventSink,
    selection: Option<Selection>,
    pending: Option<StreamBlock>,
}

impl Reference {
    pub fn new(settings: ReferenceSettings) -> Self {
        Self {
            settings,
            events: EventSink::default(),
            selection: None,
            pending: None,
        }
    }

    pub fn from_settings(settings: &Value) -> StageResult<Self> {
        Ok(Self::new(parse_settings(settings)?))
    }

    fn apply_montage(&self, channels: &mut [ChannelDescriptor]) {
        for channel in channels.iter_mut() {
            if let Some(own) = self
                .settings
                .channels
                .iter()
                .find(|c| c.input_group == channel.input_group && c.input == channel.input)
            {
                channel.name = own.name.clone();
                channel.enabled = own.enabled;
                channel.is_reference = own.is_reference;
                channel.group = own.group;
            }
        }
    }

    fn select(&self, channels: &[ChannelDescriptor], mode: RecordingMode) -> Selection {
        let mut channels = channels.to_vec();
        self.apply_montage(&mut channels);

        let is_ref = |c: &ChannelDescriptor| c.group == ChannelGroup::Signal && c.is_reference;
        let signal: Vec<usize> = (0..channels.len())
            .filter(|&i| channels[i].group == ChannelGroup::Signal && channels[i].enabled && !channels[i].is_reference)
            .collect();
        let reference: Vec<usize> = (0..channels.len()).filter(|&i| is_ref(&channels[i])).collect();
        let output: Vec<usize> = (0..channels.len())
            .filter(|&i| {
                let c = &channels[i];
                match mode {
                    RecordingMode::Impedance | RecordingMode::Test => c.enabled || is_ref(c),
                    RecordingMode::Normal if self.settings.hide_reference => c.enabled && !is_ref(c),
                    RecordingMode::Normal => c.enabled,
                }
            })
            .collect();

        let names: Vec<String> = reference.iter().map(|&i| channels[i].name.clone()).collect();
        let referenced = mode == RecordingMode::Normal && !names.is_empty();
        let reference_name = match names.len() {
            _ if !referenced => "none".to_string(),
            1 => names[0].clone(),
            _ => format!("AVG({})", names.join(" + ")),
        };
        for &i in &reference {
            channels[i].name = format!("REF_{}", channels[i].name);
            channels[i].reference_name.clear();
        }
        for &i in &signal {
            channels[i].reference_name = if referenced { "REF".to_string() } else { String::new() };
        }

        Selection {
            inputs: channels.iter().map(|c| (c.input_group, c.input)).collect(),
            mode,
            channels: output.iter().map(|&i| channels[i].clone()).collect(),
            signal,
            reference,
            output,
            reference_name,
        }
    }

    fn reselect(&mut self, channels: &[ChannelDescriptor], mode: RecordingMode) {
        let selection = self.select(channels, mode);
        debug!(
            "[Reference] {} of {} channels selected, reference {}",
            selection.output.len(),
            channels.len(),
            selection.reference_name
        );
        self.events.status("Channels", format!("{} ch", selection.output.len()));
        self.events
            .status("Reference", format!("REF: {}", selection.reference_name));

        let mut seen = HashSet::new();
        if selection.channels.iter().any(|c| !seen.insert(c.name.to_lowercase())) {
            self.events.error(
                "duplicate channel names, please check the recording montage",
                Severity::Ignorable,
            );
        }
        self.selection = Some(selection);
    }
}

fn parse_settings(settings: &Value) -> StageResult<ReferenceSettings> {
    if settings.is_null() {
        return Ok(ReferenceSettings::default());
    }
    serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))
}

impl Module for Reference {
    fn name(&self) -> &str {
        "Reference"
    }

    fn kind(&self) -> &str {
        "reference"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        self.events = ctx.events;
    }

    fn on_start(&mut self) -> StageResult {
        match &self.selection {
            Some(selection) if selection.output.is_empty() => {
                Err(StageError::Config("no channels selected!".into()))
            }
            _ => Ok(()),
        }
    }

    fn on_update(&mut self, mut params: StreamBlock) -> StageResult<StreamBlock> {
        self.reselect(&params.channels, params.mode);
        if let Some(selection) = &self.selection {
            let data = params.data.select_rows(&selection.output);
            params.replace_channels(selection.channels.clone(), data)?;
        }
        Ok(params)
    }

    fn on_input(&mut self, mut block: StreamBlock) -> StageResult {
        if !self.selection.as_ref().is_some_and(|s| s.matches(&block)) {
            self.reselect(&block.channels, block.mode);
        }
        let Some(selection) = &self.selection else {
            return Err(StageError::Module("reference selection missing".into()));
        };

        if block.mode == RecordingMode::Normal && !selection.reference.is_empty() {
            let samples = block.samples();
            let mut average = vec![0.0; samples];
            for &r in &selection.reference {
                for (acc, v) in average.iter_mut().zip(block.data.row(r)) {
                    *acc += v;
                }
            }
            let n = selection.reference.len() as f64;
            average.iter_mut().for_each(|v| *v /= n);
            for &s in &selection.signal {
                for (v, r) in block.data.row_mut(s).iter_mut().zip(&average) {
                    *v -= r;
                }
            }
        }

        let data = block.data.select_rows(&selection.output);
        block.replace_channels(selection.channels.clone(), data)?;
        self.pending = Some(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::from_pending(&mut self.pending))
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(&self.settings).ok()
    }

    fn apply_settings(&mut self, settings: &Value) -> StageResult {
        self.settings = parse_settings(settings)?;
        self.selection = None;
        Ok(())
    }
}
