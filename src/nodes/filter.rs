//! Low-pass, high-pass and notch filtering
//!
//! Signal-group channels share the global settings, every other channel keeps
//! its own. Filter state persists from block to block and is only rebuilt when
//! the configuration changes.

use crate::dsp::IirFilter;
use crate::runtime::block::{ChannelDescriptor, ChannelGroup, FilterSettings, RecordingMode, StreamBlock};
use crate::runtime::errors::{StageError, StageResult};
use crate::runtime::event::EventSink;
use crate::runtime::node::{Module, ModuleContext, Output};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Width of the notch band on either side of the notch frequency
const NOTCH_HALF_WIDTH: f64 = 1.0;

/// Order of the notch band-stop prototype
const NOTCH_ORDER: usize = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Settings for every signal-group channel
    pub low_pass: f64,
    pub high_pass: f64,
    pub notch: bool,
    pub notch_frequency: f64,
    /// Order of the low and high pass Butterworth filters
    pub order: usize,
    /// Settings of non-signal channels, matched by input group and input
    pub channels: Vec<ChannelDescriptor>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            low_pass: 0.0,
            high_pass: 0.0,
            notch: false,
            notch_frequency: 50.0,
            order: 2,
            channels: Vec::new(),
        }
    }
}

/// Filters of one channel, applied high, low, notch
#[derive(Clone, Debug, Default)]
struct ChannelFilters {
    high: Option<IirFilter>,
    low: Option<IirFilter>,
    notch: Option<IirFilter>,
}

impl ChannelFilters {
    fn apply(&mut self, samples: &mut [f64]) {
        for filter in [&mut self.high, &mut self.low, &mut self.notch].into_iter().flatten() {
            filter.filter_in_place(samples);
        }
    }

    fn is_empty(&self) -> bool {
        self.high.is_none() && self.low.is_none() && self.notch.is_none()
    }
}

pub struct Filter {
    config: FilterConfig,
    events: EventSink,
    /// Layout the filters were designed for
    layout: Vec<FilterSettings>,
    sample_rate: f64,
    filters: Vec<ChannelFilters>,
    pending: Option<StreamBlock>,
}

impl Filter {
    pub fn new(config: FilterConfig) -> StageResult<Self> {
        if config.order == 0 {
            return Err(StageError::Config("filter order must be at least 1".into()));
        }
        Ok(Self {
            config,
            events: EventSink::default(),
            layout: Vec::new(),
            sample_rate: 0.0,
            filters: Vec::new(),
            pending: None,
        })
    }

    pub fn from_settings(settings: &Value) -> StageResult<Self> {
        Self::new(parse_settings(settings)?)
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Assign the filter settings the configuration gives to each channel
    fn assign(&self, channels: &mut [ChannelDescriptor]) {
        for channel in channels.iter_mut() {
            if channel.group == ChannelGroup::Signal {
                channel.filter = FilterSettings {
                    low_pass: self.config.low_pass,
                    high_pass: self.config.high_pass,
                    notch: self.config.notch,
                };
            } else if let Some(own) = self
                .config
                .channels
                .iter()
                .find(|c| c.input_group == channel.input_group && c.input == channel.input)
            {
                channel.filter = own.filter;
            }
        }
    }

    fn design(&mut self, channels: &[ChannelDescriptor], sample_rate: f64) -> StageResult {
        self.layout = channels.iter().map(|c| c.filter).collect();
        self.sample_rate = sample_rate;
        self.filters = channels
            .iter()
            .map(|c| self.design_channel(&c.filter, sample_rate))
            .collect::<StageResult<_>>()?;
        let active = self.filters.iter().filter(|f| !f.is_empty()).count();
        debug!(
            "[Filter] Designed filters for {} of {} channels at {} Hz",
            active,
            channels.len(),
            sample_rate
        );
        Ok(())
    }

    fn design_channel(&self, settings: &FilterSettings, sample_rate: f64) -> StageResult<ChannelFilters> {
        let usable = |f: f64| f > 0.0 && f < sample_rate / 2.0;
        let order = self.config.order;

        let high = if usable(settings.high_pass) {
            Some(IirFilter::butter_highpass(order, settings.high_pass, sample_rate)?)
        } else {
            None
        };
        let low = if usable(settings.low_pass) {
            Some(IirFilter::butter_lowpass(order, settings.low_pass, sample_rate)?)
        } else {
            None
        };
        let f = self.config.notch_frequency;
        let notch = if settings.notch && usable(f + NOTCH_HALF_WIDTH) && f - NOTCH_HALF_WIDTH > 0.0 {
            Some(IirFilter::butter_bandstop(
                NOTCH_ORDER,
                f - NOTCH_HALF_WIDTH,
                f + NOTCH_HALF_WIDTH,
                sample_rate,
            )?)
        } else {
            None
        };
        Ok(ChannelFilters { high, low, notch })
    }

    fn designed_for(&self, block: &StreamBlock) -> bool {
        self.sample_rate == block.sample_rate
            && self.layout.len() == block.channels.len()
            && self.layout.iter().zip(&block.channels).all(|(f, c)| *f == c.filter)
    }
}

fn parse_settings(settings: &Value) -> StageResult<FilterConfig> {
    if settings.is_null() {
        return Ok(FilterConfig::default());
    }
    serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))
}

impl Module for Filter {
    fn name(&self) -> &str {
        "Filter"
    }

    fn kind(&self) -> &str {
        "filter"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        self.events = ctx.events;
    }

    fn on_start(&mut self) -> StageResult {
        self.filters.iter_mut().for_each(|f| {
            for filter in [&mut f.high, &mut f.low, &mut f.notch].into_iter().flatten() {
                filter.reset();
            }
        });
        Ok(())
    }

    fn on_update(&mut self, mut params: StreamBlock) -> StageResult<StreamBlock> {
        self.assign(&mut params.channels);
        if params.mode != RecordingMode::Impedance && params.sample_rate > 0.0 {
            self.design(&params.channels, params.sample_rate)?;
        }
        let f = &self.config;
        self.events.status(
            "Filter",
            format!("HP {} Hz, LP {} Hz, notch {}", f.high_pass, f.low_pass, if f.notch { "on" } else { "off" }),
        );
        Ok(params)
    }

    fn on_input(&mut self, mut block: StreamBlock) -> StageResult {
        if block.mode == RecordingMode::Impedance {
            self.pending = Some(block);
            return Ok(());
        }

        self.assign(&mut block.channels);
        if !self.designed_for(&block) {
            self.design(&block.channels, block.sample_rate)?;
        }
        for (row, filters) in self.filters.iter_mut().enumerate() {
            if !filters.is_empty() {
                filters.apply(block.data.row_mut(row));
            }
        }
        self.pending = Some(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::from_pending(&mut self.pending))
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(&self.config).ok()
    }

    fn apply_settings(&mut self, settings: &Value) -> StageResult {
        let config = parse_settings(settings)?;
        if config.order == 0 {
            return Err(StageError::Config("filter order must be at least 1".into()));
        }
        self.config = config;
        // force a redesign with the next block
        self.layout.clear();
        Ok(())
    }
}
