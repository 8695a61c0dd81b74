//! Pipeline configuration files
//!
//! A configuration lists the stages top-down. A stage without `parent` is
//! attached below the stage listed before it, so a plain list describes a
//! chain; the first stage is the root.
//!
//! ```json
//! {
//!   "queue_size": 20,
//!   "stages": [
//!     { "name": "Amplifier", "kind": "amplifier", "settings": { "sample_rate": 500.0 } },
//!     { "name": "Filter", "kind": "filter" },
//!     { "name": "RDA", "kind": "rda_server", "parent": "Filter" }
//!   ]
//! }
//! ```

use crate::runtime::errors::PipelineError;
use crate::runtime::stage::{DEFAULT_IDLE, DEFAULT_JOIN_TIMEOUT, DEFAULT_QUEUE_SIZE, StageOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default input queue capacity
    pub queue_size: usize,
    /// Default worker idle sleep
    pub idle_ms: u64,
    pub join_timeout_ms: u64,
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            idle_ms: DEFAULT_IDLE.as_millis() as u64,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
            stages: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Registry key of the module
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_ms: Option<u64>,
    #[serde(default)]
    pub settings: Value,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            parent: None,
            queue_size: None,
            idle_ms: None,
            settings: Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn below(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Options for one stage, falling back to the pipeline defaults
    pub fn options_for(&self, stage: &StageConfig) -> StageOptions {
        StageOptions {
            queue_size: stage.queue_size.unwrap_or(self.queue_size),
            idle: Duration::from_millis(stage.idle_ms.unwrap_or(self.idle_ms)),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }

    /// Parent of each stage after applying the "previous stage" rule
    pub fn parents(&self) -> Vec<Option<String>> {
        let mut previous: Option<&str> = None;
        self.stages
            .iter()
            .map(|stage| {
                let parent = stage.parent.clone().or_else(|| previous.map(str::to_string));
                previous = Some(stage.name.as_str());
                parent
            })
            .collect()
    }
}
