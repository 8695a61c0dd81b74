//! Module trait implemented by every pipeline stage
//!
//! A module only contains processing logic. Queueing, threading, locking and
//! lifecycle propagation are provided by the [`Stage`](super::stage::Stage)
//! that owns it.

use super::block::StreamBlock;
use super::errors::StageResult;
use super::event::{EventSink, ModuleEvent};
use super::stage::StageHandle;
use serde_json::Value;

/// Result of [`Module::on_output`]
#[derive(Debug)]
pub enum Output {
    Block(StreamBlock),
    NoData,
}

impl Output {
    /// `Block` if a block is pending, `NoData` otherwise
    pub fn from_pending(pending: &mut Option<StreamBlock>) -> Self {
        match pending.take() {
            Some(block) => Output::Block(block),
            None => Output::NoData,
        }
    }
}

/// Lifecycle transition a module asks its own stage to perform after an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleRequest {
    Start,
    Stop { force: bool },
    /// Stop (with query) and start again, e.g. after a mode change
    Restart,
}

/// What a module receives when it is placed into a stage
#[derive(Clone)]
pub struct ModuleContext {
    pub events: EventSink,
    pub stage: StageHandle,
}

/// A processing module
///
/// Sources have no upstream stage and produce blocks from `on_output`;
/// transformers take a block in `on_input` and hand it back from `on_output`;
/// sinks consume in `on_input` and return `NoData`.
pub trait Module: Send {
    /// Display name of this module
    fn name(&self) -> &str;

    /// Registry kind used for configuration files
    fn kind(&self) -> &str {
        self.name()
    }

    /// Called once when the module is placed into a stage
    fn attach(&mut self, _ctx: ModuleContext) {}

    fn on_start(&mut self) -> StageResult {
        Ok(())
    }

    fn on_stop(&mut self) -> StageResult {
        Ok(())
    }

    /// Local vote on a lifecycle transition ("Stop", "RemoteStop", ...)
    fn on_query(&mut self, _command: &str) -> bool {
        true
    }

    /// Inspect and rewrite the configuration travelling down the chain
    fn on_update(&mut self, params: StreamBlock) -> StageResult<StreamBlock> {
        Ok(params)
    }

    /// Configuration a source pushes down the chain when it starts
    fn configuration(&self) -> Option<StreamBlock> {
        None
    }

    fn on_input(&mut self, block: StreamBlock) -> StageResult;

    fn on_output(&mut self) -> StageResult<Output>;

    /// Runs when the input queue was empty in a worker iteration
    fn on_idle(&mut self) {}

    fn on_event(&mut self, _event: &ModuleEvent) -> Option<LifecycleRequest> {
        None
    }

    /// Persistent settings
    fn settings(&self) -> Option<Value> {
        None
    }

    fn apply_settings(&mut self, _settings: &Value) -> StageResult {
        Ok(())
    }

    /// Release resources that outlive a start/stop cycle (threads, sockets)
    fn terminate(&mut self) {}
}
