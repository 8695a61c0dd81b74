//! Small modules shared by the unit tests

use super::block::{ChannelDescriptor, SampleMatrix, StreamBlock};
use super::errors::StageResult;
use super::node::{Module, Output};
use std::sync::{Arc, Mutex};

/// Block with one channel whose samples equal their counter values
pub(crate) fn block_with_counter(first: u64, samples: usize) -> StreamBlock {
    let counter: Vec<u64> = (first..first + samples as u64).collect();
    let values = counter.iter().map(|&c| c as f64).collect();
    let data = SampleMatrix::from_vec(1, samples, values).unwrap();
    StreamBlock::new(
        100.0,
        vec![ChannelDescriptor::signal(1, "Cz")],
        data,
        vec![0; samples],
        counter,
    )
    .unwrap()
}

/// Forwards every input block unchanged
#[derive(Default)]
pub(crate) struct Passthrough {
    pending: Option<StreamBlock>,
}

impl Module for Passthrough {
    fn name(&self) -> &str {
        "Passthrough"
    }

    fn on_input(&mut self, block: StreamBlock) -> StageResult {
        self.pending = Some(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::from_pending(&mut self.pending))
    }
}

/// Sink remembering every block it received
pub(crate) struct Collector {
    seen: Arc<Mutex<Vec<StreamBlock>>>,
}

impl Collector {
    pub(crate) fn new() -> (Self, Arc<Mutex<Vec<StreamBlock>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

impl Module for Collector {
    fn name(&self) -> &str {
        "Collector"
    }

    fn on_input(&mut self, block: StreamBlock) -> StageResult {
        self.seen.lock().unwrap().push(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::NoData)
    }
}
