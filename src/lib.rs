//! Multi-channel biosignal acquisition pipeline
//!
//! Blocks of samples flow top-down through a tree of stages. Each stage owns a
//! bounded input queue and a worker thread; a full queue drops the block and
//! reports an overrun instead of stalling the source.
//!
//! # Architecture
//!
//! - **Runtime**: [`Pipeline`], [`Stage`] and the [`Module`] trait implemented by every stage
//! - **Acquisition**: counter continuity, decimation and the [`Amplifier`] source
//! - **Nodes**: filter, re-referencing, trigger detection and storage
//! - **RDA**: network streaming to and from remote viewers
//!
//! # Example
//!
//! ```no_run
//! use biocorder::acquisition::{Amplifier, AmplifierSettings, SimulatedDevice};
//! use biocorder::nodes::{Filter, FilterConfig};
//! use biocorder::Pipeline;
//!
//! let mut pipeline = Pipeline::new();
//! let device = Box::new(SimulatedDevice::default());
//! pipeline.add_stage("Amplifier", Amplifier::new(device, AmplifierSettings::default())?)?;
//! pipeline.add_stage("Filter", Filter::new(FilterConfig::default())?)?;
//! pipeline.chain(&["Amplifier", "Filter"])?;
//! pipeline.start()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod config;
pub mod dsp;
pub mod nodes;
pub mod rda;
pub mod runtime;

pub use config::{PipelineConfig, StageConfig};

pub use runtime::{
    ChannelDescriptor, ChannelGroup, ConnectionError, EventKind, EventSink, LifecycleRequest,
    Marker, Module, ModuleContext, ModuleEvent, Output, Pipeline, PipelineError, RecordingMode,
    SampleMatrix, Severity, Stage, StageError, StageHandle, StageResult, StreamBlock,
};

pub use acquisition::Amplifier;
pub use nodes::{Filter, Reference, Storage, TriggerDetector};
pub use rda::{RdaClient, RdaServer};

pub type Result<T> = std::result::Result<T, PipelineError>;
