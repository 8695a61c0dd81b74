//! Runtime support for module chains

pub mod block;
pub mod errors;
pub mod event;
pub mod node;
pub mod pipeline;
pub mod registry;
pub mod stage;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use block::{
    ChannelDescriptor, ChannelGroup, FilterSettings, ImpedanceSlots, Marker, RecordingMode,
    SampleMatrix, StreamBlock, Telemetry,
};
pub use errors::{ConnectionError, PipelineError, Severity, StageError, StageResult};
pub use event::{EventKind, EventSink, ModuleEvent};
pub use node::{LifecycleRequest, Module, ModuleContext, Output};
pub use pipeline::Pipeline;
pub use registry::{create_module, register_module, registered_kinds};
pub use stage::{Stage, StageHandle, StageOptions, StageState, StageStats};
pub use watchdog::Watchdog;
