//! Error types for the pipeline runtime

use std::fmt;

/// Severity attached to error events
///
/// The pipeline owner force-stops the whole chain on `Fatal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Reported and otherwise ignored (e.g. one network client failing)
    Ignorable,
    /// User visible, acquisition continues
    Notify,
    /// Stops the whole pipeline
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Ignorable => write!(f, "ignorable"),
            Severity::Notify => write!(f, "notify"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error type returned by module callbacks
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Block shape mismatch: {0}")]
    Shape(String),

    #[error("Sample counter discontinuity: {0}")]
    Continuity(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Failure that does not stop acquisition
    #[error("{0}")]
    Recoverable(String),

    #[error("Module error: {0}")]
    Module(String),
}

impl StageError {
    /// Severity used when the error is turned into an error event
    pub fn severity(&self) -> Severity {
        match self {
            StageError::Recoverable(_) => Severity::Notify,
            _ => Severity::Fatal,
        }
    }
}

/// Result type for module callbacks
pub type StageResult<T = ()> = Result<T, StageError>;

/// Error type for connection operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Stage '{0}' not found")]
    StageNotFound(String),

    #[error("Stage '{0}' cannot receive from itself")]
    SelfLoop(String),

    #[error("Stage '{to}' already has a parent ('{parent}')")]
    AlreadyConnected { to: String, parent: String },

    #[error("Connecting '{from}' -> '{to}' would create a cycle")]
    Cycle { from: String, to: String },
}

/// Error type for building and driving a pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage with name '{0}' already exists")]
    DuplicateStage(String),

    #[error("Unknown stage kind '{0}'")]
    UnknownKind(String),

    #[error(transparent)]
    Connection(#[from] Box<ConnectionError>),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Stop vetoed by the pipeline")]
    Vetoed,

    #[error("Pipeline has no stages")]
    Empty,

    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration format error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConnectionError> for PipelineError {
    fn from(e: ConnectionError) -> Self {
        PipelineError::Connection(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            StageError::Recoverable("x".into()).severity(),
            Severity::Notify
        );
        assert_eq!(
            StageError::Hardware("link".into()).severity(),
            Severity::Fatal
        );
        assert!(Severity::Fatal > Severity::Notify);
        assert!(Severity::Notify > Severity::Ignorable);
    }
}
