//! Asynchronous events exchanged between stages and the pipeline owner

use super::errors::Severity;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fmt;
use tracing::{debug, error, info, warn};

/// What an event is about
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// Log line shown to the user
    LogMessage,
    /// Status update for a named status field (e.g. "Mode", "Storage")
    Status(String),
    Message,
    Error(Severity),
    /// Command addressed to other stages; `info` carries the command name
    Command(String),
    /// Log file only
    Log,
}

#[derive(Clone, Debug)]
pub struct ModuleEvent {
    /// Name of the emitting stage
    pub module: String,
    pub kind: EventKind,
    pub info: String,
    pub time: DateTime<Local>,
}

impl ModuleEvent {
    pub fn new(module: impl Into<String>, kind: EventKind, info: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind,
            info: info.into(),
            time: Local::now(),
        }
    }

    pub fn error(module: impl Into<String>, info: impl Into<String>, severity: Severity) -> Self {
        Self::new(module, EventKind::Error(severity), info)
    }

    /// Command event; `name` is the command, `value` its argument
    pub fn command(
        module: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(module, EventKind::Command(value.into()), name)
    }

    pub fn severity(&self) -> Option<Severity> {
        match self.kind {
            EventKind::Error(severity) => Some(severity),
            _ => None,
        }
    }

    /// Matches a command event with the given name
    pub fn is_command(&self, name: &str) -> bool {
        matches!(self.kind, EventKind::Command(_)) && self.info == name
    }

    /// Argument of a command event
    pub fn command_value(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Command(value) => Some(value),
            _ => None,
        }
    }

    /// Mirror the event into the tracing log
    pub fn trace(&self) {
        match &self.kind {
            EventKind::Error(Severity::Fatal) => error!("[{}] {}", self.module, self.info),
            EventKind::Error(Severity::Notify) => warn!("[{}] {}", self.module, self.info),
            EventKind::Error(Severity::Ignorable) => info!("[{}] {}", self.module, self.info),
            EventKind::LogMessage | EventKind::Message => info!("[{}] {}", self.module, self.info),
            EventKind::Status(field) => debug!("[{}] {} = {}", self.module, field, self.info),
            EventKind::Command(value) => {
                debug!("[{}] command {} ({})", self.module, self.info, value)
            }
            EventKind::Log => debug!("[{}] {}", self.module, self.info),
        }
    }
}

impl fmt::Display for ModuleEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            EventKind::Error(severity) => {
                write!(f, "{} ERROR({}) {}: {}", self.time.format("%H:%M:%S"), severity, self.module, self.info)
            }
            EventKind::Status(field) => {
                write!(f, "{} STATUS {}.{}: {}", self.time.format("%H:%M:%S"), self.module, field, self.info)
            }
            kind => write!(
                f,
                "{} {:?} {}: {}",
                self.time.format("%H:%M:%S"),
                kind,
                self.module,
                self.info
            ),
        }
    }
}

/// Handle a stage uses to emit events
///
/// A detached sink (no pipeline) only writes to the tracing log.
#[derive(Clone, Debug)]
pub struct EventSink {
    module: String,
    tx: Option<Sender<ModuleEvent>>,
}

impl EventSink {
    pub fn new(module: impl Into<String>, tx: Sender<ModuleEvent>) -> Self {
        Self {
            module: module.into(),
            tx: Some(tx),
        }
    }

    pub fn detached(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            tx: None,
        }
    }

    /// Sink plus the receiving end, for observing a module in isolation
    pub fn channel(module: impl Into<String>) -> (Self, Receiver<ModuleEvent>) {
        let (tx, rx) = unbounded();
        (Self::new(module, tx), rx)
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn send(&self, event: ModuleEvent) {
        match &self.tx {
            Some(tx) => {
                if tx.send(event.clone()).is_err() {
                    event.trace();
                }
            }
            None => event.trace(),
        }
    }

    pub fn emit(&self, kind: EventKind, info: impl Into<String>) {
        self.send(ModuleEvent::new(self.module.clone(), kind, info));
    }

    pub fn log_message(&self, info: impl Into<String>) {
        self.emit(EventKind::LogMessage, info);
    }

    pub fn log(&self, info: impl Into<String>) {
        self.emit(EventKind::Log, info);
    }

    pub fn status(&self, field: impl Into<String>, info: impl Into<String>) {
        self.emit(EventKind::Status(field.into()), info);
    }

    pub fn error(&self, info: impl Into<String>, severity: Severity) {
        self.emit(EventKind::Error(severity), info);
    }

    pub fn command(&self, name: impl Into<String>, value: impl Into<String>) {
        self.send(ModuleEvent::command(self.module.clone(), name, value));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::detached("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events_with_module_name() {
        let (sink, rx) = EventSink::channel("Filter");
        sink.error("queue overrun", Severity::Notify);
        sink.command("Stop", "force");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.module, "Filter");
        assert_eq!(first.severity(), Some(Severity::Notify));

        let second = rx.try_recv().unwrap();
        assert!(second.is_command("Stop"));
        assert_eq!(second.command_value(), Some("force"));
    }

    #[test]
    fn test_detached_sink_does_not_panic() {
        let sink = EventSink::detached("Lonely");
        sink.log_message("nobody listens");
        sink.status("Mode", "0");
    }
}
