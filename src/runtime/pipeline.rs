//! Pipeline owner: stage topology, lifecycle and event dispatch
//!
//! The pipeline owns every stage, knows the parent of each stage, and runs a
//! dispatcher thread routing module events. An event emitted by a stage is
//! delivered to its ancestors (bubbling up), then to external listeners, then
//! to its descendants, so commands reach every stage regardless of data flow
//! direction. A fatal error anywhere force-stops the whole chain, and a
//! `Stop` command stops it as well (forced when its value is `force`).

use super::errors::{ConnectionError, PipelineError, Severity};
use super::event::{EventSink, ModuleEvent};
use super::node::Module;
use super::registry::create_module;
use super::stage::{Stage, StageOptions, StageStats};
use super::watchdog::Watchdog;
use crate::config::{PipelineConfig, StageConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name used for events injected by the pipeline owner
pub const OWNER: &str = "Pipeline";

#[derive(Default)]
struct Topology {
    stages: Vec<Arc<Stage>>,
    kinds: Vec<String>,
    parents: Vec<Option<usize>>,
    names: HashMap<String, usize>,
}

impl Topology {
    fn roots(&self) -> Vec<Arc<Stage>> {
        self.parents
            .iter()
            .enumerate()
            .filter(|(_, parent)| parent.is_none())
            .map(|(i, _)| Arc::clone(&self.stages[i]))
            .collect()
    }

    /// Nearest ancestor first
    fn ancestors(&self, index: usize) -> Vec<usize> {
        let mut result = Vec::new();
        let mut current = self.parents[index];
        while let Some(parent) = current {
            result.push(parent);
            current = self.parents[parent];
        }
        result
    }

    fn children(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.parents
            .iter()
            .enumerate()
            .filter(move |(_, parent)| **parent == Some(index))
            .map(|(i, _)| i)
    }

    /// Breadth-first below the given stages
    fn below(&self, start: impl IntoIterator<Item = usize>) -> Vec<usize> {
        let mut queue: VecDeque<usize> = start.into_iter().collect();
        let mut result = Vec::new();
        while let Some(index) = queue.pop_front() {
            result.push(index);
            queue.extend(self.children(index));
        }
        result
    }

    /// All stages, roots first
    fn top_down(&self) -> Vec<usize> {
        let roots: Vec<usize> = (0..self.stages.len())
            .filter(|&i| self.parents[i].is_none())
            .collect();
        self.below(roots)
    }

    fn collect(&self, indices: &[usize]) -> Vec<Arc<Stage>> {
        indices.iter().map(|&i| Arc::clone(&self.stages[i])).collect()
    }
}

type Listeners = Arc<Mutex<Vec<Sender<ModuleEvent>>>>;

pub struct Pipeline {
    topology: Arc<Mutex<Topology>>,
    listeners: Listeners,
    event_tx: Sender<ModuleEvent>,
    dispatcher: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    watchdog: Watchdog,
    watchdog_handle: Option<JoinHandle<()>>,
    default_options: StageOptions,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_options(StageOptions::default())
    }

    /// Pipeline whose stages use the given options unless overridden
    pub fn with_options(default_options: StageOptions) -> Self {
        let (event_tx, event_rx) = unbounded();
        let topology = Arc::new(Mutex::new(Topology::default()));
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let topology = Arc::clone(&topology);
            let listeners = Arc::clone(&listeners);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("event-dispatcher".to_string())
                .spawn(move || dispatch_events(event_rx, topology, listeners, shutdown))
                .ok()
        };
        if dispatcher.is_none() {
            warn!("Event dispatcher could not be started, events are only logged");
        }

        let watchdog = Watchdog::new();
        let watchdog_handle = Some(watchdog.start_monitoring_thread());
        debug!("Watchdog enabled - will report stage callbacks blocked >5 seconds");

        Self {
            topology,
            listeners,
            event_tx,
            dispatcher,
            shutdown,
            watchdog,
            watchdog_handle,
            default_options,
        }
    }

    /// Build every stage of a configuration through the module registry
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let mut pipeline = Self::with_options(StageOptions {
            queue_size: config.queue_size,
            idle: Duration::from_millis(config.idle_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        });

        for stage in &config.stages {
            let module = create_module(&stage.kind, &stage.settings)
                .ok_or_else(|| PipelineError::UnknownKind(stage.kind.clone()))?
                .map_err(|source| PipelineError::Stage {
                    stage: stage.name.clone(),
                    source,
                })?;
            pipeline.add_boxed(&stage.name, &stage.kind, module, config.options_for(stage))?;
        }
        for (stage, parent) in config.stages.iter().zip(config.parents()) {
            if let Some(parent) = parent {
                pipeline.connect(&parent, &stage.name)?;
            }
        }
        info!("Pipeline built with {} stages", config.stages.len());
        Ok(pipeline)
    }

    /// Current topology and module settings as a configuration
    pub fn snapshot_config(&self) -> PipelineConfig {
        let topology = self.topology.lock().unwrap();
        let stages = topology
            .top_down()
            .into_iter()
            .map(|i| {
                let stage = &topology.stages[i];
                let settings = stage.with_module(|m| m.settings()).unwrap_or(Value::Null);
                let options = stage.options();
                StageConfig {
                    name: stage.name().to_string(),
                    kind: topology.kinds[i].clone(),
                    parent: topology.parents[i].map(|p| topology.stages[p].name().to_string()),
                    queue_size: (options.queue_size != self.default_options.queue_size)
                        .then_some(options.queue_size),
                    idle_ms: (options.idle != self.default_options.idle)
                        .then_some(options.idle.as_millis() as u64),
                    settings,
                }
            })
            .collect();
        PipelineConfig {
            queue_size: self.default_options.queue_size,
            idle_ms: self.default_options.idle.as_millis() as u64,
            join_timeout_ms: self.default_options.join_timeout.as_millis() as u64,
            stages,
        }
    }

    /// Add a stage with the pipeline's default options
    pub fn add_stage<M: Module + 'static>(
        &mut self,
        name: impl Into<String>,
        module: M,
    ) -> Result<(), PipelineError> {
        let kind = module.kind().to_string();
        self.add_boxed(name, &kind, Box::new(module), self.default_options)
    }

    pub fn add_boxed(
        &mut self,
        name: impl Into<String>,
        kind: &str,
        module: Box<dyn Module>,
        options: StageOptions,
    ) -> Result<(), PipelineError> {
        let name = name.into();
        let mut topology = self.topology.lock().unwrap();
        if topology.names.contains_key(&name) {
            return Err(PipelineError::DuplicateStage(name));
        }

        let events = EventSink::new(name.clone(), self.event_tx.clone());
        let stage = Stage::new(name.clone(), module, options, events, &self.watchdog);
        let index = topology.stages.len();
        topology.stages.push(stage);
        topology.kinds.push(kind.to_string());
        topology.parents.push(None);
        topology.names.insert(name, index);
        Ok(())
    }

    /// Make `to` a receiver of `from`
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), Box<ConnectionError>> {
        let mut topology = self.topology.lock().unwrap();
        let from_id = *topology
            .names
            .get(from)
            .ok_or_else(|| Box::new(ConnectionError::StageNotFound(from.to_string())))?;
        let to_id = *topology
            .names
            .get(to)
            .ok_or_else(|| Box::new(ConnectionError::StageNotFound(to.to_string())))?;

        if from_id == to_id {
            return Err(Box::new(ConnectionError::SelfLoop(from.to_string())));
        }
        if let Some(parent) = topology.parents[to_id] {
            return Err(Box::new(ConnectionError::AlreadyConnected {
                to: to.to_string(),
                parent: topology.stages[parent].name().to_string(),
            }));
        }
        if topology.ancestors(from_id).contains(&to_id) {
            return Err(Box::new(ConnectionError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            }));
        }

        topology.parents[to_id] = Some(from_id);
        let receiver = Arc::clone(&topology.stages[to_id]);
        let sender = Arc::clone(&topology.stages[from_id]);
        drop(topology);
        sender.add_receiver(receiver);
        debug!("Connected {} -> {}", from, to);
        Ok(())
    }

    /// Connect the named stages as a linear chain
    pub fn chain(&mut self, names: &[&str]) -> Result<(), Box<ConnectionError>> {
        for pair in names.windows(2) {
            self.connect(pair[0], pair[1])?;
        }
        Ok(())
    }

    fn roots(&self) -> Vec<Arc<Stage>> {
        self.topology.lock().unwrap().roots()
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        let roots = self.roots();
        if roots.is_empty() {
            return Err(PipelineError::Empty);
        }
        for root in roots {
            root.start().map_err(|source| PipelineError::Stage {
                stage: root.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Stop the chain; without `force` every stage may veto
    pub fn stop(&self, force: bool) -> Result<(), PipelineError> {
        if !force && !self.query("Stop") {
            return Err(PipelineError::Vetoed);
        }
        for root in self.roots() {
            root.stop();
        }
        Ok(())
    }

    /// Consensus over every stage
    pub fn query(&self, command: &str) -> bool {
        self.roots().iter().all(|root| root.query(command))
    }

    /// Push the roots' current configuration down the chain
    pub fn update(&self) {
        for root in self.roots() {
            if let Some(params) = root.with_module(|m| m.configuration()) {
                root.propagate_update(params);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.roots().iter().any(|root| root.is_running())
    }

    /// Receive a copy of every event
    pub fn subscribe(&self) -> Receiver<ModuleEvent> {
        let (tx, rx) = unbounded();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Inject a command; it is delivered to every stage top-down
    pub fn send_command(&self, name: &str, value: &str) {
        let _ = self.event_tx.send(ModuleEvent::command(OWNER, name, value));
    }

    pub fn stage(&self, name: &str) -> Option<Arc<Stage>> {
        let topology = self.topology.lock().unwrap();
        topology.names.get(name).map(|&i| Arc::clone(&topology.stages[i]))
    }

    /// Stage names, roots first
    pub fn stage_names(&self) -> Vec<String> {
        let topology = self.topology.lock().unwrap();
        topology
            .top_down()
            .into_iter()
            .map(|i| topology.stages[i].name().to_string())
            .collect()
    }

    pub fn stats(&self) -> Vec<(String, StageStats)> {
        let topology = self.topology.lock().unwrap();
        topology
            .top_down()
            .into_iter()
            .map(|i| (topology.stages[i].name().to_string(), topology.stages[i].stats()))
            .collect()
    }

    /// Stop everything and release module resources
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop(true);
        let stages = self.topology.lock().unwrap().stages.clone();
        for stage in stages {
            stage.terminate();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        self.watchdog.stop();
        if let Some(handle) = self.watchdog_handle.take() {
            let _ = handle.join();
        }
        info!("Pipeline shut down");
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_events(
    events: Receiver<ModuleEvent>,
    topology: Arc<Mutex<Topology>>,
    listeners: Listeners,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => route_event(&event, &topology, &listeners),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Event dispatcher finished");
}

fn route_event(event: &ModuleEvent, topology: &Mutex<Topology>, listeners: &Listeners) {
    event.trace();

    let (upward, downward, roots) = {
        let topology = topology.lock().unwrap();
        let (up, down) = match topology.names.get(&event.module) {
            Some(&index) => (
                topology.ancestors(index),
                topology.below(topology.children(index).collect::<Vec<_>>()),
            ),
            None => (Vec::new(), topology.top_down()),
        };
        (topology.collect(&up), topology.collect(&down), topology.roots())
    };

    for stage in &upward {
        stage.deliver_event(event);
    }
    listeners
        .lock()
        .unwrap()
        .retain(|listener| listener.send(event.clone()).is_ok());
    for stage in &downward {
        stage.deliver_event(event);
    }

    if event.severity() == Some(Severity::Fatal) {
        warn!("[{}] Fatal error, stopping pipeline", event.module);
        for root in &roots {
            root.stop();
        }
    } else if event.is_command("Stop") {
        let force = event.command_value() == Some("force");
        if force || roots.iter().all(|root| root.query("Stop")) {
            for root in &roots {
                root.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{ChannelDescriptor, StreamBlock};
    use crate::runtime::errors::{StageError, StageResult};
    use crate::runtime::event::EventKind;
    use crate::runtime::node::{ModuleContext, Output};
    use crate::runtime::testing::{Collector, Passthrough, block_with_counter};

    /// Logs every callback into a shared journal
    struct Journaled {
        label: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        pending: Option<StreamBlock>,
    }

    impl Journaled {
        fn new(label: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                label,
                journal: Arc::clone(journal),
                pending: None,
            }
        }
    }

    impl Module for Journaled {
        fn name(&self) -> &str {
            self.label
        }
        fn on_input(&mut self, block: StreamBlock) -> StageResult {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:in:{}", self.label, block.counter[0]));
            self.pending = Some(block);
            Ok(())
        }
        fn on_output(&mut self) -> StageResult<Output> {
            if let Some(block) = &self.pending {
                self.journal
                    .lock()
                    .unwrap()
                    .push(format!("{}:out:{}", self.label, block.counter[0]));
            }
            Ok(Output::from_pending(&mut self.pending))
        }
    }

    /// Source producing `limit` blocks, then failing with a hardware error
    struct FailingSource {
        produced: u64,
        limit: u64,
    }

    impl Module for FailingSource {
        fn name(&self) -> &str {
            "FailingSource"
        }
        fn configuration(&self) -> Option<StreamBlock> {
            Some(StreamBlock::empty(vec![ChannelDescriptor::signal(1, "Cz")], 100.0))
        }
        fn on_input(&mut self, _block: StreamBlock) -> StageResult {
            Ok(())
        }
        fn on_output(&mut self) -> StageResult<Output> {
            if self.produced >= self.limit {
                return Err(StageError::Hardware("connection to hardware is broken!".into()));
            }
            self.produced += 1;
            Ok(Output::Block(block_with_counter(self.produced * 10, 10)))
        }
    }

    /// Vetoes "Stop" and records events and configurations
    #[derive(Default)]
    struct Observer {
        veto_stop: bool,
        ping: bool,
        events: Arc<Mutex<Vec<String>>>,
        configured: Arc<Mutex<Vec<String>>>,
        rename_to: Option<&'static str>,
        sink: Option<EventSink>,
    }

    impl Module for Observer {
        fn name(&self) -> &str {
            "Observer"
        }
        fn attach(&mut self, ctx: ModuleContext) {
            self.sink = Some(ctx.events);
        }
        fn on_query(&mut self, command: &str) -> bool {
            !(self.veto_stop && command == "Stop")
        }
        fn on_update(&mut self, mut params: StreamBlock) -> StageResult<StreamBlock> {
            if let Some(first) = params.channels.first() {
                self.configured.lock().unwrap().push(first.name.clone());
            }
            if let Some(name) = self.rename_to {
                params.channels[0].name = name.to_string();
            }
            Ok(params)
        }
        fn on_event(&mut self, event: &ModuleEvent) -> Option<crate::runtime::node::LifecycleRequest> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}", event.module, event.info));
            None
        }
        fn on_input(&mut self, _block: StreamBlock) -> StageResult {
            if let Some(sink) = self.sink.as_ref().filter(|_| self.ping) {
                sink.command("Ping", "");
            }
            Ok(())
        }
        fn on_output(&mut self) -> StageResult<Output> {
            Ok(Output::NoData)
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_blocks_flow_in_chain_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.add_stage("A", Journaled::new("A", &journal)).unwrap();
        pipeline.add_stage("B", Journaled::new("B", &journal)).unwrap();
        pipeline.add_stage("C", Journaled::new("C", &journal)).unwrap();
        pipeline.chain(&["A", "B", "C"]).unwrap();
        pipeline.start().unwrap();

        let a = pipeline.stage("A").unwrap();
        for i in 0..5 {
            assert!(a.transmit(block_with_counter(i * 100, 2)));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(wait_until(|| journal.lock().unwrap().len() == 5 * 6));
        pipeline.stop(true).unwrap();

        let journal = journal.lock().unwrap();
        let position = |entry: String| {
            journal
                .iter()
                .position(|e| *e == entry)
                .unwrap_or_else(|| panic!("missing {}", entry))
        };
        for i in 0..5 {
            let k = i * 100;
            let a_out = position(format!("A:out:{}", k));
            let b_in = position(format!("B:in:{}", k));
            let b_out = position(format!("B:out:{}", k));
            let c_in = position(format!("C:in:{}", k));
            assert!(a_out < b_in, "B saw block {} before A returned it", k);
            assert!(b_out < c_in, "C saw block {} before B returned it", k);
        }
    }

    #[test]
    fn test_duplicate_and_bad_connections() {
        let mut pipeline = Pipeline::new();
        pipeline.add_stage("A", Passthrough::default()).unwrap();
        pipeline.add_stage("B", Passthrough::default()).unwrap();
        pipeline.add_stage("C", Passthrough::default()).unwrap();

        assert!(matches!(
            pipeline.add_stage("A", Passthrough::default()),
            Err(PipelineError::DuplicateStage(_))
        ));
        assert!(matches!(
            *pipeline.connect("A", "Missing").unwrap_err(),
            ConnectionError::StageNotFound(_)
        ));
        assert!(matches!(
            *pipeline.connect("A", "A").unwrap_err(),
            ConnectionError::SelfLoop(_)
        ));

        pipeline.chain(&["A", "B", "C"]).unwrap();
        assert!(matches!(
            *pipeline.connect("A", "C").unwrap_err(),
            ConnectionError::AlreadyConnected { .. }
        ));
        assert!(matches!(
            *pipeline.connect("C", "A").unwrap_err(),
            ConnectionError::Cycle { .. }
        ));
        assert_eq!(pipeline.stage_names(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_fatal_error_stops_whole_chain() {
        let mut pipeline = Pipeline::new();
        let events = pipeline.subscribe();
        let (collector, seen) = Collector::new();
        pipeline
            .add_stage("Source", FailingSource { produced: 0, limit: 3 })
            .unwrap();
        pipeline.add_stage("Sink", collector).unwrap();
        pipeline.connect("Source", "Sink").unwrap();
        pipeline.start().unwrap();

        let fatal = events
            .iter()
            .find(|e| e.severity() == Some(Severity::Fatal))
            .expect("fatal event");
        assert_eq!(fatal.module, "Source");
        assert!(wait_until(|| !pipeline.is_running()), "pipeline should stop");
        assert!(!pipeline.stage("Sink").unwrap().is_running());
        assert_eq!(pipeline.stage("Source").unwrap().stats().blocks, 3);
        assert!(seen.lock().unwrap().len() <= 3);
    }

    #[test]
    fn test_stop_can_be_vetoed() {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_stage("Source", FailingSource { produced: 0, limit: u64::MAX })
            .unwrap();
        pipeline
            .add_stage(
                "Storage",
                Observer {
                    veto_stop: true,
                    ..Default::default()
                },
            )
            .unwrap();
        pipeline.connect("Source", "Storage").unwrap();
        pipeline.start().unwrap();

        assert!(matches!(pipeline.stop(false), Err(PipelineError::Vetoed)));
        assert!(pipeline.is_running());

        pipeline.send_command("Stop", "");
        thread::sleep(Duration::from_millis(100));
        assert!(pipeline.is_running(), "unforced stop command is vetoed too");

        pipeline.send_command("Stop", "force");
        assert!(wait_until(|| !pipeline.is_running()));
    }

    #[test]
    fn test_events_travel_up_and_down() {
        let top_events = Arc::new(Mutex::new(Vec::new()));
        let bottom_events = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_stage(
                "Top",
                Observer {
                    events: Arc::clone(&top_events),
                    ..Default::default()
                },
            )
            .unwrap();
        pipeline.add_stage("Middle", Passthrough::default()).unwrap();
        pipeline
            .add_stage(
                "Bottom",
                Observer {
                    events: Arc::clone(&bottom_events),
                    ping: true,
                    ..Default::default()
                },
            )
            .unwrap();
        pipeline.chain(&["Top", "Middle", "Bottom"]).unwrap();
        pipeline.start().unwrap();

        // Bottom emits "Ping" when it receives data, Top sees it bubble up
        pipeline
            .stage("Middle")
            .unwrap()
            .transmit(block_with_counter(0, 2));
        assert!(wait_until(|| top_events
            .lock()
            .unwrap()
            .contains(&"Bottom:Ping".to_string())));

        // commands from the owner reach everyone
        pipeline.send_command("StartSaving", "subject01");
        assert!(wait_until(|| bottom_events
            .lock()
            .unwrap()
            .contains(&"Pipeline:StartSaving".to_string())));
        pipeline.stop(true).unwrap();
    }

    #[test]
    fn test_update_flows_top_down() {
        let middle_saw = Arc::new(Mutex::new(Vec::new()));
        let bottom_saw = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_stage("Source", FailingSource { produced: 0, limit: 0 })
            .unwrap();
        pipeline
            .add_stage(
                "Montage",
                Observer {
                    configured: Arc::clone(&middle_saw),
                    rename_to: Some("Cz-avg"),
                    ..Default::default()
                },
            )
            .unwrap();
        pipeline
            .add_stage(
                "Display",
                Observer {
                    configured: Arc::clone(&bottom_saw),
                    ..Default::default()
                },
            )
            .unwrap();
        pipeline.chain(&["Source", "Montage", "Display"]).unwrap();

        pipeline.update();
        assert_eq!(*middle_saw.lock().unwrap(), vec!["Cz".to_string()]);
        assert_eq!(*bottom_saw.lock().unwrap(), vec!["Cz-avg".to_string()]);
    }

    #[test]
    fn test_from_config_and_snapshot() {
        crate::runtime::registry::register_module("test_passthrough", |_| {
            Ok(Box::new(Passthrough::default()))
        });
        let config = PipelineConfig::from_json(
            r#"{ "stages": [
                { "name": "First", "kind": "test_passthrough" },
                { "name": "Second", "kind": "test_passthrough", "queue_size": 7 }
            ] }"#,
        )
        .unwrap();
        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["First", "Second"]);
        assert_eq!(pipeline.stage("Second").unwrap().options().queue_size, 7);

        let snapshot = pipeline.snapshot_config();
        assert_eq!(snapshot.stages[1].parent.as_deref(), Some("First"));
        assert_eq!(snapshot.stages[1].queue_size, Some(7));
        assert_eq!(snapshot.stages[0].kind, "test_passthrough");

        let unknown = PipelineConfig::from_json(r#"{ "stages": [ { "name": "X", "kind": "nope" } ] }"#).unwrap();
        assert!(matches!(
            Pipeline::from_config(&unknown),
            Err(PipelineError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_owner_commands_reach_listeners() {
        let mut pipeline = Pipeline::new();
        let events = pipeline.subscribe();
        pipeline.add_stage("Only", Passthrough::default()).unwrap();
        pipeline.send_command("Hello", "world");
        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.kind, EventKind::Command("world".to_string()));
        assert_eq!(event.module, OWNER);
    }
}
