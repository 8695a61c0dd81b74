//! Stage: a module plus its input queue, worker thread and lifecycle
//!
//! Each stage owns a bounded input queue and runs its module on a dedicated
//! worker thread. The worker polls the queue without blocking, calls
//! `on_input` and `on_output` under the stage lock, and fans produced blocks
//! out to the downstream stages. Producers never block: a full queue drops
//! the block and reports an overrun.
//!
//! Lifecycle commands propagate top-down through the receivers:
//! `start` flushes the queue, runs `on_start`, pushes the module's
//! configuration down the chain, starts the receivers and finally the worker;
//! `stop` ends the worker (bounded join), stops the receivers and then runs
//! `on_stop`.

use super::block::StreamBlock;
use super::errors::{Severity, StageError, StageResult};
use super::event::{EventSink, ModuleEvent};
use super::node::{LifecycleRequest, Module, ModuleContext, Output};
use super::watchdog::{Watchdog, WatchdogHandle};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_SIZE: usize = 20;
pub const DEFAULT_IDLE: Duration = Duration::from_millis(1);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-stage runtime options
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StageOptions {
    /// Capacity of the input queue
    pub queue_size: usize,
    /// Sleep after a worker iteration without input
    pub idle: Duration,
    /// How long `stop` waits for the worker thread
    pub join_timeout: Duration,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            idle: DEFAULT_IDLE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// The worker exited on a fatal error; `stop` or `start` cleans up
    Failed,
}

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    overruns: AtomicU64,
    errors: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Counters {
    fn record(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }
}

/// Snapshot of a stage's counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageStats {
    pub blocks: u64,
    pub overruns: u64,
    pub errors: u64,
    pub total_time: Duration,
    pub max_time: Duration,
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
    thread: ThreadId,
}

pub struct Stage {
    name: String,
    module: Mutex<Box<dyn Module>>,
    input_tx: Sender<StreamBlock>,
    input_rx: Receiver<StreamBlock>,
    receivers: Mutex<Vec<Arc<Stage>>>,
    state: Mutex<StageState>,
    /// Serializes start and stop of this stage
    lifecycle: Mutex<()>,
    /// Bumped on every start and stop; a worker exits when it no longer matches
    generation: AtomicU64,
    worker: Mutex<Option<Worker>>,
    events: EventSink,
    counters: Counters,
    watchdog: WatchdogHandle,
    options: StageOptions,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        module: Box<dyn Module>,
        options: StageOptions,
        events: EventSink,
        watchdog: &Watchdog,
    ) -> Arc<Self> {
        let name = name.into();
        let (input_tx, input_rx) = bounded(options.queue_size.max(1));
        let handle = watchdog.register(&name, "process");
        Arc::new_cyclic(|weak| {
            let mut module = module;
            module.attach(ModuleContext {
                events: events.clone(),
                stage: StageHandle {
                    stage: weak.clone(),
                },
            });
            Stage {
                name,
                module: Mutex::new(module),
                input_tx,
                input_rx,
                receivers: Mutex::new(Vec::new()),
                state: Mutex::new(StageState::Idle),
                lifecycle: Mutex::new(()),
                generation: AtomicU64::new(0),
                worker: Mutex::new(None),
                events,
                counters: Counters::default(),
                watchdog: handle,
                options,
            }
        })
    }

    /// Stage outside of a pipeline; events only go to the tracing log
    pub fn detached(name: impl Into<String>, module: Box<dyn Module>) -> Arc<Self> {
        let name = name.into();
        let events = EventSink::detached(name.clone());
        Self::new(name, module, StageOptions::default(), events, &Watchdog::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StageState::Running
    }

    pub fn options(&self) -> StageOptions {
        self.options
    }

    pub fn receivers(&self) -> Vec<Arc<Stage>> {
        self.receivers.lock().unwrap().clone()
    }

    /// Number of blocks waiting in the input queue
    pub fn queued(&self) -> usize {
        self.input_rx.len()
    }

    pub fn stats(&self) -> StageStats {
        StageStats {
            blocks: self.counters.blocks.load(Ordering::Relaxed),
            overruns: self.counters.overruns.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.counters.total_ns.load(Ordering::Relaxed)),
            max_time: Duration::from_nanos(self.counters.max_ns.load(Ordering::Relaxed)),
        }
    }

    /// Run a closure with the module locked
    pub fn with_module<R>(&self, f: impl FnOnce(&mut dyn Module) -> R) -> R {
        let mut module = self.module.lock().unwrap();
        f(module.as_mut())
    }

    /// Attach a downstream stage; it is started right away if we are running
    pub fn add_receiver(&self, receiver: Arc<Stage>) {
        if self.is_running()
            && let Err(e) = receiver.start()
        {
            warn!("[{}] Receiver '{}' failed to start: {}", self.name, receiver.name, e);
        }
        self.receivers.lock().unwrap().push(receiver);
    }

    /// Detach and stop a downstream stage
    pub fn remove_receiver(&self, name: &str) -> Option<Arc<Stage>> {
        let removed = {
            let mut receivers = self.receivers.lock().unwrap();
            let index = receivers.iter().position(|r| r.name == name)?;
            receivers.remove(index)
        };
        removed.stop();
        Some(removed)
    }

    fn set_state(&self, state: StageState) {
        *self.state.lock().unwrap() = state;
    }

    fn report(&self, e: &StageError, severity: Severity) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        debug!("[{}] {} ({})", self.name, e, severity);
        self.events.error(e.to_string(), severity);
    }

    pub fn start(self: &Arc<Self>) -> StageResult {
        let _lifecycle = self.lifecycle.lock().unwrap();
        match self.state() {
            StageState::Idle => {}
            StageState::Failed => {
                debug!("[{}] Restarting after a fatal error", self.name);
                self.shutdown();
            }
            _ => {
                debug!("[{}] Already running", self.name);
                return Ok(());
            }
        }
        self.set_state(StageState::Starting);

        while self.input_rx.try_recv().is_ok() {}

        let params = {
            let mut module = self.module.lock().unwrap();
            let _op = self.watchdog.guard();
            match guarded(|| module.on_start()) {
                Ok(()) => module.configuration(),
                Err(e) => {
                    drop(module);
                    self.set_state(StageState::Idle);
                    self.report(&e, Severity::Fatal);
                    return Err(e);
                }
            }
        };
        if let Some(params) = params {
            self.propagate_update(params);
        }

        for receiver in self.receivers() {
            if let Err(e) = receiver.start() {
                warn!("[{}] Receiver '{}' failed to start: {}", self.name, receiver.name, e);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (done_tx, done_rx) = bounded(1);
        let stage = Arc::clone(self);
        // Running before the worker exists, so a fatal first iteration can mark it Failed
        self.set_state(StageState::Running);
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                stage.run(generation);
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(handle) => {
                let thread = handle.thread().id();
                *self.worker.lock().unwrap() = Some(Worker {
                    handle,
                    done: done_rx,
                    thread,
                });
                info!("[{}] Started", self.name);
                Ok(())
            }
            Err(e) => {
                self.set_state(StageState::Idle);
                let e = StageError::Io(e);
                self.report(&e, Severity::Fatal);
                Err(e)
            }
        }
    }

    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap();
        self.shutdown();
    }

    /// Stop sequence; the caller holds the lifecycle lock
    fn shutdown(&self) {
        let was_active = self.state() != StageState::Idle;
        if was_active {
            self.set_state(StageState::Stopping);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.thread == thread::current().id() {
                debug!("[{}] Stop requested from own worker", self.name);
            } else {
                match worker.done.recv_timeout(self.options.join_timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        if worker.handle.join().is_err() {
                            error!("[{}] Worker thread panicked", self.name);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            "[{}] Worker did not finish within {:?}, continuing shutdown",
                            self.name, self.options.join_timeout
                        );
                    }
                }
            }
        }

        for receiver in self.receivers() {
            receiver.stop();
        }

        if was_active {
            let result = {
                let mut module = self.module.lock().unwrap();
                guarded(|| module.on_stop())
            };
            if let Err(e) = result {
                self.report(&e, Severity::Notify);
            }
            self.set_state(StageState::Idle);
            info!("[{}] Stopped", self.name);
        }
    }

    /// Consensus vote: this stage first, then every receiver
    pub fn query(&self, command: &str) -> bool {
        let accepted = self.module.lock().unwrap().on_query(command);
        if !accepted {
            info!("[{}] Vetoed '{}'", self.name, command);
            return false;
        }
        self.receivers().iter().all(|r| r.query(command))
    }

    /// Pass a configuration through this stage and on down the chain
    pub fn update(&self, params: StreamBlock) {
        let result = {
            let mut module = self.module.lock().unwrap();
            guarded(|| module.on_update(params))
        };
        match result {
            Ok(params) => self.propagate_update(params),
            Err(e) => self.report(&e, Severity::Fatal),
        }
    }

    /// Hand a configuration to the receivers without processing it here
    pub fn propagate_update(&self, params: StreamBlock) {
        for receiver in self.receivers() {
            receiver.update(params.clone());
        }
    }

    /// Enqueue a block without blocking; a full queue drops it
    pub fn transmit(&self, block: StreamBlock) -> bool {
        match self.input_tx.try_send(block) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                self.events
                    .error("Input queue FULL, overrun!", Severity::Notify);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Deliver an event to the module and act on its lifecycle request
    pub fn deliver_event(self: &Arc<Self>, event: &ModuleEvent) {
        let request = self.module.lock().unwrap().on_event(event);
        match request {
            None => {}
            Some(LifecycleRequest::Start) => {
                let _ = self.start();
            }
            Some(LifecycleRequest::Stop { force }) => {
                if force || self.query("Stop") {
                    self.stop();
                }
            }
            Some(LifecycleRequest::Restart) => {
                if self.is_running() {
                    if !self.query("Stop") {
                        return;
                    }
                    self.stop();
                }
                let _ = self.start();
            }
        }
    }

    /// Release module resources; the stage must not be started afterwards
    pub fn terminate(&self) {
        self.module.lock().unwrap().terminate();
    }

    fn run(&self, generation: u64) {
        let mut produced = 0u64;
        while self.generation.load(Ordering::Acquire) == generation {
            let mut elapsed = Duration::ZERO;
            let mut had_input = false;
            let mut fatal = false;

            let output = {
                let mut module = self.module.lock().unwrap();
                let _op = self.watchdog.guard();

                if let Ok(block) = self.input_rx.try_recv() {
                    had_input = true;
                    let t = Instant::now();
                    let result = guarded(|| module.on_input(block));
                    elapsed += t.elapsed();
                    if let Err(e) = result {
                        fatal |= e.severity() == Severity::Fatal;
                        self.report(&e, e.severity());
                    }
                }

                let t = Instant::now();
                let output = match guarded(|| module.on_output()) {
                    Ok(output) => output,
                    Err(e) => {
                        fatal |= e.severity() == Severity::Fatal;
                        self.report(&e, e.severity());
                        Output::NoData
                    }
                };
                elapsed += t.elapsed();

                if !had_input {
                    module.on_idle();
                }
                output
            };

            if let Output::Block(mut block) = output {
                block.telemetry.processing_time += elapsed;
                self.counters.record(elapsed);
                produced += 1;
                self.fan_out(block);
            }

            if fatal {
                error!("[{}] Fatal error, worker exits", self.name);
                let mut state = self.state.lock().unwrap();
                if *state == StageState::Running && self.generation.load(Ordering::Acquire) == generation {
                    *state = StageState::Failed;
                }
                break;
            }
            if !had_input {
                thread::sleep(self.options.idle);
            }
        }
        info!("[{}] Shutdown. Produced {} blocks.", self.name, produced);
    }

    /// Copies to every receiver but the last, the original to the last
    fn fan_out(&self, block: StreamBlock) {
        let receivers = self.receivers();
        if let Some((last, others)) = receivers.split_last() {
            for receiver in others {
                receiver.transmit(block.clone());
            }
            last.transmit(block);
        }
    }
}

/// Weak handle a module keeps to its own stage
#[derive(Clone, Default)]
pub struct StageHandle {
    stage: Weak<Stage>,
}

impl StageHandle {
    fn upgrade(&self) -> StageResult<Arc<Stage>> {
        self.stage
            .upgrade()
            .ok_or_else(|| StageError::Module("stage no longer exists".to_string()))
    }

    pub fn start(&self) -> StageResult {
        self.upgrade()?.start()
    }

    pub fn stop(&self) {
        if let Ok(stage) = self.upgrade() {
            stage.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.upgrade().map(|s| s.is_running()).unwrap_or(false)
    }

    pub fn propagate_update(&self, params: StreamBlock) {
        if let Ok(stage) = self.upgrade() {
            stage.propagate_update(params);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a module callback, turning a panic into a fatal error
fn guarded<T>(f: impl FnOnce() -> StageResult<T>) -> StageResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(StageError::Module(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}
