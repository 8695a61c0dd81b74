//! Watchdog for stage callbacks that block for too long
//!
//! Every stage registers its processing operation here. The worker stores the
//! start time of each locked callback in an atomic; a monitoring thread scans
//! the timestamps once per second and warns about callbacks running longer
//! than the threshold (a module stuck on hardware or a socket).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Callbacks running longer than this are reported
pub const BLOCKED_THRESHOLD: Duration = Duration::from_secs(5);

#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

struct OperationState {
    /// Start of the running callback in ms since epoch, 0 when idle
    started: AtomicU64,
    warned: AtomicBool,
    stage: String,
    operation: String,
}

/// Handle held by a stage for one monitored operation
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<OperationState>,
}

impl WatchdogHandle {
    #[inline(always)]
    pub fn begin(&self) {
        self.state.started.store(now_millis(), Ordering::Relaxed);
        self.state.warned.store(false, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn end(&self) {
        if self.state.warned.swap(false, Ordering::Relaxed) {
            info!(
                "[{}] {} finished after being reported as blocked",
                self.state.stage, self.state.operation
            );
        }
        self.state.started.store(0, Ordering::Relaxed);
    }

    /// Scope guard around one callback
    pub fn guard(&self) -> OperationGuard<'_> {
        OperationGuard::new(self)
    }
}

/// Registry of monitored stage operations
#[derive(Clone)]
pub struct Watchdog {
    operations: Arc<Mutex<Vec<Weak<OperationState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::with_threshold(BLOCKED_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            operations: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    pub fn register(&self, stage: &str, operation: &str) -> WatchdogHandle {
        let state = Arc::new(OperationState {
            started: AtomicU64::new(0),
            warned: AtomicBool::new(false),
            stage: stage.to_string(),
            operation: operation.to_string(),
        });
        self.operations.lock().unwrap().push(Arc::downgrade(&state));
        WatchdogHandle { state }
    }

    /// Warn once per blocked operation; returns the stages newly reported
    pub fn check_for_blocked(&self) -> Vec<String> {
        let now = now_millis();
        let threshold = self.threshold.as_millis() as u64;
        let mut reported = Vec::new();

        let mut operations = self.operations.lock().unwrap();
        operations.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let started = state.started.load(Ordering::Relaxed);
            if started > 0 {
                let blocked = now.saturating_sub(started);
                if blocked > threshold && !state.warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "[{}] {} blocked for {:.1}s",
                        state.stage,
                        state.operation,
                        blocked as f64 / 1000.0
                    );
                    reported.push(state.stage.clone());
                }
            }
            true
        });
        reported
    }

    pub fn start_monitoring_thread(&self) -> JoinHandle<()> {
        let watchdog = self.clone();
        std::thread::spawn(move || {
            'monitor: loop {
                for _ in 0..10 {
                    std::thread::sleep(Duration::from_millis(100));
                    if !watchdog.enabled.load(Ordering::Relaxed) {
                        break 'monitor;
                    }
                }
                watchdog.check_for_blocked();
            }
        })
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard marking one callback as in progress
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.begin();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.end();
    }
}
