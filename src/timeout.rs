//! # Timeout Monitor
//!
//! One periodic task checks every registered idle-timeout callback, so live
//! subscriptions do not each need a timer of their own.
//!
//! ```text
//!   every `resolution`:
//!     snapshot callbacks ──► invoke each (registry unlocked)
//!                                  │
//!              true or panic ──────┴──► unregister
//! ```
//!
//! ## Ownership
//!
//! The monitor is an ordinary value behind an `Arc`, created by whoever owns
//! the runtime and handed to each component that needs it. The ticking task
//! only holds a weak reference; dropping the last `Arc` (or calling
//! [`TimeoutMonitor::shutdown`]) stops it.
//!
//! ## Concurrency
//!
//! A tick copies the registry before invoking anything, so callbacks may
//! register or unregister (themselves included) while a tick is running.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

/// Check invoked on every tick; returns `true` once it has timed out.
pub type TimeoutCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Registry {
    callbacks: Mutex<BTreeMap<u64, TimeoutCheck>>,
    next_id: AtomicU64,
}

/// Shared periodic timeout checker.
pub struct TimeoutMonitor {
    registry: Arc<Registry>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TimeoutMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutMonitor")
            .field("registered", &self.len())
            .finish()
    }
}

impl TimeoutMonitor {
    /// Creates a monitor that only ticks when [`tick`](Self::tick) is called.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry::default()),
            task: Mutex::new(None),
        })
    }

    /// Creates a monitor ticking every `resolution` on the current runtime.
    ///
    /// Ticks use fixed-delay scheduling: a slow tick pushes the next one back
    /// instead of bursting to catch up.
    pub fn spawn(resolution: Duration) -> Arc<Self> {
        let monitor = Self::new();
        let registry = Arc::downgrade(&monitor.registry);
        let handle = tokio::spawn(run_ticks(registry, resolution));
        *monitor.task.lock() = Some(handle);
        monitor
    }

    /// Registers a check; it stays registered until it returns `true`,
    /// panics, or the handle is dropped.
    pub fn register(&self, check: impl Fn() -> bool + Send + Sync + 'static) -> TimeoutHandle {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.callbacks.lock().insert(id, Arc::new(check));
        TimeoutHandle {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Runs one round of checks, returning how many were unregistered.
    pub fn tick(&self) -> usize {
        tick_registry(&self.registry)
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.registry.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the ticking task. Registered checks are kept but no longer run
    /// unless `tick` is called by hand.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_ticks(registry: Weak<Registry>, resolution: Duration) {
    let mut interval = tokio::time::interval(resolution);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        tick_registry(&registry);
    }
}

fn tick_registry(registry: &Registry) -> usize {
    let snapshot: Vec<(u64, TimeoutCheck)> = registry
        .callbacks
        .lock()
        .iter()
        .map(|(id, check)| (*id, Arc::clone(check)))
        .collect();

    let mut expired = Vec::new();
    for (id, check) in snapshot {
        match catch_unwind(AssertUnwindSafe(|| check())) {
            Ok(true) => expired.push(id),
            Ok(false) => {}
            Err(_) => {
                warn!(id, "timeout check panicked, unregistering");
                expired.push(id);
            }
        }
    }

    if !expired.is_empty() {
        let mut callbacks = registry.callbacks.lock();
        for id in &expired {
            callbacks.remove(id);
        }
        trace!(count = expired.len(), "timeout checks expired");
    }
    expired.len()
}

// =============================================================================
// Handle
// =============================================================================

/// Registration of one check. Dropping it unregisters the check.
#[derive(Debug)]
pub struct TimeoutHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl TimeoutHandle {
    /// Unregisters the check now.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.callbacks.lock().remove(&self.id);
        }
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
