//! Debounced Change Watcher
//!
//! Two composable watch kinds over a mutable external surface:
//!
//! - [`SubtreeWatcher`]: coalesces bursts of structural mutations (nodes added
//!   or removed under a target) into one trailing notification after a quiet
//!   period.
//! - [`watch_navigation`]: polls the current location and listens for
//!   back/forward events, firing immediately whenever the location changes.
//!
//! [`FsSubtreeSource`] feeds a `SubtreeWatcher` from a recursive directory
//! watch, treating the directory tree as the observed subtree.

use crate::error::RuntimeError;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Watcher timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Quiet period before a subtree notification fires
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Navigation poll interval
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_debounce_ms() -> u64 {
    150
}

fn default_interval_ms() -> u64 {
    500
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            interval_ms: default_interval_ms(),
        }
    }
}

/// One batch of observed mutations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationBatch {
    pub added: usize,
    pub removed: usize,
}

impl MutationBatch {
    pub fn added(count: usize) -> Self {
        Self {
            added: count,
            removed: 0,
        }
    }

    pub fn removed(count: usize) -> Self {
        Self {
            added: 0,
            removed: count,
        }
    }

    /// Only batches that add or remove nodes arm the debounce timer
    pub fn is_structural(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

struct SubtreeTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

struct SubtreeInner {
    debounce: Duration,
    callback: ChangeCallback,
    runtime: Handle,
    /// Held for reading while the callback runs; `disconnect` takes it for writing
    active: RwLock<bool>,
    timer: Mutex<SubtreeTimer>,
}

/// Trailing-edge debouncer for structural mutations
///
/// The callback must not call [`SubtreeWatcher::disconnect`] on its own
/// watcher.
#[derive(Clone)]
pub struct SubtreeWatcher {
    inner: Arc<SubtreeInner>,
}

impl SubtreeWatcher {
    /// Create a watcher bound to the current Tokio runtime
    pub fn new<F>(debounce: Duration, callback: F) -> Result<Self, RuntimeError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| RuntimeError::Internal(format!("No async runtime for watcher: {}", e)))?;
        Ok(Self {
            inner: Arc::new(SubtreeInner {
                debounce,
                callback: Arc::new(callback),
                runtime,
                active: RwLock::new(true),
                timer: Mutex::new(SubtreeTimer {
                    handle: None,
                    generation: 0,
                }),
            }),
        })
    }

    /// Feed one mutation batch; a structural batch (re)arms the timer
    pub fn observe(&self, batch: MutationBatch) {
        if !batch.is_structural() || !*self.inner.active.read_recursive() {
            return;
        }

        let mut timer = self.inner.timer.lock();
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.generation += 1;
        let generation = timer.generation;
        let inner = Arc::clone(&self.inner);
        timer.handle = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            {
                let mut timer = inner.timer.lock();
                if timer.generation != generation {
                    return;
                }
                timer.handle = None;
            }
            let active = inner.active.read_recursive();
            if *active {
                debug!("Subtree change settled");
                (inner.callback)();
            }
        }));
    }

    pub fn is_active(&self) -> bool {
        *self.inner.active.read_recursive()
    }

    /// Stop observing. The callback never runs after this returns.
    pub fn disconnect(&self) {
        *self.inner.active.write() = false;
        if let Some(handle) = self.inner.timer.lock().handle.take() {
            handle.abort();
        }
    }
}

/// Source of the current location
pub trait LocationSource: Send + Sync {
    fn current(&self) -> String;
}

/// Back/forward navigation notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    Back,
    Forward,
}

/// Location shared between an owner that navigates and a watcher
#[derive(Clone)]
pub struct SharedLocation {
    current: Arc<RwLock<String>>,
    history: broadcast::Sender<HistoryEvent>,
}

impl SharedLocation {
    pub fn new(initial: impl Into<String>) -> Self {
        let (history, _) = broadcast::channel(16);
        Self {
            current: Arc::new(RwLock::new(initial.into())),
            history,
        }
    }

    /// Change the location without emitting a history event
    pub fn set(&self, location: impl Into<String>) {
        *self.current.write() = location.into();
    }

    /// Change the location and emit a history event
    pub fn traverse(&self, location: impl Into<String>, event: HistoryEvent) {
        self.set(location);
        // No subscribers is fine; polling still catches the change
        let _ = self.history.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.history.subscribe()
    }
}

impl LocationSource for SharedLocation {
    fn current(&self) -> String {
        self.current.read().clone()
    }
}

/// Disposer for a navigation watch
///
/// Dropping the handle also disposes it.
pub struct NavigationHandle {
    task: Option<JoinHandle<()>>,
    active: Arc<RwLock<bool>>,
}

impl NavigationHandle {
    /// Remove the listener and cancel polling
    pub fn dispose(self) {
        drop(self);
    }

    fn shutdown(&mut self) {
        *self.active.write() = false;
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Navigation watch disposed");
        }
    }
}

impl Drop for NavigationHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Watch a location for changes
///
/// Fires `on_change` with the new location, without debounce, whenever a
/// poll tick or history event observes a value different from the last one.
pub fn watch_navigation<F>(
    location: Arc<dyn LocationSource>,
    mut history: broadcast::Receiver<HistoryEvent>,
    interval: Duration,
    on_change: F,
) -> NavigationHandle
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let active = Arc::new(RwLock::new(true));
    let gate = Arc::clone(&active);
    let interval = interval.max(Duration::from_millis(1));

    let task = tokio::spawn(async move {
        let mut last = location.current();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut history_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                event = history.recv(), if history_open => match event {
                    Ok(event) => debug!(?event, "History navigation observed"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "History listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => history_open = false,
                },
            }

            let current = location.current();
            if current != last {
                let active = gate.read_recursive();
                if !*active {
                    return;
                }
                debug!(from = %last, to = %current, "Location changed");
                last = current;
                on_change(&last);
            }
        }
    });

    NavigationHandle {
        task: Some(task),
        active,
    }
}

/// Recursive directory watch feeding a [`SubtreeWatcher`]
pub struct FsSubtreeSource {
    _watcher: RecommendedWatcher,
}

impl FsSubtreeSource {
    pub fn watch(root: &Path, subtree: SubtreeWatcher) -> Result<Self, RuntimeError> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => subtree.observe(mutation_batch(&event)),
            Err(e) => warn!("Watch error: {}", e),
        })
        .map_err(|e| RuntimeError::Internal(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| RuntimeError::Internal(format!("Failed to watch directory: {}", e)))?;

        info!(root = ?root, "Watching subtree");
        Ok(Self { _watcher: watcher })
    }
}

/// Classify a filesystem event as subtree mutations
pub fn mutation_batch(event: &Event) -> MutationBatch {
    let count = event.paths.len().max(1);
    match event.kind {
        EventKind::Create(_) => MutationBatch::added(count),
        EventKind::Remove(_) => MutationBatch::removed(count),
        EventKind::Modify(ModifyKind::Name(_)) => MutationBatch {
            added: 1,
            removed: 1,
        },
        _ => MutationBatch::default(),
    }
}
