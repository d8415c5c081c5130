//! Coalescing Batcher
//!
//! Accumulates items and hands them to an async handler in bounded slices.
//! A flush is scheduled `max_wait` after the first enqueue into an idle
//! queue; later enqueues never push that deadline back. At most one flush is
//! in flight, and leftovers trigger an immediate follow-up flush once it ends.
//!
//! Timers are never aborted. Each carries a generation; re-arming, clearing
//! or a manual flush retires the current one, and a retired timer wakes and
//! returns without flushing. A flush that already started always completes.
//!
//! Failure asymmetry: a manual [`Batcher::flush`] returns the handler's error
//! to its caller, while a timer-driven flush logs and drops it.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Batcher thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum items handed to one handler call
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Delay from the first enqueue to the scheduled flush
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_max_batch() -> usize {
    25
}

fn default_max_wait_ms() -> u64 {
    50
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

type BatchHandler<T, E> = dyn Fn(Vec<T>) -> BoxFuture<'static, Result<(), E>> + Send + Sync;

struct BatchState<T> {
    queue: VecDeque<T>,
    /// Generation of the armed timer, if any
    timer: Option<u64>,
    timer_generation: u64,
    in_flight: bool,
}

struct Inner<T, E> {
    config: BatchConfig,
    state: Mutex<BatchState<T>>,
    handler: Box<BatchHandler<T, E>>,
}

/// Cloneable handle to a shared batch queue
pub struct Batcher<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Batcher<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Batcher<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    /// Create a batcher. Enqueueing must happen inside a Tokio runtime.
    pub fn new<F, Fut>(config: BatchConfig, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let config = BatchConfig {
            max_batch: config.max_batch.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BatchState {
                    queue: VecDeque::new(),
                    timer: None,
                    timer_generation: 0,
                    in_flight: false,
                }),
                handler: Box::new(move |items| handler(items).boxed()),
            }),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.inner.config
    }

    pub fn enqueue(&self, item: T) {
        self.enqueue_all(std::iter::once(item));
    }

    pub fn enqueue_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.inner.state.lock();
        let before = state.queue.len();
        state.queue.extend(items);
        if state.queue.len() == before {
            return;
        }
        if state.timer.is_none() {
            let delay = Duration::from_millis(self.inner.config.max_wait_ms);
            self.schedule_locked(&mut state, delay);
        }
    }

    /// Flush up to `max_batch` items now
    ///
    /// No-op when the queue is empty or another flush is running.
    pub async fn flush(&self) -> Result<(), E> {
        let batch: Vec<T> = {
            let mut state = self.inner.state.lock();
            if state.in_flight || state.queue.is_empty() {
                return Ok(());
            }
            state.timer = None;
            let take = self.inner.config.max_batch.min(state.queue.len());
            state.in_flight = true;
            state.queue.drain(..take).collect()
        };

        let guard = InFlightGuard {
            batcher: self.clone(),
        };
        debug!(batch_size = batch.len(), "Flushing batch");
        let result = (self.inner.handler)(batch).await;
        drop(guard);
        result
    }

    /// Drop pending items and cancel the scheduled flush
    ///
    /// A flush that already started runs to completion.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.queue.clear();
        state.timer = None;
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn in_flight(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    /// Arm a timer, retiring any previous one
    fn schedule_locked(&self, state: &mut BatchState<T>, delay: Duration) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        state.timer = Some(generation);
        let batcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = batcher.inner.state.lock();
                if state.timer != Some(generation) {
                    return;
                }
                state.timer = None;
            }
            if let Err(e) = batcher.flush().await {
                warn!(error = %e, "Scheduled batch flush failed");
            }
        });
    }
}

/// Clears the in-flight flag even if the flush future is dropped or panics
struct InFlightGuard<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    batcher: Batcher<T, E>,
}

impl<T, E> Drop for InFlightGuard<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    fn drop(&mut self) {
        let mut state = self.batcher.inner.state.lock();
        state.in_flight = false;
        if !state.queue.is_empty() {
            self.batcher.schedule_locked(&mut state, Duration::ZERO);
        }
    }
}
