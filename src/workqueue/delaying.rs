/**
 * Work queue with delayed, coalesced re-delivery
 *
 * At most one timer is pending per item. A newer `add_after` replaces the
 * pending timer and an immediate `add` cancels it.
 */
use super::queue::WorkQueue;
use crate::error::Result;
use crate::scheduler::{ScheduledTask, Scheduler};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

struct PendingDelay {
    generation: u64,
    task: ScheduledTask,
}

/// Pending timers, plus the shutdown mark checked under the same lock
struct Delays<T> {
    timers: HashMap<T, PendingDelay>,
    closed: bool,
}

type PendingMap<T> = Arc<Mutex<Delays<T>>>;

fn lock<T>(pending: &PendingMap<T>) -> MutexGuard<'_, Delays<T>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DelayingQueue<T> {
    queue: Arc<WorkQueue<T>>,
    pending: PendingMap<T>,
    generation: AtomicU64,
    scheduler: Scheduler,
}

impl<T> Default for DelayingQueue<T>
where
    T: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayingQueue<T>
where
    T: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            pending: Arc::new(Mutex::new(Delays {
                timers: HashMap::new(),
                closed: false,
            })),
            generation: AtomicU64::new(0),
            scheduler: Scheduler::new(),
        }
    }

    /// Queue `item` now, cancelling any delayed delivery of it.
    pub fn add(&self, item: T) {
        if let Some(old) = lock(&self.pending).timers.remove(&item) {
            old.task.cancel();
        }
        self.queue.add(item);
    }

    /// Queue `item` once `delay` has passed. A zero delay is an immediate
    /// [`DelayingQueue::add`]. Replaces any delay already pending for `item`.
    ///
    /// # Panics
    ///
    /// Panics if a non-zero delay is requested outside of a Tokio runtime
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut pending = lock(&self.pending);
        if pending.closed {
            return;
        }
        if let Some(old) = pending.timers.remove(&item) {
            trace!("⏱️  replacing pending delay for {:?}", item);
            old.task.cancel();
        }

        let queue = Arc::clone(&self.queue);
        let fired = Arc::clone(&self.pending);
        let key = item.clone();
        let task = self.scheduler.schedule(delay, move || {
            let current = {
                let mut pending = lock(&fired);
                let current = pending
                    .timers
                    .get(&key)
                    .is_some_and(|delay| delay.generation == generation);
                if current {
                    pending.timers.remove(&key);
                }
                current
            };
            if current {
                queue.add(key);
            }
        });
        pending.timers.insert(item, PendingDelay { generation, task });
    }

    /// Number of items waiting for their delay to expire.
    #[must_use]
    pub fn pending_delay_count(&self) -> usize {
        lock(&self.pending).timers.len()
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    /// # Errors
    ///
    /// Returns `Error::QueueShutDown` if the queue is shut down while waiting
    pub async fn poll(&self, timeout: Duration) -> Result<Option<T>> {
        self.queue.poll(timeout).await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Cancel every pending delay, then shut the underlying queue down.
    pub fn shutdown(&self) {
        {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            for (_, delay) in pending.timers.drain() {
                delay.task.cancel();
            }
        }
        self.scheduler.shutdown();
        self.queue.shutdown();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
