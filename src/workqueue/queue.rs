/**
 * Deduplicating work queue with checkout / completion semantics
 *
 * `dirty` holds items that need processing, `processing` holds items checked
 * out by a worker, and `queue` holds the ready items in hand-out order. An
 * item is in `queue` only if it is dirty and not being processed, so a
 * given item is never handed to two workers at once.
 */
use crate::error::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
}

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T: Eq + Hash + Clone> QueueState<T> {
    fn pop(&mut self) -> Option<T> {
        let item = self.queue.pop_front()?;
        self.dirty.remove(&item);
        self.processing.insert(item.clone());
        Some(item)
    }
}

impl<T: Eq + Hash + Clone> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> WorkQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing. No-op if it is already queued or
    /// the queue is shutting down. An item currently checked out is queued
    /// again when its worker calls [`WorkQueue::done`].
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Wait for the next item and check it out.
    ///
    /// Returns `None` once the queue is shut down and no ready items remain.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(item) = state.pop() {
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Like [`WorkQueue::get`] but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::QueueShutDown` if the queue is shut down while waiting.
    /// Timing out is not an error and yields `Ok(None)`.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(Error::QueueShutDown),
            Err(_) => Ok(None),
        }
    }

    /// Finish processing `item`. If it was added again while checked out it
    /// goes back to the ready queue.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.available.notify_one();
        }
    }

    /// Number of ready items, not counting checked out ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Stop accepting items and wake every waiting consumer.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        debug!("🛑 work queue shutting down with {} ready items", state.queue.len());
        drop(state);
        self.available.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
