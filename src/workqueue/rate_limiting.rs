/**
 * Delaying queue whose retries are spaced out by a `RateLimiter`
 *
 * Controllers call `forget` + `done` after a successful reconcile and
 * `add_rate_limited` + `done` after a failed one.
 */
use super::delaying::DelayingQueue;
use super::rate_limiter::{RateLimiter, default_controller_rate_limiter};
use crate::error::Result;
use std::hash::Hash;
use std::time::Duration;
use tracing::debug;

pub struct RateLimitingQueue<T> {
    queue: DelayingQueue<T>,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> RateLimitingQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new<L>(limiter: L) -> Self
    where
        L: RateLimiter<T> + 'static,
    {
        Self {
            queue: DelayingQueue::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Queue backed by [`default_controller_rate_limiter`].
    #[must_use]
    pub fn with_default_rate_limiter() -> Self {
        Self::new(default_controller_rate_limiter())
    }

    /// Queue `item` after the limiter's delay for it. Counts as a failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        debug!("🔁 requeue {:?} in {:?}", item, delay);
        self.queue.add_after(item, delay);
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    #[must_use]
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
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

    #[must_use]
    pub fn pending_delay_count(&self) -> usize {
        self.queue.pending_delay_count()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
