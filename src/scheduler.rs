/**
 * Cancellable one-shot and fixed-rate timers on the Tokio runtime
 *
 * Every task scheduled through a `Scheduler` is tied to the scheduler's
 * cancellation token, so `shutdown` releases all of them at once.
 */
use std::time::Duration;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    token: CancellationToken,
}

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay` unless cancelled first.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.token.child_token();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = sleep(delay) => task(),
            }
        });
        ScheduledTask { token }
    }

    /// Run `task` after `initial`, then every `period`, until cancelled.
    ///
    /// Ticks missed while `task` was running are skipped rather than bunched up.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime or if `period` is zero
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial: Duration,
        period: Duration,
        mut task: F,
    ) -> ScheduledTask
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.token.child_token();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => task(),
                }
            }
        });
        ScheduledTask { token }
    }

    /// Cancel every task scheduled so far and refuse to run new ones.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            debug!("⏹️  scheduler shutting down");
            self.token.cancel();
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_runs_once() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        scheduler.schedule(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(40)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let task = scheduler.schedule(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_until_shutdown() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let task = scheduler.schedule_at_fixed_rate(
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        sleep(Duration::from_millis(35)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        assert!(task.is_cancelled());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
