/**
 * Event handlers and the copy-on-write registry they are dispatched from
 *
 * Dispatch iterates a snapshot of the registry, so registering or removing
 * a handler never waits on an in-flight dispatch. Removed handlers are
 * switched off first, and every call checks that switch. A handler that
 * still owes its catch-up replay is skipped by live dispatch until the
 * replay has run.
 */
use crate::scheduler::ScheduledTask;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Callbacks invoked by informers. Keep them fast: enqueue a key and return.
#[allow(unused_variables)]
pub trait ResourceEventHandler<K>: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged by the informer and otherwise ignored
    fn on_add(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Also called with `old == new` on periodic resync.
    ///
    /// # Errors
    ///
    /// Errors are logged by the informer and otherwise ignored
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Errors are logged by the informer and otherwise ignored
    fn on_delete(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        Ok(())
    }
}

type ObjFn<K> = Box<dyn Fn(&Arc<K>) -> anyhow::Result<()> + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&Arc<K>, &Arc<K>) -> anyhow::Result<()> + Send + Sync>;

/// Handler assembled from closures; unset callbacks do nothing.
pub struct EventHandlerFns<K> {
    add: Option<ObjFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<ObjFn<K>>,
}

impl<K> Default for EventHandlerFns<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> EventHandlerFns<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            add: None,
            update: None,
            delete: None,
        }
    }

    #[must_use]
    pub fn with_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<K>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn with_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<K>, &Arc<K>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn with_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<K>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K> ResourceEventHandler<K> for EventHandlerFns<K> {
    fn on_add(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) -> anyhow::Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

/// What a handler is told about
#[derive(Debug)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> Notification<K> {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// One handler attached to an informer.
pub struct EventHandlerRegistration<K> {
    id: Uuid,
    handler: Arc<dyn ResourceEventHandler<K>>,
    active: AtomicBool,
    caught_up: AtomicBool,
    resync_period: Duration,
    resync_task: Mutex<Option<ScheduledTask>>,
}

impl<K> std::fmt::Debug for EventHandlerRegistration<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlerRegistration")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl<K> EventHandlerRegistration<K> {
    pub(crate) fn new(handler: Arc<dyn ResourceEventHandler<K>>, resync_period: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            handler,
            active: AtomicBool::new(true),
            caught_up: AtomicBool::new(true),
            resync_period,
            resync_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// False while the cached objects are still to be replayed to this handler.
    #[must_use]
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    pub(crate) fn await_catch_up(&self) {
        self.caught_up.store(false, Ordering::Release);
    }

    pub(crate) fn catch_up_done(&self) {
        self.caught_up.store(true, Ordering::Release);
    }

    /// Zero means this handler is never resynced.
    #[must_use]
    pub const fn resync_period(&self) -> Duration {
        self.resync_period
    }

    pub(crate) fn set_resync_task(&self, task: ScheduledTask) {
        let mut slot = self.resync_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(task) {
            old.cancel();
        }
    }

    /// Stop delivering to this handler and cancel its resync.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let task = self
            .resync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    /// Deliver `notification` if still active. Failures and panics are logged.
    pub(crate) fn notify(&self, notification: &Notification<K>) {
        if !self.is_active() {
            return;
        }
        let handler = &self.handler;
        let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
            Notification::Add(obj) => handler.on_add(obj),
            Notification::Update { old, new } => handler.on_update(old, new),
            Notification::Delete(obj) => handler.on_delete(obj),
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "⚠️  handler {} failed on {}: {:#}",
                self.id,
                notification.kind(),
                e
            ),
            Err(_) => error!("❌ handler {} panicked on {}", self.id, notification.kind()),
        }
    }
}

/// Registered handlers, swapped wholesale on every change.
pub struct HandlerSet<K> {
    handlers: RwLock<Arc<Vec<Arc<EventHandlerRegistration<K>>>>>,
}

impl<K> Default for HandlerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> HandlerSet<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, registration: Arc<EventHandlerRegistration<K>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().cloned());
        next.push(registration);
        *handlers = Arc::new(next);
    }

    /// Deactivate and unregister the handler with `id`.
    pub fn remove(&self, id: Uuid) -> Option<Arc<EventHandlerRegistration<K>>> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = handlers.iter().find(|r| r.id() == id).cloned()?;
        removed.deactivate();
        *handlers = Arc::new(handlers.iter().filter(|r| r.id() != id).cloned().collect());
        debug!("🔌 handler {} removed, {} left", id, handlers.len());
        Some(removed)
    }

    /// Deactivate and unregister every handler.
    pub fn clear(&self) -> Vec<Arc<EventHandlerRegistration<K>>> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let removed: Vec<_> = handlers.iter().cloned().collect();
        for registration in &removed {
            registration.deactivate();
        }
        *handlers = Arc::new(Vec::new());
        removed
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<EventHandlerRegistration<K>>>> {
        Arc::clone(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Deliver to every registered handler that has caught up.
    pub fn dispatch(&self, notification: &Notification<K>) {
        for registration in self.snapshot().iter() {
            if registration.is_caught_up() {
                registration.notify(notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(hits: &Arc<AtomicUsize>) -> Arc<dyn ResourceEventHandler<String>> {
        let hits = Arc::clone(hits);
        Arc::new(EventHandlerFns::<String>::new().with_add(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[test]
    fn test_dispatch_skips_removed_handlers() {
        let set = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(EventHandlerRegistration::new(counting(&hits), Duration::ZERO));
        let second = Arc::new(EventHandlerRegistration::new(counting(&hits), Duration::ZERO));
        set.add(Arc::clone(&first));
        set.add(Arc::clone(&second));

        let obj = Arc::new("x".to_string());
        set.dispatch(&Notification::Add(Arc::clone(&obj)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // a snapshot taken before removal still honours the switch
        let snapshot = set.snapshot();
        assert!(set.remove(first.id()).is_some());
        assert!(set.remove(first.id()).is_none());
        for registration in snapshot.iter() {
            registration.notify(&Notification::Add(Arc::clone(&obj)));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!first.is_active());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_failing_and_panicking_handlers_do_not_stop_dispatch() {
        let set = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let failing: Arc<dyn ResourceEventHandler<String>> =
            Arc::new(EventHandlerFns::<String>::new().with_add(|_| anyhow::bail!("nope")));
        let panicking: Arc<dyn ResourceEventHandler<String>> =
            Arc::new(EventHandlerFns::<String>::new().with_add(|_| panic!("boom")));
        set.add(Arc::new(EventHandlerRegistration::new(failing, Duration::ZERO)));
        set.add(Arc::new(EventHandlerRegistration::new(panicking, Duration::ZERO)));
        set.add(Arc::new(EventHandlerRegistration::new(counting(&hits), Duration::ZERO)));

        set.dispatch(&Notification::Add(Arc::new("x".to_string())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_skips_handlers_owing_a_catch_up() {
        let set = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(EventHandlerRegistration::new(counting(&hits), Duration::ZERO));
        late.await_catch_up();
        set.add(Arc::clone(&late));

        set.dispatch(&Notification::Add(Arc::new("x".to_string())));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        late.catch_up_done();
        set.dispatch(&Notification::Add(Arc::new("y".to_string())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_deactivates_everyone() {
        let set = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        set.add(Arc::new(EventHandlerRegistration::new(counting(&hits), Duration::ZERO)));
        let removed = set.clear();
        assert_eq!(removed.len(), 1);
        assert!(!removed[0].is_active());
        assert!(set.is_empty());
    }
}
