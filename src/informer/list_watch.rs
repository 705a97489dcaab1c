/**
 * List-then-watch loop that keeps a `Store` current and fans out events
 *
 * One background task per informer: list once, replace the store, announce
 * every object, then consume watch streams forever, reconnecting after a
 * fixed backoff. Only that task mutates the store or calls handlers. Late
 * handler catch-up and resync passes reach it as commands and run between
 * two watch events, so callers never wait on a dispatch and handlers may
 * attach or detach handlers from inside a callback.
 */
use super::handler::{EventHandlerRegistration, HandlerSet, Notification, ResourceEventHandler};
use super::source::{EventStream, ListerWatcher, ResourceEvent};
use crate::cache::{Store, meta_namespace_key};
use crate::config::{InformerConfig, NO_RESYNC};
use crate::error::{Error, Result};
use futures::StreamExt;
use kube::Resource;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    NotStarted,
    Running,
    Stopped,
}

/// Work for the informer task besides watch events
enum Command<K> {
    CatchUp(Arc<EventHandlerRegistration<K>>),
    Resync(Arc<EventHandlerRegistration<K>>),
}

enum WatchOutcome {
    Cancelled,
    Closed,
    Failed(Error),
}

pub struct Informer<K> {
    inner: Arc<InformerInner<K>>,
}

impl<K> Clone for Informer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct InformerInner<K> {
    name: String,
    source: Arc<dyn ListerWatcher<K>>,
    store: Arc<Store<K>>,
    handlers: HandlerSet<K>,
    commands: UnboundedSender<Command<K>>,
    pending_commands: AsyncMutex<UnboundedReceiver<Command<K>>>,
    synced: AtomicBool,
    state: Mutex<InformerState>,
    shutdown: CancellationToken,
    config: InformerConfig,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl<K> Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new<S>(source: S) -> Self
    where
        S: ListerWatcher<K> + 'static,
    {
        Self::with_store(Arc::new(source), Arc::new(Store::new()), InformerConfig::default())
    }

    /// Informer filling an existing (possibly indexed) store.
    pub fn with_store(
        source: Arc<dyn ListerWatcher<K>>,
        store: Arc<Store<K>>,
        config: InformerConfig,
    ) -> Self {
        let (commands, pending_commands) = unbounded_channel();
        Self {
            inner: Arc::new(InformerInner {
                name: short_type_name::<K>(),
                source,
                store,
                handlers: HandlerSet::new(),
                commands,
                pending_commands: AsyncMutex::new(pending_commands),
                synced: AtomicBool::new(false),
                state: Mutex::new(InformerState::NotStarted),
                shutdown: CancellationToken::new(),
                config,
                error_handler: RwLock::new(None),
            }),
        }
    }

    /// Spawn the list-watch task.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyStarted` if running, `Error::InformerStopped` after `stop`
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            match *state {
                InformerState::Running => return Err(Error::AlreadyStarted),
                InformerState::Stopped => return Err(Error::InformerStopped),
                InformerState::NotStarted => *state = InformerState::Running,
            }
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await });
        Ok(())
    }

    /// Stop the list-watch task and close any open watch. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state();
            if *state == InformerState::Stopped {
                return;
            }
            *state = InformerState::Stopped;
        }
        info!("🛑 informer for {} stopping", self.inner.name);
        self.inner.shutdown.cancel();
    }

    #[must_use]
    pub fn state(&self) -> InformerState {
        *self.inner.state()
    }

    /// True once the initial list has been stored and announced.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn store(&self) -> Arc<Store<K>> {
        Arc::clone(&self.inner.store)
    }

    /// Called with every list or watch failure, in addition to logging.
    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    /// Attach `handler`. If the informer already synced, the handler first
    /// receives `on_add` for every cached object, before any later event.
    /// The replay runs on the informer task; this call does not wait for it.
    pub fn add_event_handler<H>(&self, handler: H) -> Arc<EventHandlerRegistration<K>>
    where
        H: ResourceEventHandler<K> + 'static,
    {
        let registration = Arc::new(EventHandlerRegistration::new(Arc::new(handler), NO_RESYNC));
        self.add_registration(Arc::clone(&registration));
        registration
    }

    pub(crate) fn add_registration(&self, registration: Arc<EventHandlerRegistration<K>>) {
        registration.await_catch_up();
        self.inner.handlers.add(Arc::clone(&registration));
        self.inner.enqueue(Command::CatchUp(registration));
    }

    /// Detach a handler. Returns false if it was not attached.
    pub fn remove_event_handler(&self, registration: &EventHandlerRegistration<K>) -> bool {
        registration.deactivate();
        self.inner.handlers.remove(registration.id()).is_some()
    }

    /// Detach every handler.
    pub(crate) fn remove_all_handlers(&self) -> Vec<Arc<EventHandlerRegistration<K>>> {
        self.inner.handlers.clear()
    }

    /// Ask the informer task to deliver `on_update(obj, obj)` for every
    /// cached object to one handler.
    pub(crate) fn resync(&self, registration: &Arc<EventHandlerRegistration<K>>) {
        if registration.is_active() {
            self.inner.enqueue(Command::Resync(Arc::clone(registration)));
        }
    }
}

impl<K> InformerInner<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn state(&self) -> MutexGuard<'_, InformerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, command: Command<K>) {
        if self.commands.send(command).is_err() {
            debug!("informer for {} is gone, command dropped", self.name);
        }
    }

    async fn next_command(&self) -> Option<Command<K>> {
        self.pending_commands.lock().await.recv().await
    }

    /// Drive `work` to completion, running queued commands first whenever
    /// both are ready. None if the informer stopped meanwhile.
    async fn serve_until<F: Future>(&self, work: F) -> Option<F::Output> {
        let mut work = std::pin::pin!(work);
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return None,
                Some(command) = self.next_command() => self.execute(command),
                out = &mut work => return Some(out),
            }
        }
    }

    fn execute(&self, command: Command<K>) {
        match command {
            Command::CatchUp(registration) => {
                // before the initial list there is nothing to replay; the
                // handler gets the list like everyone else
                if self.synced.load(Ordering::Acquire) {
                    let cached = self.store.list();
                    debug!(
                        "📬 replaying {} cached objects to late handler {}",
                        cached.len(),
                        registration.id()
                    );
                    for obj in cached {
                        registration.notify(&Notification::Add(obj));
                    }
                }
                registration.catch_up_done();
            }
            Command::Resync(registration) => {
                if !self.synced.load(Ordering::Acquire) || !registration.is_caught_up() {
                    return;
                }
                let cached = self.store.list();
                trace!("🔄 resync of {} objects for {}", cached.len(), registration.id());
                for obj in cached {
                    registration.notify(&Notification::Update {
                        old: Arc::clone(&obj),
                        new: obj,
                    });
                }
            }
        }
    }

    fn report(&self, err: &Error) {
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    async fn run(self: Arc<Self>) {
        info!("🚀 informer for {} starting", self.name);
        if self.list_until_success(true).await {
            self.watch_loop().await;
        }
        info!("🛑 informer for {} stopped", self.name);
    }

    /// Sleep for the reconnect backoff. False if stopped meanwhile.
    async fn backoff(&self) -> bool {
        self.serve_until(sleep(self.config.reconnect_backoff))
            .await
            .is_some()
    }

    /// List until it works, then apply the result. False if stopped first.
    async fn list_until_success(&self, initial: bool) -> bool {
        loop {
            let Some(listed) = self.serve_until(self.source.list()).await else {
                return false;
            };
            match listed {
                Ok(items) if initial => {
                    self.apply_initial_list(items);
                    return true;
                }
                Ok(items) => {
                    self.apply_relist(items);
                    return true;
                }
                Err(e) => {
                    error!(
                        "❌ list for {} failed: {}, retrying in {:?}",
                        self.name, e, self.config.reconnect_backoff
                    );
                    self.report(&e);
                    if !self.backoff().await {
                        return false;
                    }
                }
            }
        }
    }

    async fn watch_loop(&self) {
        loop {
            let outcome = match self.serve_until(self.source.watch()).await {
                None => WatchOutcome::Cancelled,
                Some(Ok(stream)) => self.consume(stream).await,
                Some(Err(e)) => WatchOutcome::Failed(e),
            };

            match outcome {
                WatchOutcome::Cancelled => return,
                WatchOutcome::Closed => {
                    debug!("🔍 watch for {} ended, reconnecting", self.name);
                }
                WatchOutcome::Failed(Error::ResourceExpired(msg)) => {
                    warn!("🔄 watch for {} expired ({}), relisting", self.name, msg);
                    if !self.list_until_success(false).await {
                        return;
                    }
                    continue;
                }
                WatchOutcome::Failed(e) => {
                    warn!(
                        "❌ watch for {} failed: {}, reconnecting in {:?}",
                        self.name, e, self.config.reconnect_backoff
                    );
                    self.report(&e);
                }
            }

            if !self.backoff().await {
                return;
            }
        }
    }

    async fn consume(&self, mut stream: EventStream<K>) -> WatchOutcome {
        debug!("🔍 watch for {} opened", self.name);
        loop {
            let Some(next) = self.serve_until(stream.next()).await else {
                return WatchOutcome::Cancelled;
            };
            match next {
                Some(Ok(event)) => self.apply(event),
                Some(Err(e)) => return WatchOutcome::Failed(e),
                None => return WatchOutcome::Closed,
            }
        }
    }

    fn apply_initial_list(&self, items: Vec<K>) {
        self.store.replace(items.into_iter().map(Arc::new).collect());
        let cached = self.store.list();
        for obj in &cached {
            self.handlers.dispatch(&Notification::Add(Arc::clone(obj)));
        }
        self.synced.store(true, Ordering::Release);
        info!("✅ informer for {} synced with {} objects", self.name, cached.len());
    }

    /// Reconcile the store with a fresh list, announcing the differences.
    fn apply_relist(&self, items: Vec<K>) {
        let stale: HashSet<String> = self.store.list_keys().into_iter().collect();
        let mut seen = HashSet::with_capacity(items.len());
        for obj in items.into_iter().map(Arc::new) {
            seen.insert(meta_namespace_key(obj.as_ref()));
            let notification = match self.store.add(Arc::clone(&obj)) {
                Some(old) => Notification::Update { old, new: obj },
                None => Notification::Add(obj),
            };
            self.handlers.dispatch(&notification);
        }
        for key in stale.difference(&seen) {
            if let Some(old) = self.store.delete_by_key(key) {
                self.handlers.dispatch(&Notification::Delete(old));
            }
        }
        info!("✅ informer for {} relisted {} objects", self.name, seen.len());
    }

    fn apply(&self, event: ResourceEvent<K>) {
        let notification = match event {
            ResourceEvent::Created(obj) => {
                let obj = Arc::new(obj);
                self.store.add(Arc::clone(&obj));
                Notification::Add(obj)
            }
            ResourceEvent::Updated { previous, current } => {
                let new = Arc::new(current);
                let cached = self.store.update(Arc::clone(&new));
                match previous.map(Arc::new).or(cached) {
                    Some(old) => Notification::Update { old, new },
                    None => Notification::Add(new),
                }
            }
            ResourceEvent::Deleted(obj) => {
                let obj = Arc::new(obj);
                self.store.delete(&obj);
                Notification::Delete(obj)
            }
            ResourceEvent::Sync => {
                trace!("🔖 bookmark for {}", self.name);
                return;
            }
        };
        self.handlers.dispatch(&notification);
    }
}

/// `Pod` rather than `k8s_openapi::api::core::v1::Pod`, for log lines
pub(crate) fn short_type_name<K>() -> String {
    let full = std::any::type_name::<K>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<ConfigMap>(), "ConfigMap");
        assert_eq!(short_type_name::<u32>(), "u32");
    }
}
