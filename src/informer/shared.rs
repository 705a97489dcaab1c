/**
 * One watch and one indexed cache shared by many handlers
 *
 * Each handler can ask for its own periodic resync. Resync timers live on a
 * scheduler owned by this informer and die with it.
 */
use super::handler::{EventHandlerRegistration, ResourceEventHandler};
use super::list_watch::{Informer, InformerState};
use super::source::ListerWatcher;
use crate::cache::Store;
use crate::config::InformerConfig;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use kube::Resource;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SharedIndexInformer<K> {
    informer: Informer<K>,
    indexer: Arc<Store<K>>,
    default_resync: Duration,
    scheduler: Scheduler,
    lifecycle: Mutex<()>,
}

impl<K> SharedIndexInformer<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// `default_resync` applies to handlers added without their own period;
    /// zero disables it.
    pub fn new<S>(source: S, default_resync: Duration) -> Self
    where
        S: ListerWatcher<K> + 'static,
    {
        Self::with_config(Arc::new(source), default_resync, InformerConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn ListerWatcher<K>>,
        default_resync: Duration,
        config: InformerConfig,
    ) -> Self {
        let indexer = Arc::new(Store::new());
        Self {
            informer: Informer::with_store(source, Arc::clone(&indexer), config),
            indexer,
            default_resync,
            scheduler: Scheduler::new(),
            lifecycle: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn default_resync(&self) -> Duration {
        self.default_resync
    }

    /// Attach `handler` with the default resync period.
    pub fn add_event_handler<H>(&self, handler: H) -> Arc<EventHandlerRegistration<K>>
    where
        H: ResourceEventHandler<K> + 'static,
    {
        self.add_event_handler_with_resync(handler, self.default_resync)
    }

    /// Attach `handler`, replaying the cache to it if already synced, and
    /// resync it every `resync_period` unless that is zero.
    pub fn add_event_handler_with_resync<H>(
        &self,
        handler: H,
        resync_period: Duration,
    ) -> Arc<EventHandlerRegistration<K>>
    where
        H: ResourceEventHandler<K> + 'static,
    {
        let registration = Arc::new(EventHandlerRegistration::new(Arc::new(handler), resync_period));
        if self.informer.state() == InformerState::Stopped {
            warn!("⚠️  handler {} added after shutdown, ignoring", registration.id());
            registration.deactivate();
            return registration;
        }

        self.informer.add_registration(Arc::clone(&registration));

        if !resync_period.is_zero() {
            let informer = self.informer.clone();
            let target = Arc::clone(&registration);
            let task = self
                .scheduler
                .schedule_at_fixed_rate(resync_period, resync_period, move || {
                    informer.resync(&target);
                });
            registration.set_resync_task(task);
            debug!(
                "⏰ resync every {:?} scheduled for handler {}",
                resync_period,
                registration.id()
            );
        }
        registration
    }

    /// Detach a handler and cancel its resync. Returns false if not attached.
    pub fn remove_event_handler(&self, registration: &EventHandlerRegistration<K>) -> bool {
        self.informer.remove_event_handler(registration)
    }

    /// Register a secondary index on the cache.
    ///
    /// # Errors
    ///
    /// `Error::IndexAfterStart` once `run` has been called,
    /// `Error::DuplicateIndex` if `name` is taken
    pub fn add_index<F>(&self, name: &str, index_fn: F) -> Result<()>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.informer.state() != InformerState::NotStarted {
            return Err(Error::IndexAfterStart(name.to_string()));
        }
        self.indexer.add_index(name, index_fn)
    }

    /// Start the underlying informer. Repeated calls are ignored, as are
    /// calls after `shutdown`.
    pub fn run(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match self.informer.start() {
            Ok(()) => {}
            Err(Error::AlreadyStarted) => debug!("shared informer already running"),
            Err(e) => warn!("⚠️  shared informer not started: {}", e),
        }
    }

    /// Stop the watch, detach every handler and release the resync scheduler.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.informer.state() == InformerState::Stopped && self.scheduler.is_shutdown() {
            return;
        }
        self.informer.stop();
        let removed = self.informer.remove_all_handlers();
        self.scheduler.shutdown();
        info!("🛑 shared informer shut down, {} handlers detached", removed.len());
    }

    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.informer.has_synced()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.informer.state() == InformerState::Running
    }

    /// The indexed cache; read it, do not write to it.
    #[must_use]
    pub fn indexer(&self) -> Arc<Store<K>> {
        Arc::clone(&self.indexer)
    }

    /// See [`Informer::set_error_handler`].
    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.informer.set_error_handler(f);
    }
}
