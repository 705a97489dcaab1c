/**
 * Hands out one `SharedIndexInformer` per distinct watch
 *
 * Two requests for the same resource type, namespace and selectors get the
 * same informer, so they share one watch connection and one cache.
 */
use super::list_watch::short_type_name;
use super::shared::SharedIndexInformer;
use super::source::{ListerWatcher, WatchScope};
use crate::config::{CACHE_SYNC_POLL_INTERVAL_MILLIS, InformerConfig, NO_RESYNC};
use crate::error::{Error, Result};
use crate::k8s::KubeListerWatcher;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Identity of a shared watch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InformerKey {
    type_id: TypeId,
    type_name: String,
    scope: WatchScope,
}

impl InformerKey {
    #[must_use]
    pub fn of<K: 'static>(scope: WatchScope) -> Self {
        Self {
            type_id: TypeId::of::<K>(),
            type_name: short_type_name::<K>(),
            scope,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub const fn scope(&self) -> &WatchScope {
        &self.scope
    }
}

impl std::fmt::Display for InformerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in {}", self.type_name, self.scope)
    }
}

/// Type-erased lifecycle of a `SharedIndexInformer<K>`
trait InformerControl: Send + Sync {
    fn run(&self);
    fn shutdown(&self);
    fn has_synced(&self) -> bool;
}

impl<K> InformerControl for SharedIndexInformer<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn run(&self) {
        Self::run(self);
    }

    fn shutdown(&self) {
        Self::shutdown(self);
    }

    fn has_synced(&self) -> bool {
        Self::has_synced(self)
    }
}

struct Registered {
    informer: Arc<dyn Any + Send + Sync>,
    control: Arc<dyn InformerControl>,
}

#[derive(Default)]
struct FactoryState {
    started: bool,
    informers: HashMap<InformerKey, Registered>,
}

pub struct SharedInformerFactory {
    state: Mutex<FactoryState>,
    default_resync: Duration,
    config: InformerConfig,
}

impl Default for SharedInformerFactory {
    fn default() -> Self {
        Self::new(NO_RESYNC)
    }
}

impl SharedInformerFactory {
    /// `default_resync` is used by informers built without `with_resync`.
    #[must_use]
    pub fn new(default_resync: Duration) -> Self {
        Self::with_config(default_resync, InformerConfig::default())
    }

    #[must_use]
    pub fn with_config(default_resync: Duration, config: InformerConfig) -> Self {
        Self {
            state: Mutex::new(FactoryState::default()),
            default_resync,
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start describing an informer for `K`; nothing is created until `build*`.
    #[must_use]
    pub fn for_resource<K>(&self) -> InformerBuilder<'_, K>
    where
        K: Resource + Send + Sync + 'static,
    {
        InformerBuilder {
            factory: self,
            scope: WatchScope::all(),
            resync: None,
            _kind: PhantomData,
        }
    }

    /// Keys of every distinct informer registered so far.
    #[must_use]
    pub fn informers(&self) -> Vec<InformerKey> {
        self.state().informers.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().informers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().informers.is_empty()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Run every registered informer. After this, new keys are refused.
    pub fn start(&self) {
        let controls: Vec<Arc<dyn InformerControl>> = {
            let mut state = self.state();
            state.started = true;
            state.informers.values().map(|r| Arc::clone(&r.control)).collect()
        };
        info!("🚀 informer factory starting {} informers", controls.len());
        for control in controls {
            control.run();
        }
    }

    /// Shut down every registered informer.
    pub fn shutdown(&self) {
        let controls: Vec<Arc<dyn InformerControl>> = self
            .state()
            .informers
            .values()
            .map(|r| Arc::clone(&r.control))
            .collect();
        for control in controls {
            control.shutdown();
        }
        info!("🛑 informer factory shut down");
    }

    fn all_synced(&self) -> bool {
        self.state().informers.values().all(|r| r.control.has_synced())
    }

    /// Wait until every registered informer has synced.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(CACHE_SYNC_POLL_INTERVAL_MILLIS);
        loop {
            if self.all_synced() {
                debug!("✅ all informer caches synced");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("⏳ informer caches not synced after {:?}", timeout);
                return false;
            }
            sleep(interval.min(deadline - now)).await;
        }
    }

    fn get_or_register<K, F>(
        &self,
        key: InformerKey,
        resync: Option<Duration>,
        make_source: F,
    ) -> Result<Arc<SharedIndexInformer<K>>>
    where
        K: Resource + Send + Sync + 'static,
        F: FnOnce(&WatchScope) -> Arc<dyn ListerWatcher<K>>,
    {
        let mut state = self.state();
        if let Some(existing) = state.informers.get(&key) {
            debug!("♻️  reusing informer for {}", key);
            return Arc::clone(&existing.informer)
                .downcast::<SharedIndexInformer<K>>()
                .map_err(|_| Error::Custom(format!("informer for {key} has a different type")));
        }
        if state.started {
            return Err(Error::FactoryStarted(key.to_string()));
        }

        let source = make_source(key.scope());
        let informer = Arc::new(SharedIndexInformer::with_config(
            source,
            resync.unwrap_or(self.default_resync),
            self.config.clone(),
        ));
        info!("📡 informer registered for {}", key);
        state.informers.insert(
            key,
            Registered {
                informer: Arc::clone(&informer) as Arc<dyn Any + Send + Sync>,
                control: Arc::clone(&informer) as Arc<dyn InformerControl>,
            },
        );
        Ok(informer)
    }
}

/// Describes the watch an informer should run; see [`SharedInformerFactory::for_resource`].
pub struct InformerBuilder<'a, K> {
    factory: &'a SharedInformerFactory,
    scope: WatchScope,
    resync: Option<Duration>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> InformerBuilder<'_, K>
where
    K: Resource + Send + Sync + 'static,
{
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.scope.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.scope.label_selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.scope.field_selector = Some(selector.into());
        self
    }

    /// Default resync for handlers of a newly created informer. Ignored when
    /// the informer already exists.
    #[must_use]
    pub const fn with_resync(mut self, period: Duration) -> Self {
        self.resync = Some(period);
        self
    }

    #[must_use]
    pub fn key(&self) -> InformerKey {
        InformerKey::of::<K>(self.scope.clone())
    }

    /// Shared informer for this watch, driven by `source` if it is new.
    ///
    /// # Errors
    ///
    /// `Error::FactoryStarted` if the informer would be new and the factory already started
    pub fn build<S>(self, source: S) -> Result<Arc<SharedIndexInformer<K>>>
    where
        S: ListerWatcher<K> + 'static,
    {
        self.build_with(|_| source)
    }

    /// Like [`Self::build`], but the source is only created when needed.
    ///
    /// # Errors
    ///
    /// `Error::FactoryStarted` if the informer would be new and the factory already started
    pub fn build_with<S, F>(self, make_source: F) -> Result<Arc<SharedIndexInformer<K>>>
    where
        S: ListerWatcher<K> + 'static,
        F: FnOnce(&WatchScope) -> S,
    {
        let key = self.key();
        self.factory.get_or_register(key, self.resync, |scope| {
            Arc::new(make_source(scope)) as Arc<dyn ListerWatcher<K>>
        })
    }

    /// Shared informer backed by a [`KubeListerWatcher`] on `client`.
    ///
    /// # Errors
    ///
    /// `Error::FactoryStarted` if the informer would be new and the factory already started
    pub fn build_from_client(self, client: Client) -> Result<Arc<SharedIndexInformer<K>>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.build_with(|scope| KubeListerWatcher::<K>::namespaced(client, scope.clone()))
    }

    /// Shared informer for a cluster-scoped resource such as `Node`, backed
    /// by a cluster-wide [`KubeListerWatcher`] on `client`.
    ///
    /// # Errors
    ///
    /// `Error::Custom` if a namespace was set, `Error::FactoryStarted` if the
    /// informer would be new and the factory already started
    pub fn build_cluster_from_client(self, client: Client) -> Result<Arc<SharedIndexInformer<K>>>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        if let Some(namespace) = &self.scope.namespace {
            return Err(Error::Custom(format!(
                "{} is cluster-scoped and cannot be watched in namespace {namespace}",
                short_type_name::<K>()
            )));
        }
        self.build_with(|scope| KubeListerWatcher::<K>::cluster(client, scope.clone()))
    }
}
