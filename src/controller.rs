/**
 * Reconcile loop on top of a shared informer and a rate limited queue
 *
 * Events enqueue `namespace/name` keys. Workers pop a key, look the object
 * up in the informer's cache (absent means deleted) and hand both to the
 * `Reconciler`. Success forgets the key's failure history, failure requeues
 * it with backoff. Either way the key is marked done afterwards, so an
 * update that arrived mid-reconcile is picked up again.
 */
use crate::cache::{Store, meta_namespace_key};
use crate::config::{CACHE_SYNC_POLL_INTERVAL_MILLIS, ControllerConfig};
use crate::informer::{EventHandlerRegistration, ResourceEventHandler, SharedIndexInformer};
use crate::workqueue::RateLimitingQueue;
use async_trait::async_trait;
use futures::FutureExt;
use kube::Resource;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    /// Bring the world in line with `obj`, or clean up after it if `None`.
    ///
    /// # Errors
    ///
    /// Any error requeues `key` with backoff
    async fn reconcile(&self, key: &str, obj: Option<Arc<K>>) -> anyhow::Result<()>;
}

struct EnqueueKeys {
    queue: Arc<RateLimitingQueue<String>>,
}

impl<K: Resource> ResourceEventHandler<K> for EnqueueKeys {
    fn on_add(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        self.queue.add(meta_namespace_key(obj.as_ref()));
        Ok(())
    }

    fn on_update(&self, _old: &Arc<K>, new: &Arc<K>) -> anyhow::Result<()> {
        self.queue.add(meta_namespace_key(new.as_ref()));
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        self.queue.add(meta_namespace_key(obj.as_ref()));
        Ok(())
    }
}

pub struct Controller<K> {
    name: String,
    informer: Arc<SharedIndexInformer<K>>,
    queue: Arc<RateLimitingQueue<String>>,
    reconciler: Arc<dyn Reconciler<K>>,
    config: ControllerConfig,
    registration: Mutex<Option<Arc<EventHandlerRegistration<K>>>>,
}

impl<K> Controller<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Controller with the default controller rate limiter.
    pub fn new<R>(
        name: impl Into<String>,
        informer: Arc<SharedIndexInformer<K>>,
        reconciler: R,
        config: ControllerConfig,
    ) -> Self
    where
        R: Reconciler<K> + 'static,
    {
        Self::with_queue(
            name,
            informer,
            reconciler,
            config,
            RateLimitingQueue::with_default_rate_limiter(),
        )
    }

    pub fn with_queue<R>(
        name: impl Into<String>,
        informer: Arc<SharedIndexInformer<K>>,
        reconciler: R,
        config: ControllerConfig,
        queue: RateLimitingQueue<String>,
    ) -> Self
    where
        R: Reconciler<K> + 'static,
    {
        Self {
            name: name.into(),
            informer,
            queue: Arc::new(queue),
            reconciler: Arc::new(reconciler),
            config,
            registration: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn queue(&self) -> Arc<RateLimitingQueue<String>> {
        Arc::clone(&self.queue)
    }

    /// Attach to the informer, wait for its cache, then reconcile until
    /// `shutdown`. The informer is started if nobody else started it.
    pub async fn run(&self) {
        self.attach();
        self.informer.run();

        let interval = Duration::from_millis(CACHE_SYNC_POLL_INTERVAL_MILLIS);
        while !self.informer.has_synced() {
            if self.queue.is_shutting_down() {
                return;
            }
            sleep(interval).await;
        }

        info!(
            "🚀 controller {} running {} workers",
            self.name, self.config.workers
        );
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    controller: self.name.clone(),
                    queue: Arc::clone(&self.queue),
                    cache: self.informer.indexer(),
                    reconciler: Arc::clone(&self.reconciler),
                    max_retries: self.config.max_retries,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                error!("❌ controller {} worker ended abnormally: {}", self.name, e);
            }
        }
        info!("🛑 controller {} stopped", self.name);
    }

    fn attach(&self) {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registration.is_none() {
            let handler = EnqueueKeys {
                queue: Arc::clone(&self.queue),
            };
            *registration = Some(self.informer.add_event_handler(handler));
        }
    }

    /// Stop the workers once their current item is done and detach from the
    /// informer. The informer itself keeps running.
    pub fn shutdown(&self) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(registration) = registration {
            self.informer.remove_event_handler(&registration);
        }
        self.queue.shutdown();
    }
}

struct Worker<K> {
    id: usize,
    controller: String,
    queue: Arc<RateLimitingQueue<String>>,
    cache: Arc<Store<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    max_retries: Option<u32>,
}

impl<K> Worker<K>
where
    K: Send + Sync + 'static,
{
    async fn run(self) {
        debug!("👷 {} worker {} started", self.controller, self.id);
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!("👷 {} worker {} exiting", self.controller, self.id);
    }

    async fn process(&self, key: &str) {
        let obj = self.cache.get_by_key(key);
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(key, obj))
            .catch_unwind()
            .await;
        let err = match outcome {
            Ok(Ok(())) => {
                self.queue.forget(&key.to_string());
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "reconciler panicked".to_string(),
        };

        let key = key.to_string();
        let retries = self.queue.num_requeues(&key);
        if self.max_retries.is_some_and(|max| retries >= max) {
            error!(
                "❌ {}: giving up on {} after {} retries: {}",
                self.controller, key, retries, err
            );
            self.queue.forget(&key);
        } else {
            warn!(
                "⚠️  {}: reconcile of {} failed (retry {}): {}",
                self.controller,
                key,
                retries + 1,
                err
            );
            self.queue.add_rate_limited(key);
        }
    }
}
