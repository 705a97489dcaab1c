#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_informer::cache::meta_namespace_key;
use kube_informer::error::{Error, Result};
use kube_informer::informer::{EventStream, ListerWatcher, ResourceEvent, ResourceEventHandler};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type WatchSender<K> = UnboundedSender<Result<ResourceEvent<K>>>;

pub fn config_map(namespace: &str, name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([("value".to_string(), value.to_string())])),
        ..ConfigMap::default()
    }
}

pub fn value_of(cm: &ConfigMap) -> String {
    cm.data
        .as_ref()
        .and_then(|d| d.get("value").cloned())
        .unwrap_or_default()
}

/// Scripted list/watch source. Lists return the current snapshot unless a
/// failure is queued; each watch consumes one channel opened by `open_watch`,
/// or hangs if none is queued.
pub struct FakeSource<K> {
    inner: Arc<FakeState<K>>,
}

impl<K> Clone for FakeSource<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct FakeState<K> {
    items: Mutex<Vec<K>>,
    failing_lists: AtomicUsize,
    watches: Mutex<VecDeque<UnboundedReceiverStream<Result<ResourceEvent<K>>>>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl<K: Clone + Send + Sync + 'static> FakeSource<K> {
    pub fn new(items: Vec<K>) -> Self {
        Self {
            inner: Arc::new(FakeState {
                items: Mutex::new(items),
                failing_lists: AtomicUsize::new(0),
                watches: Mutex::new(VecDeque::new()),
                list_calls: AtomicUsize::new(0),
                watch_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_items(&self, items: Vec<K>) {
        *self.inner.items.lock().unwrap() = items;
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.inner.failing_lists.store(n, Ordering::SeqCst);
    }

    /// Queue a watch stream; the returned sender feeds it, dropping it ends it.
    pub fn open_watch(&self) -> WatchSender<K> {
        let (tx, rx) = unbounded_channel();
        self.inner
            .watches
            .lock()
            .unwrap()
            .push_back(UnboundedReceiverStream::new(rx));
        tx
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.inner.watch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K: Clone + Send + Sync + 'static> ListerWatcher<K> for FakeSource<K> {
    async fn list(&self) -> Result<Vec<K>> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.inner.failing_lists.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_lists.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Custom("list refused".to_string()));
        }
        Ok(self.inner.items.lock().unwrap().clone())
    }

    async fn watch(&self) -> Result<EventStream<K>> {
        self.inner.watch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.inner.watches.lock().unwrap().pop_front();
        Ok(match next {
            Some(stream) => stream.boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}

/// Handler that writes `add:key`, `update:key` and `delete:key` lines
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    fn push(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }
}

impl ResourceEventHandler<ConfigMap> for Recorder {
    fn on_add(&self, obj: &Arc<ConfigMap>) -> anyhow::Result<()> {
        self.push(format!("add:{}", meta_namespace_key(obj.as_ref())));
        Ok(())
    }

    fn on_update(&self, old: &Arc<ConfigMap>, new: &Arc<ConfigMap>) -> anyhow::Result<()> {
        self.push(format!(
            "update:{}:{}->{}",
            meta_namespace_key(new.as_ref()),
            value_of(old),
            value_of(new)
        ));
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<ConfigMap>) -> anyhow::Result<()> {
        self.push(format!("delete:{}", meta_namespace_key(obj.as_ref())));
        Ok(())
    }
}

/// Let spawned tasks run; time is paused in these tests so this is instant.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Poll `check` until it holds, for at most `limit` of (virtual) time.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let step = Duration::from_millis(5);
    let mut waited = Duration::ZERO;
    while waited < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    check()
}
