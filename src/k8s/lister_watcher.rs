/**
 * `ListerWatcher` backed by the Kubernetes API
 *
 * Lists remember the collection's resource version; watches resume from
 * the last version seen (list, event or bookmark). A `410 Gone` on open or
 * mid-stream surfaces as `Error::ResourceExpired` so the informer relists,
 * as does a watch with no version to resume from.
 */
use crate::config::WATCH_TIMEOUT_SECONDS;
use crate::error::{Error, Result};
use crate::informer::{EventStream, ListerWatcher, ResourceEvent, WatchScope};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

const GONE: u16 = 410;

pub struct KubeListerWatcher<K> {
    api: Api<K>,
    scope: WatchScope,
    resource_version: Arc<Mutex<String>>,
}

impl<K> KubeListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Watch through `api`, narrowed by the selectors in `scope`.
    ///
    /// The namespace in `scope` is informational here; `api` decides it.
    #[must_use]
    pub fn new(api: Api<K>, scope: WatchScope) -> Self {
        Self {
            api,
            scope,
            resource_version: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Namespaced `Api` when `scope.namespace` is set, cluster-wide otherwise.
    #[must_use]
    pub fn namespaced(client: Client, scope: WatchScope) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let api = match &scope.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self::new(api, scope)
    }

    /// Cluster-wide `Api` for resources that have no namespace, such as `Node`.
    #[must_use]
    pub fn cluster(client: Client, scope: WatchScope) -> Self
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
    {
        Self::new(Api::all(client), scope)
    }

    #[must_use]
    pub fn scope(&self) -> &WatchScope {
        &self.scope
    }

    /// Resource version the next watch resumes from.
    #[must_use]
    pub fn resource_version(&self) -> String {
        self.resource_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.scope.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.scope.field_selector {
            params = params.fields(fields);
        }
        params
    }

    fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        if let Some(labels) = &self.scope.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.scope.field_selector {
            params = params.fields(fields);
        }
        params
    }
}

#[async_trait]
impl<K> ListerWatcher<K> for KubeListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Vec<K>> {
        let list = self.api.list(&self.list_params()).await?;
        let version = list.metadata.resource_version.unwrap_or_default();
        debug!(
            "📋 listed {} objects in {} at version {:?}",
            list.items.len(),
            self.scope,
            version
        );
        remember(&self.resource_version, Some(version));
        Ok(list.items)
    }

    async fn watch(&self) -> Result<EventStream<K>> {
        let version = resume_version(&self.resource_version)?;
        let stream = match self.api.watch(&self.watch_params(), &version).await {
            Ok(stream) => stream,
            Err(kube::Error::Api(status)) if status.code == GONE => {
                return Err(Error::ResourceExpired(status.message.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let resource_version = Arc::clone(&self.resource_version);
        Ok(stream
            .map(move |event| translate(&resource_version, event))
            .boxed())
    }
}

/// Version the next watch starts from. An empty slot sends the informer
/// back to relist rather than watching from "0", which replays every object.
fn resume_version(slot: &Mutex<String>) -> Result<String> {
    let version = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
    if version.is_empty() {
        return Err(Error::ResourceExpired(
            "no resource version to resume from".to_string(),
        ));
    }
    Ok(version)
}

fn remember(slot: &Mutex<String>, version: Option<String>) {
    if let Some(version) = version.filter(|v| !v.is_empty()) {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = version;
    }
}

fn translate<K: Resource>(
    resource_version: &Mutex<String>,
    event: kube::Result<WatchEvent<K>>,
) -> Result<ResourceEvent<K>> {
    match event? {
        WatchEvent::Added(obj) => {
            remember(resource_version, obj.meta().resource_version.clone());
            Ok(ResourceEvent::Created(obj))
        }
        WatchEvent::Modified(obj) => {
            remember(resource_version, obj.meta().resource_version.clone());
            Ok(ResourceEvent::Updated {
                previous: None,
                current: obj,
            })
        }
        WatchEvent::Deleted(obj) => {
            remember(resource_version, obj.meta().resource_version.clone());
            Ok(ResourceEvent::Deleted(obj))
        }
        WatchEvent::Bookmark(bookmark) => {
            trace!("🔖 bookmark at {}", bookmark.metadata.resource_version);
            remember(resource_version, Some(bookmark.metadata.resource_version));
            Ok(ResourceEvent::Sync)
        }
        WatchEvent::Error(status) if status.code == GONE => {
            resource_version
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            Err(Error::ResourceExpired(status.message.clone()))
        }
        WatchEvent::Error(status) => Err(Error::Custom(format!(
            "watch error {}: {}",
            status.code, status.message
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;

    fn event(value: serde_json::Value) -> kube::Result<WatchEvent<Pod>> {
        Ok(serde_json::from_value(value).unwrap())
    }

    fn pod_json(name: &str, version: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "default", "resourceVersion": version }
        })
    }

    #[test]
    fn test_events_advance_resource_version() {
        let version = Mutex::new("1".to_string());

        let added = translate(&version, event(json!({ "type": "ADDED", "object": pod_json("a", "5") })));
        assert!(matches!(added, Ok(ResourceEvent::Created(_))));
        assert_eq!(*version.lock().unwrap(), "5");

        let modified =
            translate(&version, event(json!({ "type": "MODIFIED", "object": pod_json("a", "6") })));
        assert!(matches!(modified, Ok(ResourceEvent::Updated { previous: None, .. })));

        let bookmark = translate(
            &version,
            event(json!({
                "type": "BOOKMARK",
                "object": { "apiVersion": "v1", "kind": "Pod", "metadata": { "resourceVersion": "9" } }
            })),
        );
        assert!(matches!(bookmark, Ok(ResourceEvent::Sync)));
        assert_eq!(*version.lock().unwrap(), "9");
    }

    #[test]
    fn test_gone_is_resource_expired() {
        let version = Mutex::new("9".to_string());
        let gone = translate(
            &version,
            event(json!({
                "type": "ERROR",
                "object": {
                    "status": "Failure",
                    "message": "too old resource version: 9 (12)",
                    "reason": "Expired",
                    "code": 410
                }
            })),
        );
        assert!(matches!(gone, Err(Error::ResourceExpired(_))));
        assert!(version.lock().unwrap().is_empty());
    }

    #[test]
    fn test_watch_without_version_asks_for_relist() {
        let version = Mutex::new(String::new());
        assert!(matches!(resume_version(&version), Err(Error::ResourceExpired(_))));

        remember(&version, Some(String::new()));
        assert!(resume_version(&version).is_err());

        remember(&version, Some("42".to_string()));
        assert_eq!(resume_version(&version).unwrap(), "42");
    }

    #[test]
    fn test_other_watch_errors_are_reported() {
        let version = Mutex::new("3".to_string());
        let failed = translate(
            &version,
            event(json!({
                "type": "ERROR",
                "object": {
                    "status": "Failure",
                    "message": "boom",
                    "reason": "InternalError",
                    "code": 500
                }
            })),
        );
        assert!(matches!(failed, Err(Error::Custom(msg)) if msg.contains("500")));
        assert_eq!(*version.lock().unwrap(), "3");
    }
}
