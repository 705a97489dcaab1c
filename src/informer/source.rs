//! The list/watch collaborator an [`super::Informer`] is driven by.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A change reported by a watch stream
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<K> {
    Created(K),
    /// `previous` is filled in when the source knows it; otherwise the
    /// informer uses the cached object.
    Updated { previous: Option<K>, current: K },
    Deleted(K),
    /// Bookmark or other progress marker; carries no object
    Sync,
}

/// Stream of watch events. Dropping it closes the underlying connection.
pub type EventStream<K> = BoxStream<'static, Result<ResourceEvent<K>>>;

#[async_trait]
pub trait ListerWatcher<K>: Send + Sync {
    /// Full snapshot of the collection right now.
    async fn list(&self) -> Result<Vec<K>>;

    /// Open a change stream starting after the last `list` or event seen.
    async fn watch(&self) -> Result<EventStream<K>>;
}

/// Which slice of a collection a source lists and watches
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WatchScope {
    /// `None` watches every namespace
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl WatchScope {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }
}

impl std::fmt::Display for WatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "namespace {ns}")?,
            None => write!(f, "all namespaces")?,
        }
        if let Some(labels) = &self.label_selector {
            write!(f, ", labels {labels}")?;
        }
        if let Some(fields) = &self.field_selector {
            write!(f, ", fields {fields}")?;
        }
        Ok(())
    }
}
