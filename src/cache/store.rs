/**
 * Thread-safe keyed object cache with named secondary indices
 *
 * The primary map owns every object by key. Indices only hold keys and are
 * resolved back through the primary map, so `replace` and `clear` never
 * leave dangling index entries.
 */
use crate::error::{Error, Result};
use kube::{Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Maps an object to the index values it should be found under
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

type Index = HashMap<String, HashSet<String>>;

/// Cache key of an object: `namespace/name`, or just `name` when cluster scoped
pub fn meta_namespace_key<K: Resource>(obj: &K) -> String {
    let name = obj.name_any();
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name,
    }
}

/// Build a cache key from its parts
#[must_use]
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Keyed cache of `Arc<K>` that doubles as an indexer once indices are added.
pub struct Store<K> {
    inner: RwLock<StoreInner<K>>,
}

struct StoreInner<K> {
    items: HashMap<String, Arc<K>>,
    indexers: HashMap<String, IndexFunc<K>>,
    indices: HashMap<String, Index>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Store")
            .field("len", &inner.items.len())
            .field("indices", &inner.indexers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K> Store<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                items: HashMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    #[must_use]
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.get_by_key(&object_key(namespace, name))
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.read().items.contains_key(key)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().items.values().cloned().collect()
    }

    #[must_use]
    pub fn list_keys(&self) -> Vec<String> {
        self.read().items.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }

    /// Remove the object stored under `key`, returning it.
    pub fn delete_by_key(&self, key: &str) -> Option<Arc<K>> {
        let mut inner = self.write();
        let old = inner.items.remove(key)?;
        inner.unindex(key, &old);
        Some(old)
    }

    /// Drop every object. Registered indices stay registered but become empty.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.items.clear();
        for index in inner.indices.values_mut() {
            index.clear();
        }
    }

    /// Register a secondary index and index every object already cached.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateIndex` if `name` is already registered
    pub fn add_index<F>(&self, name: &str, index_fn: F) -> Result<()>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let mut inner = self.write();
        if inner.indexers.contains_key(name) {
            return Err(Error::DuplicateIndex(name.to_string()));
        }

        let index_fn: IndexFunc<K> = Arc::new(index_fn);
        let mut index = Index::new();
        for (key, obj) in &inner.items {
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        debug!("🗂️  index {} registered over {} objects", name, inner.items.len());
        inner.indices.insert(name.to_string(), index);
        inner.indexers.insert(name.to_string(), index_fn);
        Ok(())
    }

    /// Objects whose index function yields `value` for index `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownIndex` if `name` is not registered
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<K>>> {
        let inner = self.read();
        let index = inner
            .indices
            .get(name)
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))?;
        Ok(index
            .get(value)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.items.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Keys whose index function yields `value` for index `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownIndex` if `name` is not registered
    pub fn index_keys(&self, name: &str, value: &str) -> Result<Vec<String>> {
        let inner = self.read();
        let index = inner
            .indices
            .get(name)
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))?;
        Ok(index
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Every value currently present in index `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownIndex` if `name` is not registered
    pub fn index_values(&self, name: &str) -> Result<Vec<String>> {
        let inner = self.read();
        let index = inner
            .indices
            .get(name)
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))?;
        Ok(index.keys().cloned().collect())
    }

    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.read().indexers.keys().cloned().collect()
    }
}

impl<K: Resource> Store<K> {
    /// Insert or overwrite `obj`, returning the object previously cached under its key.
    pub fn add(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = meta_namespace_key(obj.as_ref());
        let mut inner = self.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&obj));
        if let Some(old) = &old {
            inner.unindex(&key, old);
        }
        inner.index(&key, &obj);
        old
    }

    /// Same as [`Store::add`].
    pub fn update(&self, obj: Arc<K>) -> Option<Arc<K>> {
        self.add(obj)
    }

    /// Remove the object with the same key as `obj`. No-op if absent.
    pub fn delete(&self, obj: &K) -> Option<Arc<K>> {
        self.delete_by_key(&meta_namespace_key(obj))
    }

    /// Atomically swap the whole content for `objs`.
    pub fn replace(&self, objs: Vec<Arc<K>>) {
        let mut inner = self.write();
        inner.items = objs
            .into_iter()
            .map(|obj| (meta_namespace_key(obj.as_ref()), obj))
            .collect();

        let StoreInner {
            items,
            indexers,
            indices,
        } = &mut *inner;
        for (name, index_fn) in indexers.iter() {
            let mut index = Index::new();
            for (key, obj) in items.iter() {
                for value in index_fn(obj) {
                    index.entry(value).or_default().insert(key.clone());
                }
            }
            indices.insert(name.clone(), index);
        }
    }
}

impl<K> StoreInner<K> {
    fn index(&mut self, key: &str, obj: &K) {
        for (name, index_fn) in &self.indexers {
            let values = index_fn(obj);
            if values.is_empty() {
                continue;
            }
            let index = self.indices.entry(name.clone()).or_default();
            for value in values {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, obj: &K) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cm(ns: &str, name: &str, color: &str) -> Arc<ConfigMap> {
        Arc::new(ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(BTreeMap::from([("color".to_string(), color.to_string())])),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        })
    }

    fn color_index(obj: &ConfigMap) -> Vec<String> {
        obj.labels().get("color").cloned().into_iter().collect()
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_keys_for_namespaced_and_cluster_objects() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("kube-system".to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        assert_eq!(meta_namespace_key(&ns), "kube-system");
        assert_eq!(meta_namespace_key(cm("ns", "a", "red").as_ref()), "ns/a");
        assert_eq!(object_key(None, "x"), "x");
        assert_eq!(object_key(Some(""), "x"), "x");
    }

    #[test]
    fn test_upsert_get_and_delete() {
        let store = Store::new();
        assert!(store.add(cm("ns", "a", "red")).is_none());
        let old = store.update(cm("ns", "a", "blue"));
        assert_eq!(old.map(|o| o.labels()["color"].clone()), Some("red".to_string()));
        assert_eq!(store.len(), 1);

        let got = store.get(Some("ns"), "a").unwrap();
        assert_eq!(got.labels()["color"], "blue");
        assert!(store.contains_key("ns/a"));

        assert!(store.delete(cm("ns", "missing", "red").as_ref()).is_none());
        assert!(store.delete(cm("ns", "a", "red").as_ref()).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_swaps_content() {
        let store = Store::new();
        store.add(cm("ns", "a", "red"));
        store.add(cm("ns", "b", "red"));
        store.replace(vec![cm("ns", "c", "green")]);
        assert_eq!(store.list_keys(), vec!["ns/c".to_string()]);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown_index() {
        let store: Store<ConfigMap> = Store::new();
        store.add_index("color", color_index).unwrap();
        assert!(matches!(
            store.add_index("color", color_index),
            Err(Error::DuplicateIndex(_))
        ));
        assert!(matches!(
            store.by_index("size", "big"),
            Err(Error::UnknownIndex(_))
        ));
        assert!(matches!(store.index_values("size"), Err(Error::UnknownIndex(_))));
        assert_eq!(store.index_names(), vec!["color".to_string()]);
    }

    #[test]
    fn test_index_follows_mutations() {
        let store = Store::new();
        store.add(cm("ns", "a", "red"));
        // existing objects are indexed at registration time
        store.add_index("color", color_index).unwrap();
        store.add(cm("ns", "b", "red"));
        assert_eq!(
            sorted(store.index_keys("color", "red").unwrap()),
            vec!["ns/a".to_string(), "ns/b".to_string()]
        );

        store.update(cm("ns", "a", "blue"));
        assert_eq!(store.index_keys("color", "red").unwrap(), vec!["ns/b".to_string()]);
        assert_eq!(store.by_index("color", "blue").unwrap().len(), 1);

        store.delete(cm("ns", "b", "red").as_ref());
        assert!(store.by_index("color", "red").unwrap().is_empty());
        assert_eq!(store.index_values("color").unwrap(), vec!["blue".to_string()]);

        store.replace(vec![cm("ns", "z", "green")]);
        assert_eq!(store.index_values("color").unwrap(), vec!["green".to_string()]);

        store.clear();
        assert!(store.index_values("color").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(Store::new());
        store.add_index("color", color_index).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.add(cm("ns", &format!("{t}-{i}"), "red"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 200);
        assert_eq!(store.index_keys("color", "red").unwrap().len(), 200);
    }
}
