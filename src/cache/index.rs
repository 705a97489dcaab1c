//! Ready-made index functions for [`super::Store::add_index`].

use kube::{Resource, ResourceExt};

/// Conventional name for the namespace index
pub const NAMESPACE_INDEX: &str = "namespace";

/// Index objects by their namespace. Cluster scoped objects are not indexed.
pub fn namespace_index<K: Resource>(obj: &K) -> Vec<String> {
    obj.meta()
        .namespace
        .iter()
        .filter(|ns| !ns.is_empty())
        .cloned()
        .collect()
}

/// Index objects by the value of one label.
pub fn label_index<K: Resource + 'static>(
    label: &str,
) -> impl Fn(&K) -> Vec<String> + Send + Sync + 'static {
    let label = label.to_string();
    move |obj: &K| obj.labels().get(&label).cloned().into_iter().collect()
}

/// Index objects by the uid of their controlling owner.
pub fn owner_uid_index<K: Resource>(obj: &K) -> Vec<String> {
    obj.owner_references()
        .iter()
        .filter(|owner| owner.controller == Some(true))
        .map(|owner| owner.uid.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Store;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn pod(ns: &str, name: &str, app: &str, owner: Option<&str>) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                owner_references: owner.map(|uid| {
                    vec![OwnerReference {
                        uid: uid.to_string(),
                        controller: Some(true),
                        kind: "ReplicaSet".to_string(),
                        name: "rs".to_string(),
                        api_version: "apps/v1".to_string(),
                        ..OwnerReference::default()
                    }]
                }),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        })
    }

    #[test]
    fn test_builtin_indices() {
        let store: Store<Pod> = Store::new();
        store.add_index(NAMESPACE_INDEX, namespace_index).unwrap();
        store.add_index("app", label_index("app")).unwrap();
        store.add_index("owner", owner_uid_index).unwrap();

        store.add(pod("default", "a", "web", Some("uid-1")));
        store.add(pod("default", "b", "db", None));
        store.add(pod("other", "c", "web", Some("uid-1")));

        assert_eq!(store.by_index(NAMESPACE_INDEX, "default").unwrap().len(), 2);
        assert_eq!(store.by_index("app", "web").unwrap().len(), 2);
        assert_eq!(store.index_keys("owner", "uid-1").unwrap().len(), 2);
        assert!(store.by_index("owner", "uid-2").unwrap().is_empty());
    }
}
