//! In-process resource store.
//!
//! Behaves like a small API server: it assigns server-side metadata on
//! writes, honours dry runs, and can be told to fail listing or writing
//! specific kinds so partial-failure paths can be exercised.

use super::{object_name, ApiError, ResourceApi};
use crate::model::KindInfo;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// (kind, namespace, name); namespace is empty for cluster-scoped objects
type ObjectKey = (String, String, String);

#[derive(Default)]
struct Faults {
    /// (kind, namespace) pairs whose list calls fail; `*` matches any namespace
    list: HashSet<(String, String)>,
    /// Kinds whose create/replace calls fail
    write: HashSet<String>,
}

pub struct InMemoryApi {
    version: String,
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    faults: Mutex<Faults>,
    next_version: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryApi {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            next_version: AtomicU64::new(1),
            writes: AtomicU64::new(0),
        }
    }

    /// Store an object directly, with server-assigned metadata, bypassing
    /// fault injection and the write counter.
    pub fn insert(&self, kind: &KindInfo, namespace: &str, mut object: Value) {
        let namespace = if kind.cluster_scoped { "" } else { namespace };
        let name = object_name(&object).unwrap_or_default().to_string();
        self.stamp_server_fields(&mut object, namespace, true);
        lock(&self.objects).insert((kind.kind.to_string(), namespace.to_string(), name), object);
    }

    /// Make `list` fail for `kind` in `namespace` (`*` for all namespaces).
    pub fn fail_list(&self, kind: &str, namespace: &str) {
        lock(&self.faults)
            .list
            .insert((kind.to_string(), namespace.to_string()));
    }

    /// Make every create/replace of `kind` fail.
    pub fn fail_writes(&self, kind: &str) {
        lock(&self.faults).write.insert(kind.to_string());
    }

    /// Stored object, if present.
    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        lock(&self.objects)
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every stored object, keyed by (kind, namespace, name).
    pub fn dump(&self) -> BTreeMap<(String, String, String), Value> {
        lock(&self.objects).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of mutating calls that changed the store.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn stamp_server_fields(&self, object: &mut Value, namespace: &str, fresh: bool) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let Some(map) = object.as_object_mut() else {
            return;
        };
        let metadata = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            if !namespace.is_empty() {
                metadata.insert("namespace".to_string(), json!(namespace));
            }
            metadata.insert("resourceVersion".to_string(), json!(version.to_string()));
            if fresh {
                metadata.insert("uid".to_string(), json!(format!("uid-{version}")));
                metadata.insert(
                    "creationTimestamp".to_string(),
                    json!("2024-01-01T00:00:00Z"),
                );
                metadata.insert("generation".to_string(), json!(1));
            }
        }
    }

    fn key(kind: &KindInfo, namespace: Option<&str>, object: &Value) -> Result<ObjectKey, ApiError> {
        let name = object_name(object)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ApiError::InvalidObject(format!("{} without metadata.name", kind.kind)))?;
        let namespace = resolve_namespace(kind, namespace, object);
        Ok((kind.kind.to_string(), namespace, name.to_string()))
    }

    fn check_write_fault(&self, kind: &KindInfo) -> Result<(), ApiError> {
        if lock(&self.faults).write.contains(kind.kind) {
            return Err(ApiError::Status {
                status: 500,
                message: format!("injected write failure for {}", kind.kind),
            });
        }
        Ok(())
    }
}

/// Namespace an object lands in: none for cluster-scoped kinds, else the
/// request namespace, else the object's own.
fn resolve_namespace(kind: &KindInfo, namespace: Option<&str>, object: &Value) -> String {
    if kind.cluster_scoped {
        return String::new();
    }
    namespace
        .filter(|ns| !ns.is_empty())
        .or_else(|| object.pointer("/metadata/namespace").and_then(Value::as_str))
        .unwrap_or("default")
        .to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ResourceApi for InMemoryApi {
    async fn server_version(&self) -> Result<String, ApiError> {
        Ok(self.version.clone())
    }

    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> Result<Vec<Value>, ApiError> {
        {
            let faults = lock(&self.faults);
            let scope = namespace.unwrap_or_default().to_string();
            if faults.list.contains(&(kind.kind.to_string(), scope))
                || faults.list.contains(&(kind.kind.to_string(), "*".to_string()))
            {
                return Err(ApiError::Forbidden(format!(
                    "cannot list {} in {}",
                    kind.plural,
                    namespace.unwrap_or("cluster scope")
                )));
            }
        }

        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .filter(|((k, ns, _), _)| {
                k == kind.kind
                    && (kind.cluster_scoped || namespace.map(|want| want == ns).unwrap_or(true))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ApiError> {
        let namespace = if kind.cluster_scoped {
            String::new()
        } else {
            namespace.unwrap_or("default").to_string()
        };
        Ok(lock(&self.objects)
            .get(&(kind.kind.to_string(), namespace, name.to_string()))
            .cloned())
    }

    async fn create(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> Result<(), ApiError> {
        self.check_write_fault(kind)?;
        let key = Self::key(kind, namespace, object)?;

        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists {
                kind: key.0,
                name: key.2,
            });
        }
        if dry_run {
            return Ok(());
        }

        let mut stored = object.clone();
        self.stamp_server_fields(&mut stored, &key.1, true);
        objects.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> Result<(), ApiError> {
        self.check_write_fault(kind)?;
        let key = Self::key(kind, namespace, object)?;

        let mut objects = lock(&self.objects);
        if !objects.contains_key(&key) {
            return Err(ApiError::NotFound {
                kind: key.0,
                name: key.2,
            });
        }
        if dry_run {
            return Ok(());
        }

        let mut stored = object.clone();
        self.stamp_server_fields(&mut stored, &key.1, false);
        objects.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KindRegistry;

    #[tokio::test]
    async fn test_insert_and_list() {
        let registry = KindRegistry::builtin();
        let api = InMemoryApi::new("v1.30.0");
        let secret = registry.get("Secret").unwrap();
        api.insert(secret, "prod", json!({"metadata": {"name": "db"}}));
        api.insert(secret, "dev", json!({"metadata": {"name": "db"}}));

        assert_eq!(api.list(secret, Some("prod")).await.unwrap().len(), 1);
        assert_eq!(api.list(secret, None).await.unwrap().len(), 2);

        let stored = api.object("Secret", "prod", "db").unwrap();
        assert!(stored.pointer("/metadata/uid").is_some());
        assert_eq!(stored["metadata"]["namespace"], "prod");
    }

    #[tokio::test]
    async fn test_create_conflict_and_dry_run() {
        let registry = KindRegistry::builtin();
        let api = InMemoryApi::new("v1.30.0");
        let ns = registry.get("Namespace").unwrap();
        let object = json!({"metadata": {"name": "prod"}});

        api.create(ns, None, &object, true).await.unwrap();
        assert!(api.is_empty());
        assert_eq!(api.write_count(), 0);

        api.create(ns, None, &object, false).await.unwrap();
        let err = api.create(ns, None, &object, false).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(api.write_count(), 1);
    }

    #[tokio::test]
    async fn test_replace_missing_is_not_found() {
        let registry = KindRegistry::builtin();
        let api = InMemoryApi::new("v1.30.0");
        let cm = registry.get("ConfigMap").unwrap();
        let err = api
            .replace(cm, Some("prod"), &json!({"metadata": {"name": "cfg"}}), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let registry = KindRegistry::builtin();
        let api = InMemoryApi::new("v1.30.0");
        let secret = registry.get("Secret").unwrap();
        api.fail_list("Secret", "prod");
        api.fail_writes("Secret");

        assert!(matches!(
            api.list(secret, Some("prod")).await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(api.list(secret, Some("dev")).await.is_ok());
        assert!(api
            .create(secret, Some("dev"), &json!({"metadata": {"name": "x"}}), false)
            .await
            .is_err());
    }
}
