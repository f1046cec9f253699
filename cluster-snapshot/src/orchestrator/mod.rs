//! Operation entry points.
//!
//! `Snapshotter` wires the resource API, the kind registry and the snapshot
//! store together. Backup and restore live in their own modules; the
//! catalog operations are small enough to sit here.

mod backup;
mod restore;

pub use restore::RestoreResult;

use crate::cluster::ResourceApi;
use crate::model::snapshot::sort_snapshots;
use crate::model::{KindRegistry, SnapshotMetadata, SortKey};
use crate::storage::SnapshotStore;
use crate::utils::{Result, SnapshotError};
use std::path::Path;
use std::sync::Arc;

pub struct Snapshotter {
    api: Arc<dyn ResourceApi>,
    registry: Arc<KindRegistry>,
    store: SnapshotStore,
}

impl Snapshotter {
    pub fn new(api: Arc<dyn ResourceApi>, registry: Arc<KindRegistry>, store: SnapshotStore) -> Self {
        Self {
            api,
            registry,
            store,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Every snapshot in the store, ordered by `sort`.
    pub async fn list_backups(&self, sort: SortKey) -> Result<Vec<SnapshotMetadata>> {
        let mut snapshots = self.store.list().await?;
        sort_snapshots(&mut snapshots, sort);
        Ok(snapshots)
    }

    pub async fn delete_backup(&self, path: &Path) -> Result<()> {
        self.store.delete(path).await
    }

    /// The most recent snapshot by timestamp.
    pub async fn latest_backup(&self) -> Result<SnapshotMetadata> {
        self.list_backups(SortKey::Timestamp)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SnapshotError::SnapshotNotFound(format!(
                    "no snapshots in {}",
                    self.store.base_dir().display()
                ))
            })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cluster::InMemoryApi;
    use serde_json::json;
    use tempfile::TempDir;

    /// A small cluster: two application namespaces plus kube-system.
    pub fn seeded_api(registry: &KindRegistry) -> Arc<InMemoryApi> {
        let api = InMemoryApi::new("v1.30.2");
        let get = |kind: &str| registry.get(kind).unwrap();

        for ns in ["prod", "dev", "kube-system"] {
            api.insert(get("Namespace"), "", json!({"metadata": {"name": ns}}));
        }
        api.insert(get("ClusterRole"), "", json!({"metadata": {"name": "ops-reader"}, "rules": []}));
        api.insert(get("Secret"), "prod", json!({"metadata": {"name": "db"}, "type": "Opaque"}));
        api.insert(
            get("Deployment"),
            "prod",
            json!({"metadata": {"name": "api", "labels": {"app": "api"}}, "spec": {"replicas": 2}}),
        );
        api.insert(get("Service"), "prod", json!({"metadata": {"name": "api"}, "spec": {"ports": []}}));
        api.insert(get("ConfigMap"), "dev", json!({"metadata": {"name": "cfg"}, "data": {"a": "1"}}));
        api.insert(get("ConfigMap"), "kube-system", json!({"metadata": {"name": "coredns"}}));
        Arc::new(api)
    }

    pub fn snapshotter(api: Arc<InMemoryApi>, registry: &Arc<KindRegistry>, base: &TempDir) -> Snapshotter {
        Snapshotter::new(api, Arc::clone(registry), SnapshotStore::new(base.path()))
    }
}
