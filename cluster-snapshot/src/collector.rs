//! Concurrent resource collection.
//!
//! Work is split into partitions: one for cluster-scoped kinds and one per
//! target namespace. Each partition runs as its own task and sends a single
//! `PartitionResult` back over a channel; only the fan-in loop below touches
//! the aggregate and the progress callback.

use crate::cluster::ResourceApi;
use crate::filter::Filter;
use crate::model::{KindInfo, KindRegistry, ResourceRecord, Selection};
use crate::normalize::normalize;
use crate::utils::{Result, SnapshotError};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a collection run targets.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    /// Sorted
    pub namespaces: Vec<String>,
    pub kinds: Vec<KindInfo>,
    pub include_cluster_scope: bool,
}

impl CollectionPlan {
    /// Plural names of the targeted kinds, sorted.
    pub fn kind_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.kinds.iter().map(|k| k.plural.to_string()).collect();
        names.into_iter().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.namespaces.len() + usize::from(self.include_cluster_scope)
    }

    /// Rough number of objects to expect, for progress reporting.
    pub fn estimated_resources(&self) -> usize {
        let mut cluster = 0;
        let mut per_namespace = 0;
        for kind in &self.kinds {
            if kind.cluster_scoped {
                cluster += match kind.kind {
                    "Namespace" => self.namespaces.len(),
                    "ClusterRole" | "ClusterRoleBinding" => 50,
                    _ => 20,
                };
            } else {
                per_namespace += match kind.kind {
                    "ConfigMap" | "Secret" => 20,
                    "Deployment" | "Service" => 10,
                    _ => 5,
                };
            }
        }
        if !self.include_cluster_scope {
            cluster = 0;
        }
        (cluster + per_namespace * self.namespaces.len()).max(1)
    }
}

/// Outcome of a collection run.
#[derive(Debug, Default)]
pub struct Collection {
    /// Sorted by identity
    pub records: Vec<ResourceRecord>,
    pub warnings: Vec<SnapshotError>,
    pub cancelled: bool,
}

/// Reported to the progress callback after each partition finishes.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress<'a> {
    pub partition: &'a Partition,
    pub partitions_done: usize,
    pub partitions_total: usize,

    /// Records collected so far; never decreases
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    Cluster,
    Namespace(String),
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Cluster => write!(f, "cluster scope"),
            Partition::Namespace(ns) => write!(f, "namespace {ns}"),
        }
    }
}

/// Result of one partition task.
struct PartitionResult {
    partition: Partition,
    records: Vec<ResourceRecord>,
    warnings: Vec<SnapshotError>,
    cancelled: bool,
}

pub struct Collector {
    api: Arc<dyn ResourceApi>,
    registry: Arc<KindRegistry>,
    max_concurrent_partitions: usize,
}

impl Collector {
    pub fn new(api: Arc<dyn ResourceApi>, registry: Arc<KindRegistry>) -> Self {
        Self {
            api,
            registry,
            max_concurrent_partitions: 0,
        }
    }

    /// Cap concurrently running partitions; 0 means unbounded.
    pub fn with_max_concurrent_partitions(mut self, limit: usize) -> Self {
        self.max_concurrent_partitions = limit;
        self
    }

    /// Resolve target namespaces and kinds.
    ///
    /// Without a namespace include set every namespace is discovered from
    /// the API; a failure to do so is fatal.
    pub async fn plan(&self, selection: &Selection) -> Result<CollectionPlan> {
        let filter = Filter::new(selection);
        let registry = self.registry.as_ref();

        let kinds: Vec<KindInfo> = registry
            .all()
            .iter()
            .filter(|k| filter.includes_kind(k.kind, registry))
            .filter(|k| k.default_enabled || filter.names_kind(k.kind, registry))
            .cloned()
            .collect();

        let candidates: Vec<String> = if filter.has_namespace_includes() {
            filter.included_namespaces().map(str::to_string).collect()
        } else {
            self.discover_namespaces().await?
        };

        let namespaces: BTreeSet<String> = candidates
            .into_iter()
            .filter(|ns| !ns.is_empty() && filter.includes_namespace(ns))
            .collect();

        Ok(CollectionPlan {
            namespaces: namespaces.into_iter().collect(),
            kinds,
            include_cluster_scope: !filter.excludes_cluster_scope(),
        })
    }

    async fn discover_namespaces(&self) -> Result<Vec<String>> {
        let Some(namespace_kind) = self.registry.get("Namespace") else {
            return Ok(Vec::new());
        };
        let objects = self.api.list(namespace_kind, None).await?;
        let names: Vec<String> = objects
            .iter()
            .filter_map(|o| crate::cluster::object_name(o).map(str::to_string))
            .collect();
        debug!("Discovered {} namespaces", names.len());
        Ok(names)
    }

    /// Plan and collect in one go.
    pub async fn collect<F>(
        &self,
        selection: &Selection,
        cancel: &CancellationToken,
        on_batch: F,
    ) -> Result<Collection>
    where
        F: FnMut(BatchProgress<'_>),
    {
        let plan = self.plan(selection).await?;
        Ok(self.collect_plan(&plan, cancel, on_batch).await)
    }

    /// Fan out one task per partition and merge their results.
    pub async fn collect_plan<F>(
        &self,
        plan: &CollectionPlan,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> Collection
    where
        F: FnMut(BatchProgress<'_>),
    {
        let mut partitions = Vec::with_capacity(plan.partition_count());
        if plan.include_cluster_scope {
            partitions.push(Partition::Cluster);
        }
        partitions.extend(plan.namespaces.iter().cloned().map(Partition::Namespace));

        let total = partitions.len();
        info!(
            "Collecting {} kinds across {} partitions",
            plan.kinds.len(),
            total
        );

        let kinds = Arc::new(plan.kinds.clone());
        let targets: Arc<BTreeSet<String>> = Arc::new(plan.namespaces.iter().cloned().collect());
        let semaphore = (self.max_concurrent_partitions > 0)
            .then(|| Arc::new(Semaphore::new(self.max_concurrent_partitions)));

        let (tx, mut rx) = mpsc::channel::<PartitionResult>(total.max(1));
        let mut handles = Vec::with_capacity(total);

        for partition in partitions {
            let tx = tx.clone();
            let api = Arc::clone(&self.api);
            let kinds = Arc::clone(&kinds);
            let targets = Arc::clone(&targets);
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match &semaphore {
                    Some(sem) => tokio::select! {
                        permit = sem.acquire() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    },
                    None => None,
                };

                let result = if cancel.is_cancelled() {
                    PartitionResult {
                        partition,
                        records: Vec::new(),
                        warnings: Vec::new(),
                        cancelled: true,
                    }
                } else {
                    collect_partition(api.as_ref(), partition, &kinds, &targets, &cancel).await
                };

                if tx.send(result).await.is_err() {
                    debug!("Collection receiver dropped");
                }
            }));
        }
        drop(tx);

        let mut collection = Collection::default();
        let mut done = 0;
        while let Some(result) = rx.recv().await {
            done += 1;
            debug!(
                "{} finished: {} records, {} warnings",
                result.partition,
                result.records.len(),
                result.warnings.len()
            );
            collection.records.extend(result.records);
            collection.warnings.extend(result.warnings);
            collection.cancelled |= result.cancelled;

            on_batch(BatchProgress {
                partition: &result.partition,
                partitions_done: done,
                partitions_total: total,
                records: collection.records.len(),
            });
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Collection task failed: {}", e);
            }
        }

        collection.cancelled |= cancel.is_cancelled();
        collection.records.sort_by_key(ResourceRecord::identity);

        if collection.cancelled {
            info!(
                "Collection cancelled after {} of {} partitions ({} records)",
                done,
                total,
                collection.records.len()
            );
        } else {
            info!(
                "Collected {} records with {} warnings",
                collection.records.len(),
                collection.warnings.len()
            );
        }
        collection
    }
}

async fn collect_partition(
    api: &dyn ResourceApi,
    partition: Partition,
    kinds: &[KindInfo],
    targets: &BTreeSet<String>,
    cancel: &CancellationToken,
) -> PartitionResult {
    let namespace = match &partition {
        Partition::Cluster => None,
        Partition::Namespace(ns) => Some(ns.clone()),
    };
    let mut result = PartitionResult {
        partition,
        records: Vec::new(),
        warnings: Vec::new(),
        cancelled: false,
    };

    let in_partition = kinds
        .iter()
        .filter(|k| k.cluster_scoped == namespace.is_none());

    for kind in in_partition {
        if cancel.is_cancelled() {
            result.cancelled = true;
            break;
        }

        let objects = match api.list(kind, namespace.as_deref()).await {
            Ok(objects) => objects,
            Err(source) => {
                let err = SnapshotError::Collection {
                    kind: kind.kind.to_string(),
                    namespace: namespace.clone().unwrap_or_default(),
                    source,
                };
                warn!("{}", err);
                result.warnings.push(err);
                continue;
            }
        };

        for object in objects {
            if kind.should_skip(&object) {
                continue;
            }
            if kind.kind == "Namespace" {
                let name = crate::cluster::object_name(&object).unwrap_or_default();
                if !targets.contains(name) {
                    continue;
                }
            }

            match ResourceRecord::from_object(kind, namespace.as_deref().unwrap_or_default(), normalize(object)) {
                Ok(record) => result.records.push(record),
                Err(err) => {
                    warn!("{}", err);
                    result.warnings.push(err);
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryApi;
    use serde_json::json;

    fn seeded_api(registry: &KindRegistry) -> Arc<InMemoryApi> {
        let api = InMemoryApi::new("v1.30.2");
        let get = |kind: &str| registry.get(kind).unwrap();

        for ns in ["prod", "dev", "kube-system"] {
            api.insert(get("Namespace"), "", json!({"metadata": {"name": ns}}));
        }
        api.insert(get("ClusterRole"), "", json!({"metadata": {"name": "ops-reader"}}));
        api.insert(get("ClusterRole"), "", json!({"metadata": {"name": "system:node"}}));

        api.insert(get("Secret"), "prod", json!({"metadata": {"name": "db"}, "type": "Opaque"}));
        api.insert(
            get("Secret"),
            "prod",
            json!({"metadata": {"name": "default-token"}, "type": "kubernetes.io/service-account-token"}),
        );
        api.insert(get("ServiceAccount"), "prod", json!({"metadata": {"name": "default"}}));
        api.insert(get("ServiceAccount"), "prod", json!({"metadata": {"name": "deployer"}}));
        api.insert(get("Deployment"), "prod", json!({"metadata": {"name": "api"}, "spec": {"replicas": 2}}));
        api.insert(get("Pod"), "prod", json!({"metadata": {"name": "api-7d9f"}}));
        api.insert(get("ConfigMap"), "dev", json!({"metadata": {"name": "cfg"}, "data": {"a": "1"}}));
        api.insert(get("ConfigMap"), "kube-system", json!({"metadata": {"name": "coredns"}}));
        Arc::new(api)
    }

    fn names(collection: &Collection) -> Vec<String> {
        collection.records.iter().map(|r| r.info.display_name()).collect()
    }

    #[tokio::test]
    async fn test_collects_all_partitions() {
        let registry = Arc::new(KindRegistry::builtin());
        let api = seeded_api(&registry);
        let collector = Collector::new(api, Arc::clone(&registry));
        let selection = Selection::new().exclude_namespaces(["kube-system"]);

        let collection = collector
            .collect(&selection, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert!(!collection.cancelled);
        assert!(collection.warnings.is_empty());
        assert_eq!(
            names(&collection),
            vec![
                "ClusterRole cluster/ops-reader",
                "ConfigMap dev/cfg",
                "Deployment prod/api",
                "Namespace cluster/dev",
                "Namespace cluster/prod",
                "Secret prod/db",
                "ServiceAccount prod/deployer",
            ]
        );

        let deployment = collection
            .records
            .iter()
            .find(|r| r.info.kind == "Deployment")
            .unwrap()
            .object()
            .unwrap();
        assert!(deployment.pointer("/metadata/uid").is_none());
        assert!(deployment.pointer("/metadata/resourceVersion").is_none());
        assert_eq!(deployment["apiVersion"], "apps/v1");
    }

    #[tokio::test]
    async fn test_opt_in_kinds_need_explicit_selection() {
        let registry = Arc::new(KindRegistry::builtin());
        let collector = Collector::new(seeded_api(&registry), Arc::clone(&registry));

        let selection = Selection::new().include_namespaces(["prod"]).include_kinds(["pods"]);
        let collection = collector
            .collect(&selection, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(names(&collection), vec!["Pod prod/api-7d9f"]);
    }

    #[tokio::test]
    async fn test_plan() {
        let registry = Arc::new(KindRegistry::builtin());
        let collector = Collector::new(seeded_api(&registry), Arc::clone(&registry));

        let plan = collector
            .plan(&Selection::new().exclude_namespaces(["kube-system", "cluster"]))
            .await
            .unwrap();
        assert_eq!(plan.namespaces, vec!["dev", "prod"]);
        assert!(!plan.include_cluster_scope);
        assert_eq!(plan.partition_count(), 2);
        assert!(!plan.kind_names().contains(&"pods".to_string()));
        assert!(plan.kind_names().contains(&"secrets".to_string()));
    }

    #[tokio::test]
    async fn test_excluding_cluster_skips_cluster_task() {
        let registry = Arc::new(KindRegistry::builtin());
        let collector = Collector::new(seeded_api(&registry), Arc::clone(&registry));
        let selection = Selection::new().include_namespaces(["dev"]).exclude_namespaces(["cluster"]);

        let collection = collector
            .collect(&selection, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(names(&collection), vec!["ConfigMap dev/cfg"]);
    }

    #[tokio::test]
    async fn test_list_failure_becomes_warning() {
        let registry = Arc::new(KindRegistry::builtin());
        let api = seeded_api(&registry);
        api.fail_list("Secret", "prod");
        let collector = Collector::new(api, Arc::clone(&registry));

        let collection = collector
            .collect(
                &Selection::new().include_namespaces(["prod"]),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(collection.warnings.len(), 1);
        assert!(matches!(
            &collection.warnings[0],
            SnapshotError::Collection { kind, namespace, .. } if kind == "Secret" && namespace == "prod"
        ));
        assert!(names(&collection).contains(&"Deployment prod/api".to_string()));
        assert!(!names(&collection).iter().any(|n| n.starts_with("Secret")));
    }

    #[tokio::test]
    async fn test_unnamed_object_becomes_conversion_warning() {
        let registry = Arc::new(KindRegistry::builtin());
        let api = seeded_api(&registry);
        api.insert(registry.get("ConfigMap").unwrap(), "dev", json!({"data": {"x": "y"}}));
        let collector = Collector::new(api, Arc::clone(&registry));

        let collection = collector
            .collect(
                &Selection::new().include_namespaces(["dev"]),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(collection.warnings.len(), 1);
        assert!(matches!(collection.warnings[0], SnapshotError::Conversion { .. }));
        assert!(names(&collection).contains(&"ConfigMap dev/cfg".to_string()));
    }

    #[tokio::test]
    async fn test_namespace_discovery_failure_is_fatal() {
        let registry = Arc::new(KindRegistry::builtin());
        let api = seeded_api(&registry);
        api.fail_list("Namespace", "*");
        let collector = Collector::new(api, Arc::clone(&registry));

        let result = collector
            .collect(&Selection::new(), &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(SnapshotError::Api(_))));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let registry = Arc::new(KindRegistry::builtin());
        let collector = Collector::new(seeded_api(&registry), Arc::clone(&registry))
            .with_max_concurrent_partitions(1);

        let mut seen = Vec::new();
        let collection = collector
            .collect(&Selection::new(), &CancellationToken::new(), |batch| {
                seen.push((batch.partitions_done, batch.partitions_total, batch.records));
            })
            .await
            .unwrap();

        // cluster scope plus three namespaces
        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|w| w[0].2 <= w[1].2 && w[0].0 < w[1].0));
        assert_eq!(seen.last().unwrap(), &(4, 4, collection.records.len()));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let registry = Arc::new(KindRegistry::builtin());
        let collector = Collector::new(seeded_api(&registry), Arc::clone(&registry))
            .with_max_concurrent_partitions(2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let collection = collector
            .collect(&Selection::new(), &cancel, |_| {})
            .await
            .unwrap();
        assert!(collection.cancelled);
        assert!(collection.records.is_empty());
    }

    #[test]
    fn test_estimate_has_floor() {
        let plan = CollectionPlan {
            namespaces: Vec::new(),
            kinds: Vec::new(),
            include_cluster_scope: false,
        };
        assert_eq!(plan.estimated_resources(), 1);
    }
}
