use super::Snapshotter;
use crate::collector::Collector;
use crate::model::{BackupOptions, ProgressState, SnapshotMetadata};
use crate::utils::{Result, SnapshotError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl Snapshotter {
    /// Collect the selected resources and save them as a new snapshot.
    ///
    /// Per-resource problems end up in the progress warnings and do not
    /// fail the backup. Cancellation fails it and nothing is written.
    pub async fn create_backup<F>(
        &self,
        options: &BackupOptions,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<SnapshotMetadata>
    where
        F: FnMut(&ProgressState),
    {
        info!("Starting backup: {}", options.name);

        let version = self.api.server_version().await?;
        let collector = Collector::new(Arc::clone(&self.api), Arc::clone(&self.registry))
            .with_max_concurrent_partitions(options.max_concurrent_partitions);
        let plan = collector.plan(&options.selection).await?;

        let mut progress = ProgressState::new(plan.estimated_resources(), "Starting backup...");
        on_progress(&progress);

        let collection = collector
            .collect_plan(&plan, cancel, |batch| {
                progress.advance_to(
                    batch.records,
                    format!(
                        "Collected {} resources ({}/{} partitions, last: {})",
                        batch.records, batch.partitions_done, batch.partitions_total, batch.partition
                    ),
                );
                on_progress(&progress);
            })
            .await;

        for warning in collection.warnings {
            progress.warn(warning);
        }

        if collection.cancelled {
            warn!("Backup {} cancelled, nothing written", options.name);
            return Err(SnapshotError::Cancelled {
                completed: collection.records.len(),
                total: progress.total,
            });
        }

        let mut metadata = SnapshotMetadata::new(&options.name, version);
        metadata.namespaces = plan.namespaces.clone();
        metadata.kinds = plan.kind_names();
        metadata.compressed = options.compress;

        progress.set_message("Saving backup files...");
        on_progress(&progress);

        let metadata = self.store.save(metadata, &collection.records, cancel).await?;

        progress.total = metadata.total_resources;
        progress.advance_to(metadata.total_resources, "Backup completed");
        on_progress(&progress);

        if progress.warnings.is_empty() {
            info!("Backup completed: {} ({} resources)", metadata.name, metadata.total_resources);
        } else {
            warn!(
                "Backup completed: {} ({} resources, {} warnings)",
                metadata.name,
                metadata.total_resources,
                progress.warnings.len()
            );
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::model::{BackupOptions, KindRegistry, Selection};
    use crate::utils::SnapshotError;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_backup_writes_snapshot() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let engine = snapshotter(seeded_api(&registry), &registry, &base);

        let mut options = BackupOptions::new("nightly");
        options.selection = Selection::new().exclude_namespaces(["kube-system"]);

        let mut updates = Vec::new();
        let metadata = engine
            .create_backup(&options, &CancellationToken::new(), |p| {
                updates.push((p.completed, p.current_message.clone()))
            })
            .await
            .unwrap();

        assert_eq!(metadata.name, "nightly");
        assert_eq!(metadata.source_system_version, "v1.30.2");
        assert_eq!(metadata.namespaces, vec!["dev", "prod"]);
        assert!(metadata.kinds.contains(&"deployments".to_string()));
        // 2 namespaces, 1 cluster role, secret, deployment, service, config map
        assert_eq!(metadata.total_resources, 7);
        assert!(metadata.path.join("prod/deployment-api.json").is_file());
        assert!(metadata.path.join("cluster/namespace-prod.json").is_file());
        assert!(!metadata.path.join("cluster/namespace-kube-system.json").exists());

        assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(updates.last().unwrap(), &(7, "Backup completed".to_string()));
    }

    #[tokio::test]
    async fn test_backup_survives_partial_failure() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let api = seeded_api(&registry);
        api.fail_list("Secret", "prod");
        api.fail_list("ClusterRole", "*");
        let engine = snapshotter(api, &registry, &base);

        let mut options = BackupOptions::new("partial");
        options.selection = Selection::new().include_namespaces(["prod"]);

        let mut warnings = 0;
        let metadata = engine
            .create_backup(&options, &CancellationToken::new(), |p| warnings = p.warnings.len())
            .await
            .unwrap();

        assert_eq!(warnings, 2);
        // Namespace prod, deployment, service
        assert_eq!(metadata.total_resources, 3);
        assert!(!metadata.path.join("prod/secret-db.json").exists());
        assert!(metadata.path.join("prod/service-api.json").is_file());
    }

    #[tokio::test]
    async fn test_backup_survives_failed_namespace() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let api = seeded_api(&registry);
        for kind in registry.all().iter().filter(|k| !k.cluster_scoped) {
            api.fail_list(kind.kind, "dev");
        }
        let engine = snapshotter(api, &registry, &base);

        let mut options = BackupOptions::new("dev-down");
        options.selection = Selection::new().exclude_namespaces(["kube-system"]);

        let mut warnings = 0;
        let mut only_dev = true;
        let metadata = engine
            .create_backup(&options, &CancellationToken::new(), |p| {
                warnings = p.warnings.len();
                only_dev = p.warnings.iter().all(|w| {
                    matches!(w, SnapshotError::Collection { namespace, .. } if namespace == "dev")
                });
            })
            .await
            .unwrap();

        let expected_warnings = registry
            .all()
            .iter()
            .filter(|k| !k.cluster_scoped && k.default_enabled)
            .count();
        assert_eq!(warnings, expected_warnings);
        assert!(only_dev);

        // Everything outside dev: 2 namespaces, cluster role, secret, deployment, service
        assert_eq!(metadata.total_resources, 6);
        assert!(metadata.path.join("prod/secret-db.json").is_file());
        assert!(metadata.path.join("prod/deployment-api.json").is_file());
        assert!(metadata.path.join("prod/service-api.json").is_file());
        assert!(metadata.path.join("cluster/clusterrole-ops-reader.json").is_file());
        assert!(!metadata.path.join("dev").exists());
    }

    #[tokio::test]
    async fn test_cancelled_backup_writes_nothing() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let engine = snapshotter(seeded_api(&registry), &registry, &base);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .create_backup(&BackupOptions::new("never"), &cancel, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, SnapshotError::Cancelled { .. }));
        assert!(std::fs::read_dir(base.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_fatal() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let api = seeded_api(&registry);
        api.fail_list("Namespace", "*");
        let engine = snapshotter(api, &registry, &base);

        let err = engine
            .create_backup(&BackupOptions::new("x"), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, SnapshotError::Api(_)));
    }
}
