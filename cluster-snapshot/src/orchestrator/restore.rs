use super::Snapshotter;
use crate::applier::{Applier, ApplyOutcome, SkipReason};
use crate::filter::Filter;
use crate::model::{ProgressState, ResourceRecord, RestoreOptions};
use crate::sequencer;
use crate::utils::{Result, SnapshotError};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary of a restore run
#[derive(Debug, Default)]
pub struct RestoreResult {
    /// Snapshot that was replayed
    pub source: PathBuf,

    /// Records applied, or in a dry run validated
    pub processed: usize,
    pub created: usize,
    pub updated: usize,

    /// Filtered out, already present, or of an unknown kind
    pub skipped: usize,

    /// Namespaces of processed records, sorted
    pub namespaces: Vec<String>,

    /// Lower-case kinds of processed records, sorted
    pub kinds: Vec<String>,

    pub errors: Vec<SnapshotError>,
    pub duration: Duration,
    pub dry_run: bool,

    /// Stopped early; the counts cover only the records already handled
    pub cancelled: bool,
}

impl Snapshotter {
    /// Replay a snapshot into the target store.
    ///
    /// Records are applied one at a time in dependency order. Failed records
    /// are collected in `errors`. Cancellation stops before the next record
    /// and returns the partial result with `cancelled` set; whatever was
    /// already applied stays in the target.
    pub async fn restore_backup<F>(
        &self,
        options: &RestoreOptions,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<RestoreResult>
    where
        F: FnMut(&ProgressState),
    {
        let started = Instant::now();
        let source = match &options.input {
            Some(path) => path.clone(),
            None => self.latest_backup().await?.path,
        };
        info!("Starting restore from: {}", source.display());

        let (manifest, records) = self.store.load(&source).await?;
        info!(
            "Loaded snapshot {} ({} resources)",
            manifest.metadata.name,
            records.len()
        );

        let filter = Filter::new(&options.selection);
        let loaded = records.len();
        let selected: Vec<ResourceRecord> = records
            .into_iter()
            .filter(|r| filter.includes_record(&r.info, &self.registry))
            .collect();
        debug!("Filtered to {} resources for restore", selected.len());

        let mut result = RestoreResult {
            source,
            skipped: loaded - selected.len(),
            dry_run: options.dry_run,
            ..RestoreResult::default()
        };

        if selected.is_empty() {
            result.duration = started.elapsed();
            info!("Nothing to restore, {} resources filtered out", result.skipped);
            return Ok(result);
        }

        let ordered = sequencer::order(selected, &self.registry);
        let total = ordered.len();
        let applier = Applier::new(Arc::clone(&self.api), Arc::clone(&self.registry));

        let mut progress = ProgressState::new(total, "Starting restore...");
        on_progress(&progress);

        let mut namespaces = BTreeSet::new();
        let mut kinds = BTreeSet::new();

        for (index, record) in ordered.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Restore cancelled after {} of {} resources", index, total);
                result.cancelled = true;
                break;
            }

            progress.advance_to(index, format!("Restoring {}", record.info.display_name()));
            on_progress(&progress);

            match applier.apply(record, options, cancel).await {
                ApplyOutcome::Failed(err) => {
                    warn!("{}", err);
                    progress.warn(err);
                    continue;
                }
                ApplyOutcome::Skipped(SkipReason::AlreadyExists) => {
                    debug!("Skipping existing resource: {}", record.info.display_name());
                    result.skipped += 1;
                    continue;
                }
                ApplyOutcome::Skipped(SkipReason::UnsupportedKind) => {
                    result.skipped += 1;
                    continue;
                }
                ApplyOutcome::Created => result.created += 1,
                ApplyOutcome::Updated => result.updated += 1,
                ApplyOutcome::Skipped(SkipReason::SimulatedCreate | SkipReason::SimulatedUpdate) => {}
            }

            result.processed += 1;
            if !record.info.namespace.is_empty() {
                namespaces.insert(record.info.namespace.clone());
            }
            kinds.insert(record.info.kind.to_lowercase());
        }

        if !result.cancelled {
            progress.advance_to(total, "Restore completed");
            on_progress(&progress);
        }

        result.errors = std::mem::take(&mut progress.warnings);
        result.namespaces = namespaces.into_iter().collect();
        result.kinds = kinds.into_iter().collect();
        result.duration = started.elapsed();

        info!(
            "Restore {}: {} processed, {} skipped, {} errors",
            if result.cancelled { "cancelled" } else { "completed" },
            result.processed,
            result.skipped,
            result.errors.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::cluster::InMemoryApi;
    use crate::model::{BackupOptions, KindRegistry, Selection, SnapshotMetadata};
    use tempfile::TempDir;

    /// Back up the seeded cluster (without kube-system) under `base`.
    async fn backup(registry: &Arc<KindRegistry>, base: &TempDir, name: &str, compress: bool) -> SnapshotMetadata {
        let engine = snapshotter(seeded_api(registry), registry, base);
        let mut options = BackupOptions::new(name);
        options.selection = Selection::new().exclude_namespaces(["kube-system"]);
        options.compress = compress;
        engine
            .create_backup(&options, &CancellationToken::new(), |_| {})
            .await
            .unwrap()
    }

    fn restore_options(input: &SnapshotMetadata) -> RestoreOptions {
        RestoreOptions {
            input: Some(input.path.clone()),
            ..RestoreOptions::default()
        }
    }

    #[tokio::test]
    async fn test_restore_into_empty_target() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "full", true).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        let engine = snapshotter(target.clone(), &registry, &base);

        let mut messages = Vec::new();
        let result = engine
            .restore_backup(&restore_options(&snapshot), &CancellationToken::new(), |p| {
                messages.push(p.current_message.clone())
            })
            .await
            .unwrap();

        assert_eq!(result.processed, 7);
        assert_eq!(result.created, 7);
        assert_eq!(result.skipped, 0);
        assert!(result.errors.is_empty());
        assert_eq!(result.namespaces, vec!["dev", "prod"]);
        assert!(result.kinds.contains(&"deployment".to_string()));
        assert_eq!(target.len(), 7);

        let deployment = target.object("Deployment", "prod", "api").unwrap();
        assert_eq!(deployment["spec"]["replicas"], 2);
        assert_eq!(deployment["metadata"]["labels"]["app"], "api");

        // Cluster role first, namespaces before anything inside them.
        assert_eq!(messages[1], "Restoring ClusterRole cluster/ops-reader");
        assert_eq!(messages[2], "Restoring Namespace cluster/dev");
        assert_eq!(messages.last().unwrap(), "Restore completed");
    }

    #[tokio::test]
    async fn test_restore_twice_is_idempotent() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "twice", false).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        let engine = snapshotter(target.clone(), &registry, &base);
        let options = restore_options(&snapshot);
        let cancel = CancellationToken::new();

        engine.restore_backup(&options, &cancel, |_| {}).await.unwrap();
        let before = target.dump();
        let second = engine.restore_backup(&options, &cancel, |_| {}).await.unwrap();

        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 7);
        assert_eq!(target.dump(), before);

        let overwrite = RestoreOptions {
            overwrite_existing: true,
            ..options
        };
        let third = engine.restore_backup(&overwrite, &cancel, |_| {}).await.unwrap();
        assert_eq!(third.updated, 7);
        assert_eq!(third.processed, 7);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "dry", false).await;

        let target = seeded_api(&registry);
        let engine = snapshotter(target.clone(), &registry, &base);
        let before = target.dump();

        let options = RestoreOptions {
            dry_run: true,
            ..restore_options(&snapshot)
        };
        let result = engine
            .restore_backup(&options, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert!(result.dry_run);
        assert_eq!(result.processed, 7);
        assert_eq!(result.created + result.updated, 0);
        assert_eq!(target.dump(), before);
        assert_eq!(target.write_count(), 0);
    }

    #[tokio::test]
    async fn test_filter_and_latest_snapshot() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        backup(&registry, &base, "latest", false).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        let engine = snapshotter(target.clone(), &registry, &base);
        let options = RestoreOptions {
            selection: Selection::new().include_namespaces(["prod"]).exclude_kinds(["secrets"]),
            ..RestoreOptions::default()
        };

        let result = engine
            .restore_backup(&options, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert!(result.source.ends_with("latest"));
        assert_eq!(result.processed, 2);
        assert_eq!(result.skipped, 5);
        assert!(target.object("Deployment", "prod", "api").is_some());
        assert!(target.object("Secret", "prod", "db").is_none());
        assert!(target.object("Namespace", "", "prod").is_none());
    }

    #[tokio::test]
    async fn test_everything_filtered_out() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "empty", false).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        let engine = snapshotter(target.clone(), &registry, &base);
        let options = RestoreOptions {
            selection: Selection::new().include_namespaces(["staging"]),
            ..restore_options(&snapshot)
        };

        let mut calls = 0;
        let result = engine
            .restore_backup(&options, &CancellationToken::new(), |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(result.processed, 0);
        assert_eq!(result.skipped, 7);
        assert_eq!(calls, 0);
        assert!(target.is_empty());
    }

    #[tokio::test]
    async fn test_failed_writes_are_collected() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "faulty", false).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        target.fail_writes("Service");
        let engine = snapshotter(target.clone(), &registry, &base);

        let result = engine
            .restore_backup(&restore_options(&snapshot), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert!(matches!(&result.errors[0], SnapshotError::Apply { kind, .. } if kind == "Service"));
        assert_eq!(result.processed, 6);
        assert!(target.object("Deployment", "prod", "api").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_restore() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "stop", false).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        let engine = snapshotter(target.clone(), &registry, &base);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .restore_backup(&restore_options(&snapshot), &cancel, |_| {})
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.processed, 0);
        assert!(target.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_mid_replay_keeps_partial_result() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let snapshot = backup(&registry, &base, "halfway", false).await;

        let target = Arc::new(InMemoryApi::new("v1.31.0"));
        target.fail_writes("ClusterRole");
        let engine = snapshotter(target.clone(), &registry, &base);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let mut last = String::new();
        let result = engine
            .restore_backup(&restore_options(&snapshot), &cancel, |p| {
                last = p.current_message.clone();
                if p.completed >= 3 {
                    trigger.cancel();
                }
            })
            .await
            .unwrap();

        // Cluster role fails, then two namespaces and one more record land.
        assert!(result.cancelled);
        assert_eq!(result.created, 3);
        assert_eq!(result.processed, 3);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(&result.errors[0], SnapshotError::Apply { kind, .. } if kind == "ClusterRole"));
        assert!(result.kinds.contains(&"namespace".to_string()));
        assert!(!result.namespaces.is_empty());
        assert_eq!(target.len(), 3);
        assert_ne!(last, "Restore completed");
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let registry = Arc::new(KindRegistry::builtin());
        let base = TempDir::new().unwrap();
        let engine = snapshotter(Arc::new(InMemoryApi::new("v1")), &registry, &base);

        assert!(matches!(
            engine.restore_backup(&RestoreOptions::default(), &CancellationToken::new(), |_| {}).await,
            Err(SnapshotError::SnapshotNotFound(_))
        ));
    }
}
