//! Replay of a single record into the target store.

use crate::cluster::{ResourceApi, WriteOutcome};
use crate::model::{KindRegistry, ResourceRecord, RestoreOptions};
use crate::utils::SnapshotError;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a record was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Present in the target and overwrite is off
    AlreadyExists,
    /// Dry run; the object would be created
    SimulatedCreate,
    /// Dry run; the object would be updated (or skipped without overwrite)
    SimulatedUpdate,
    /// The kind is not in the registry
    UnsupportedKind,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Skipped(SkipReason),
    Failed(SnapshotError),
}

impl ApplyOutcome {
    /// Whether the target was (or in a dry run would be) written.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Created
                | ApplyOutcome::Updated
                | ApplyOutcome::Skipped(SkipReason::SimulatedCreate | SkipReason::SimulatedUpdate)
        )
    }
}

pub struct Applier {
    api: Arc<dyn ResourceApi>,
    registry: Arc<KindRegistry>,
}

impl Applier {
    pub fn new(api: Arc<dyn ResourceApi>, registry: Arc<KindRegistry>) -> Self {
        Self { api, registry }
    }

    /// Apply one record with create-or-update semantics.
    ///
    /// Failures come back as `ApplyOutcome::Failed`; nothing here aborts a
    /// restore.
    pub async fn apply(
        &self,
        record: &ResourceRecord,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> ApplyOutcome {
        let info = &record.info;
        let Some(kind) = self.registry.get(&info.kind) else {
            warn!("Skipping {}: unsupported kind", info.display_name());
            return ApplyOutcome::Skipped(SkipReason::UnsupportedKind);
        };
        let namespace = (!kind.cluster_scoped && !info.namespace.is_empty())
            .then_some(info.namespace.as_str());

        let apply_error = |source| SnapshotError::Apply {
            kind: info.kind.clone(),
            namespace: info.namespace.clone(),
            name: info.name.clone(),
            source,
        };

        if options.dry_run {
            return match self.api.get(kind, namespace, &info.name).await {
                Ok(Some(_)) => ApplyOutcome::Skipped(SkipReason::SimulatedUpdate),
                Ok(None) => ApplyOutcome::Skipped(SkipReason::SimulatedCreate),
                Err(source) => ApplyOutcome::Failed(apply_error(source)),
            };
        }

        let object = match parse_object(record, namespace) {
            Ok(object) => object,
            Err(e) => return ApplyOutcome::Failed(e),
        };

        let written = if options.overwrite_existing {
            self.api.create_or_update(kind, namespace, &object, false).await
        } else {
            self.api
                .create(kind, namespace, &object, false)
                .await
                .map(|()| WriteOutcome::Created)
        };

        let outcome = match written {
            Ok(WriteOutcome::Created) => ApplyOutcome::Created,
            Ok(WriteOutcome::Updated) => ApplyOutcome::Updated,
            Err(e) if e.is_already_exists() => {
                debug!("Skipping existing {}", info.display_name());
                return ApplyOutcome::Skipped(SkipReason::AlreadyExists);
            }
            Err(source) => return ApplyOutcome::Failed(apply_error(source)),
        };

        if options.wait {
            self.settle(record, options, cancel).await;
        }
        outcome
    }

    /// Bounded pause after a write; cancellation cuts it short.
    async fn settle(&self, record: &ResourceRecord, options: &RestoreOptions, cancel: &CancellationToken) {
        let pause = options.wait_duration();
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => {
                warn!(
                    "Wait for {} interrupted; it may not be ready yet",
                    record.info.display_name()
                );
            }
        }
    }
}

/// Parse stored content and default its namespace from the record.
fn parse_object(record: &ResourceRecord, namespace: Option<&str>) -> Result<Value, SnapshotError> {
    let conversion_error = |reason: String| SnapshotError::Conversion {
        kind: record.info.kind.clone(),
        namespace: record.info.namespace.clone(),
        name: record.info.name.clone(),
        reason,
    };

    let mut object = record.object().map_err(|e| conversion_error(e.to_string()))?;
    let metadata = object
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| conversion_error("object has no metadata".to_string()))?;

    if let Some(ns) = namespace {
        metadata
            .entry("namespace")
            .or_insert_with(|| Value::String(ns.to_string()));
    }
    Ok(object)
}
