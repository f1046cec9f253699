//! On-disk snapshot store.
//!
//! A snapshot is a directory under the base directory:
//!
//! ```text
//! <base>/<name>/manifest.json
//! <base>/<name>/cluster/<kind>-<name>.json
//! <base>/<name>/<namespace>/<kind>-<name>.json
//! ```
//!
//! Compressed snapshots replace the directory with `<base>/<name>.tar.zst`
//! holding the same tree.

pub mod archive;

use crate::model::snapshot::{
    ARCHIVE_SUFFIX, CLUSTER_DIR, MANIFEST_FILE_NAME, RECORD_EXTENSION,
};
use crate::model::{IdentityKey, RecordInfo, ResourceRecord, SnapshotManifest, SnapshotMetadata};
use crate::utils::{Result, SnapshotError};
use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SnapshotStore {
    base_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Location of the snapshot called `name`: the archive when only the
    /// archive exists, the directory otherwise.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        let dir = self.base_dir.join(name);
        let archive = self.archive_path(name);
        if !dir.exists() && archive.is_file() {
            archive
        } else {
            dir
        }
    }

    /// Resolve user input that is either a path or a snapshot name.
    pub fn locate(&self, input: &str) -> Result<PathBuf> {
        let as_path = PathBuf::from(input);
        if as_path.exists() {
            return Ok(as_path);
        }
        let resolved = self.resolve_path(input);
        if resolved.exists() {
            Ok(resolved)
        } else {
            Err(SnapshotError::SnapshotNotFound(input.to_string()))
        }
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}{ARCHIVE_SUFFIX}"))
    }

    /// Write a snapshot and return its final metadata.
    ///
    /// Counts, size and path in `metadata` are recomputed; `namespaces` and
    /// `kinds` are kept, sorted and de-duplicated. When `metadata.compressed`
    /// is set the tree is archived and the directory removed.
    pub async fn save(
        &self,
        mut metadata: SnapshotMetadata,
        records: &[ResourceRecord],
        cancel: &CancellationToken,
    ) -> Result<SnapshotMetadata> {
        let snapshot_dir = self.base_dir.join(&metadata.name);
        let archive = self.archive_path(&metadata.name);
        if snapshot_dir.exists() || archive.exists() {
            return Err(SnapshotError::storage(
                format!("create snapshot {}", metadata.name),
                io::Error::new(io::ErrorKind::AlreadyExists, "snapshot already exists"),
            ));
        }

        let mut seen: HashSet<IdentityKey> = HashSet::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.identity()) {
                return Err(SnapshotError::DuplicateRecord(record.info.display_name()));
            }
        }

        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| SnapshotError::storage(format!("create {}", snapshot_dir.display()), e))?;

        match self.write_tree(&snapshot_dir, &mut metadata, records, cancel).await {
            Ok(()) => {}
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&snapshot_dir).await {
                    warn!("Failed to remove incomplete snapshot {}: {}", snapshot_dir.display(), cleanup);
                }
                return Err(e);
            }
        }

        if metadata.compressed {
            compress(&snapshot_dir, &archive).await?;
            metadata.path = archive;
        } else {
            metadata.path = snapshot_dir;
        }

        info!(
            "Saved snapshot {} ({} resources) to {}",
            metadata.name,
            metadata.total_resources,
            metadata.path.display()
        );
        Ok(metadata)
    }

    async fn write_tree(
        &self,
        snapshot_dir: &Path,
        metadata: &mut SnapshotMetadata,
        records: &[ResourceRecord],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut created_dirs: HashSet<PathBuf> = HashSet::new();
        let mut infos: Vec<RecordInfo> = Vec::with_capacity(records.len());
        let mut size_bytes = 0u64;

        for (written, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled {
                    completed: written,
                    total: records.len(),
                });
            }

            let relative_path = relative_path_for(&record.info);
            let full_path = snapshot_dir.join(&relative_path);
            if let Some(parent) = full_path.parent() {
                if created_dirs.insert(parent.to_path_buf()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        SnapshotError::storage(format!("create {}", parent.display()), e)
                    })?;
                }
            }

            tokio::fs::write(&full_path, &record.content)
                .await
                .map_err(|e| SnapshotError::storage(format!("write {relative_path}"), e))?;

            size_bytes += record.content.len() as u64;
            let mut info = record.info.clone();
            info.relative_path = relative_path;
            infos.push(info);
        }

        metadata.namespaces.sort();
        metadata.namespaces.dedup();
        metadata.kinds.sort();
        metadata.kinds.dedup();
        metadata.total_resources = infos.len();
        metadata.size_bytes = size_bytes;
        metadata.path = snapshot_dir.to_path_buf();

        let manifest = SnapshotManifest {
            metadata: metadata.clone(),
            records: infos,
        };
        let manifest_path = snapshot_dir.join(MANIFEST_FILE_NAME);
        tokio::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(|e| SnapshotError::storage("write manifest", e))?;

        debug!("Wrote {} records to {}", manifest.records.len(), snapshot_dir.display());
        Ok(())
    }

    /// Read a snapshot directory or archive.
    ///
    /// The returned metadata's `path` is `path`; archives are unpacked into
    /// a scratch directory that is gone when this returns.
    pub async fn load(&self, path: &Path) -> Result<(SnapshotManifest, Vec<ResourceRecord>)> {
        let compressed = is_archive(path);

        // Held until the end of the function; dropping it removes the tree.
        let scratch = if compressed {
            Some(unpack(path).await?)
        } else {
            None
        };
        let root = scratch.as_ref().map(TempDir::path).unwrap_or(path);

        let manifest_path = root.join(MANIFEST_FILE_NAME);
        let raw = tokio::fs::read(&manifest_path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound && !path.exists() {
                SnapshotError::SnapshotNotFound(path.display().to_string())
            } else {
                SnapshotError::storage(format!("read {}", manifest_path.display()), e)
            }
        })?;

        let mut manifest = parse_manifest(&raw, path)?;
        validate_manifest(&manifest, path)?;

        let mut records = Vec::with_capacity(manifest.records.len());
        for info in &manifest.records {
            let content = tokio::fs::read(root.join(&info.relative_path))
                .await
                .map_err(|e| SnapshotError::storage(format!("read {}", info.relative_path), e))?;
            records.push(ResourceRecord {
                info: info.clone(),
                content,
            });
        }

        manifest.metadata.path = path.to_path_buf();
        manifest.metadata.compressed = compressed;

        debug!("Loaded {} records from {}", records.len(), path.display());
        Ok((manifest, records))
    }

    /// Metadata of every readable snapshot under the base directory.
    ///
    /// Entries that are not snapshots, or whose manifest cannot be read,
    /// are skipped.
    pub async fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SnapshotError::storage(
                    format!("read {}", self.base_dir.display()),
                    e,
                ))
            }
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotError::storage(format!("read {}", self.base_dir.display()), e))?
        {
            let path = entry.path();
            match read_metadata(&path).await {
                Ok(Some(metadata)) => snapshots.push(metadata),
                Ok(None) => {}
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        Ok(snapshots)
    }

    /// Remove a snapshot directory or archive.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        let file_type = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata.file_type(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::SnapshotNotFound(path.display().to_string()))
            }
            Err(e) => return Err(SnapshotError::storage(format!("stat {}", path.display()), e)),
        };

        let removed = if file_type.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        removed.map_err(|e| SnapshotError::storage(format!("delete {}", path.display()), e))?;

        info!("Deleted snapshot {}", path.display());
        Ok(())
    }
}

/// `<namespace|cluster>/<lowercase-kind>-<name>.json`
fn relative_path_for(info: &RecordInfo) -> String {
    let dir = if info.is_cluster_scoped() {
        CLUSTER_DIR
    } else {
        info.namespace.as_str()
    };
    format!(
        "{}/{}-{}.{}",
        dir,
        info.kind.to_lowercase(),
        info.name,
        RECORD_EXTENSION
    )
}

fn is_archive(path: &Path) -> bool {
    path.to_string_lossy().ends_with(ARCHIVE_SUFFIX)
}

fn parse_manifest(raw: &[u8], path: &Path) -> Result<SnapshotManifest> {
    serde_json::from_slice(raw).map_err(|e| SnapshotError::Manifest {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn validate_manifest(manifest: &SnapshotManifest, path: &Path) -> Result<()> {
    let metadata = &manifest.metadata;
    if !metadata.is_supported_format() {
        return Err(SnapshotError::UnsupportedFormat(metadata.format_version.clone()));
    }

    let invalid = |reason: String| SnapshotError::Manifest {
        path: path.display().to_string(),
        reason,
    };

    if manifest.records.len() != metadata.total_resources {
        return Err(invalid(format!(
            "lists {} records but totalResources is {}",
            manifest.records.len(),
            metadata.total_resources
        )));
    }

    let mut paths = HashSet::with_capacity(manifest.records.len());
    for info in &manifest.records {
        if !is_contained(&info.relative_path) {
            return Err(invalid(format!("record path {:?} leaves the snapshot", info.relative_path)));
        }
        if !paths.insert(info.relative_path.as_str()) {
            return Err(invalid(format!("record path {} is listed twice", info.relative_path)));
        }
    }
    Ok(())
}

/// Non-empty, relative, and free of `..`.
fn is_contained(relative_path: &str) -> bool {
    !relative_path.is_empty()
        && Path::new(relative_path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Metadata of a snapshot directory or archive; `None` for anything else.
async fn read_metadata(path: &Path) -> Result<Option<SnapshotMetadata>> {
    let file_type = tokio::fs::metadata(path)
        .await
        .map_err(|e| SnapshotError::storage(format!("stat {}", path.display()), e))?;

    let (raw, compressed) = if file_type.is_dir() {
        let raw = tokio::fs::read(path.join(MANIFEST_FILE_NAME))
            .await
            .map_err(|e| SnapshotError::storage("read manifest", e))?;
        (raw, false)
    } else if is_archive(path) {
        let archive_path = path.to_path_buf();
        let raw = tokio::task::spawn_blocking(move || archive::read_manifest(&archive_path))
            .await
            .map_err(|e| SnapshotError::storage("read archive manifest", io::Error::other(e)))?
            .map_err(|e| SnapshotError::storage("read archive manifest", e))?;
        (raw, true)
    } else {
        return Ok(None);
    };

    let mut manifest = parse_manifest(&raw, path)?;
    manifest.metadata.path = path.to_path_buf();
    manifest.metadata.compressed = compressed;
    Ok(Some(manifest.metadata))
}

/// Archive `dir` into `archive`, then remove `dir`. On failure the partial
/// archive is removed and `dir` is left in place.
async fn compress(dir: &Path, archive_path: &Path) -> Result<()> {
    let (src, dst) = (dir.to_path_buf(), archive_path.to_path_buf());
    let packed = tokio::task::spawn_blocking(move || archive::compress_dir(&src, &dst))
        .await
        .map_err(io::Error::other)
        .and_then(|result| result);

    match packed {
        Ok(files) => {
            debug!("Archived {} files into {}", files, archive_path.display());
        }
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(archive_path).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial archive {}: {}", archive_path.display(), cleanup);
                }
            }
            return Err(SnapshotError::storage(
                format!("compress {}", dir.display()),
                e,
            ));
        }
    }

    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|e| SnapshotError::storage(format!("remove {}", dir.display()), e))
}

/// Unpack an archive into a fresh scratch directory.
async fn unpack(archive_path: &Path) -> Result<TempDir> {
    if !archive_path.is_file() {
        return Err(SnapshotError::SnapshotNotFound(archive_path.display().to_string()));
    }

    let scratch = tempfile::Builder::new()
        .prefix("cluster-snapshot-")
        .tempdir()
        .map_err(|e| SnapshotError::storage("create scratch directory", e))?;

    let (src, dst) = (archive_path.to_path_buf(), scratch.path().to_path_buf());
    tokio::task::spawn_blocking(move || archive::extract(&src, &dst))
        .await
        .map_err(io::Error::other)
        .and_then(|result| result)
        .map_err(|e| SnapshotError::storage(format!("extract {}", archive_path.display()), e))?;

    Ok(scratch)
}
