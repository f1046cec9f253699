//! Snapshot metadata and the manifest document stored at a snapshot root.

use crate::model::record::RecordInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current on-disk format.
pub const FORMAT_VERSION: &str = "v1";

/// Formats this build can read.
pub const SUPPORTED_FORMAT_VERSIONS: &[&str] = &[FORMAT_VERSION];

/// File name of the manifest at the snapshot root.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Extension of every stored resource file.
pub const RECORD_EXTENSION: &str = "json";

/// Suffix of compressed snapshots.
pub const ARCHIVE_SUFFIX: &str = ".tar.zst";

/// Directory used for cluster-scoped records.
pub const CLUSTER_DIR: &str = "cluster";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub format_version: String,

    /// Version string reported by the source API server
    pub source_system_version: String,

    /// Sorted, de-duplicated
    pub namespaces: Vec<String>,

    /// Sorted, de-duplicated plural kind names
    pub kinds: Vec<String>,

    pub total_resources: usize,

    /// Sum of stored content lengths
    pub size_bytes: u64,

    pub compressed: bool,

    /// Final location: snapshot directory or archive file
    #[serde(default)]
    pub path: PathBuf,
}

impl SnapshotMetadata {
    /// Metadata for a snapshot about to be saved; counts are filled in by the store.
    pub fn new(name: impl Into<String>, source_system_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            format_version: FORMAT_VERSION.to_string(),
            source_system_version: source_system_version.into(),
            namespaces: Vec::new(),
            kinds: Vec::new(),
            total_resources: 0,
            size_bytes: 0,
            compressed: false,
            path: PathBuf::new(),
        }
    }

    pub fn is_supported_format(&self) -> bool {
        SUPPORTED_FORMAT_VERSIONS.contains(&self.format_version.as_str())
    }
}

/// Serialized as `manifest.json` at the snapshot root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub metadata: SnapshotMetadata,

    /// Write order, not replay order
    pub records: Vec<RecordInfo>,
}

/// How `list` results are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    /// Newest first
    #[default]
    Timestamp,
    Name,
    /// Largest first
    Size,
    /// Most resources first
    Resources,
}

impl std::str::FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" | "time" | "date" => Ok(SortKey::Timestamp),
            "name" => Ok(SortKey::Name),
            "size" => Ok(SortKey::Size),
            "resources" | "count" => Ok(SortKey::Resources),
            other => Err(format!(
                "unknown sort key '{other}' (expected timestamp, name, size or resources)"
            )),
        }
    }
}

/// Sort snapshot metadata in place.
pub fn sort_snapshots(snapshots: &mut [SnapshotMetadata], key: SortKey) {
    match key {
        SortKey::Timestamp => snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        SortKey::Name => snapshots.sort_by(|a, b| a.name.cmp(&b.name)),
        SortKey::Size => snapshots.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes)),
        SortKey::Resources => {
            snapshots.sort_by(|a, b| b.total_resources.cmp(&a.total_resources))
        }
    }
}
