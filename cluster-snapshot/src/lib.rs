//! Cluster Snapshot Library
//!
//! Captures the resources of a Kubernetes cluster into a versioned on-disk
//! snapshot and replays snapshots into a target cluster in dependency order.

pub mod applier;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod daemon;
pub mod filter;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod sequencer;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use cluster::{ApiError, InMemoryApi, KubeHttpApi, ResourceApi};
pub use config::Config;
pub use model::{
    BackupOptions, KindRegistry, ProgressState, RestoreOptions, Selection, SnapshotMetadata,
    SortKey,
};
pub use orchestrator::{RestoreResult, Snapshotter};
pub use storage::SnapshotStore;
pub use utils::errors::{Result, SnapshotError};
