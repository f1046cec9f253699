//! Utility modules for cluster-snapshot.

pub mod errors;
pub mod logger;

pub use errors::{Result, SnapshotError};
