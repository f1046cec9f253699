//! Data model shared by the collection, storage and replay paths.

pub mod kinds;
pub mod options;
pub mod progress;
pub mod record;
pub mod snapshot;

pub use kinds::{KindInfo, KindRegistry};
pub use options::{BackupOptions, RestoreOptions, Selection};
pub use progress::ProgressState;
pub use record::{IdentityKey, RecordInfo, ResourceRecord};
pub use snapshot::{SnapshotManifest, SnapshotMetadata, SortKey};
