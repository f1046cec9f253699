//! Dependency-safe replay ordering.

use crate::model::{KindRegistry, ResourceRecord};

/// Order records for replay: by kind tier, then namespace, name and kind.
///
/// Kind is the last key because unknown kinds share a tier. With it the
/// comparison is total over identity keys, so any permutation of the same
/// records yields the same sequence.
pub fn order(mut records: Vec<ResourceRecord>, registry: &KindRegistry) -> Vec<ResourceRecord> {
    records.sort_by(|a, b| {
        registry
            .tier(&a.info.kind)
            .cmp(&registry.tier(&b.info.kind))
            .then_with(|| a.info.namespace.cmp(&b.info.namespace))
            .then_with(|| a.info.name.cmp(&b.info.name))
            .then_with(|| a.info.kind.cmp(&b.info.kind))
    });
    records
}
