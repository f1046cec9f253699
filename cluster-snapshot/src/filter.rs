//! Namespace and kind selection.

use crate::model::{KindRegistry, RecordInfo, Selection};
use std::collections::BTreeSet;

/// Namespace tokens that stand for cluster-scoped objects.
const CLUSTER_TOKENS: &[&str] = &["", "cluster"];

/// Decides whether a (namespace, kind) pair takes part in an operation.
///
/// Exclusions are checked first and always win. A non-empty include set
/// admits only what it names; cluster-scoped objects are named by `""` or
/// `"cluster"` rather than by any namespace.
#[derive(Debug, Clone)]
pub struct Filter {
    include_namespaces: BTreeSet<String>,
    exclude_namespaces: BTreeSet<String>,
    include_kinds: BTreeSet<String>,
    exclude_kinds: BTreeSet<String>,
}

impl Filter {
    pub fn new(selection: &Selection) -> Self {
        let lower = |set: &BTreeSet<String>| set.iter().map(|s| s.trim().to_lowercase()).collect();
        Self {
            include_namespaces: selection.include_namespaces.clone(),
            exclude_namespaces: selection.exclude_namespaces.clone(),
            include_kinds: lower(&selection.include_kinds),
            exclude_kinds: lower(&selection.exclude_kinds),
        }
    }

    pub fn includes_record(&self, record: &RecordInfo, registry: &KindRegistry) -> bool {
        self.includes(&record.namespace, &record.kind, registry)
    }

    pub fn includes(&self, namespace: &str, kind: &str, registry: &KindRegistry) -> bool {
        self.includes_namespace(namespace) && self.includes_kind(kind, registry)
    }

    /// Namespace policy alone; `""` means cluster scope.
    pub fn includes_namespace(&self, namespace: &str) -> bool {
        if namespace_matches(&self.exclude_namespaces, namespace) {
            return false;
        }
        self.include_namespaces.is_empty()
            || namespace_matches(&self.include_namespaces, namespace)
    }

    /// Kind policy alone; `kind` is the CamelCase kind name.
    pub fn includes_kind(&self, kind: &str, registry: &KindRegistry) -> bool {
        let singular = kind.to_lowercase();
        let plural = registry.plural(&singular);
        let named = |set: &BTreeSet<String>| set.contains(&singular) || set.contains(&plural);

        if named(&self.exclude_kinds) {
            return false;
        }
        self.include_kinds.is_empty() || named(&self.include_kinds)
    }

    /// True when the include set names `kind` explicitly.
    pub fn names_kind(&self, kind: &str, registry: &KindRegistry) -> bool {
        let singular = kind.to_lowercase();
        self.include_kinds.contains(&singular)
            || self.include_kinds.contains(&registry.plural(&singular))
    }

    /// True when the exclude set names the cluster scope.
    pub fn excludes_cluster_scope(&self) -> bool {
        namespace_matches(&self.exclude_namespaces, "")
    }

    pub fn has_namespace_includes(&self) -> bool {
        !self.include_namespaces.is_empty()
    }

    /// Explicitly included namespaces, without the cluster tokens.
    pub fn included_namespaces(&self) -> impl Iterator<Item = &str> {
        self.include_namespaces
            .iter()
            .map(String::as_str)
            .filter(|ns| !CLUSTER_TOKENS.contains(ns))
    }
}

fn namespace_matches(set: &BTreeSet<String>, namespace: &str) -> bool {
    if namespace.is_empty() {
        CLUSTER_TOKENS.iter().any(|token| set.contains(*token))
    } else {
        set.contains(namespace)
    }
}
