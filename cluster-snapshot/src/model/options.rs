//! Immutable operation options.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Which namespaces and kinds an operation touches.
///
/// Kind entries may be singular or plural, any case. Namespace entries
/// `""` and `"cluster"` stand for cluster-scoped objects.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub include_namespaces: BTreeSet<String>,
    pub exclude_namespaces: BTreeSet<String>,
    pub include_kinds: BTreeSet<String>,
    pub exclude_kinds: BTreeSet<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn exclude_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn include_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn exclude_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }
}

/// Backup job configuration
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub name: String,
    pub selection: Selection,

    /// Compress the snapshot into a single archive
    pub compress: bool,

    /// Upper bound on concurrently running collection tasks
    pub max_concurrent_partitions: usize,
}

impl BackupOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selection: Selection::default(),
            compress: false,
            max_concurrent_partitions: 8,
        }
    }
}

/// Restore job configuration
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Snapshot directory or archive; the newest snapshot when unset
    pub input: Option<PathBuf>,

    pub selection: Selection,

    /// Validate against the target without changing it
    pub dry_run: bool,

    /// Pause after each successful apply
    pub wait: bool,

    pub timeout: Duration,

    /// Upper bound for the post-apply pause regardless of `timeout`
    pub wait_ceiling: Duration,

    /// Replace objects that already exist instead of skipping them
    pub overwrite_existing: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            input: None,
            selection: Selection::default(),
            dry_run: false,
            wait: false,
            timeout: Duration::from_secs(300),
            wait_ceiling: Duration::from_secs(30),
            overwrite_existing: false,
        }
    }
}

impl RestoreOptions {
    /// The bounded post-apply pause.
    pub fn wait_duration(&self) -> Duration {
        self.timeout.min(self.wait_ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_builder() {
        let selection = Selection::new()
            .include_namespaces(["prod", "staging"])
            .exclude_kinds(vec!["secrets".to_string()]);
        assert_eq!(selection.include_namespaces.len(), 2);
        assert!(selection.exclude_kinds.contains("secrets"));
        assert!(selection.include_kinds.is_empty());
    }

    #[test]
    fn test_wait_duration_is_capped() {
        let options = RestoreOptions::default();
        assert_eq!(options.wait_duration(), Duration::from_secs(30));

        let short = RestoreOptions {
            timeout: Duration::from_secs(5),
            ..RestoreOptions::default()
        };
        assert_eq!(short.wait_duration(), Duration::from_secs(5));
    }
}
