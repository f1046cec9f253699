//! Operation progress reporting.
//!
//! The orchestrator driving an operation owns the `ProgressState` and hands
//! callbacks a shared reference after every change.

use crate::utils::SnapshotError;

/// Progress of a backup or restore
#[derive(Debug, Default)]
pub struct ProgressState {
    /// Work items expected (an estimate while collecting)
    pub total: usize,

    /// Work items done so far; never decreases
    pub completed: usize,

    pub current_message: String,

    /// Per-record problems seen so far
    pub warnings: Vec<SnapshotError>,
}

impl ProgressState {
    pub fn new(total: usize, message: impl Into<String>) -> Self {
        Self {
            total,
            completed: 0,
            current_message: message.into(),
            warnings: Vec::new(),
        }
    }

    /// Advance to `completed`. Lower values are ignored.
    pub fn advance_to(&mut self, completed: usize, message: impl Into<String>) {
        self.completed = self.completed.max(completed);
        if self.completed > self.total {
            self.total = self.completed;
        }
        self.current_message = message.into();
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.current_message = message.into();
    }

    pub fn warn(&mut self, warning: SnapshotError) {
        self.warnings.push(warning);
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    /// Percentage complete (0-100)
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.completed as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format a duration given in milliseconds
pub fn format_duration_ms(millis: u128) -> String {
    let seconds = (millis / 1000) as u64;
    if seconds == 0 {
        format!("{}ms", millis)
    } else if seconds < 60 {
        format!("{}.{}s", seconds, (millis % 1000) / 100)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
