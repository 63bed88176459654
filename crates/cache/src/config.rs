use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAINTENANCE_POLL_MS: u64 = 500;
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 2_000;

/// Runtime settings for a [`crate::Library`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// How long the maintenance bot sleeps on an empty queue before checking
    /// whether its library is still alive.
    pub maintenance_poll_ms: u64,
    /// Pause between metadata backups.
    pub backup_interval_ms: u64,
    /// Item tables whose rows are deleted as soon as their last link goes.
    pub auto_clean_tables: Vec<String>,
    /// Merge items whose names differ only by case when one is dirtied.
    pub merge_case_duplicates: bool,
    /// Start the maintenance bot and backup threads on open.
    pub start_workers: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            maintenance_poll_ms: DEFAULT_MAINTENANCE_POLL_MS,
            backup_interval_ms: DEFAULT_BACKUP_INTERVAL_MS,
            auto_clean_tables: vec!["tags".to_string(), "publishers".to_string()],
            merge_case_duplicates: true,
            start_workers: true,
        }
    }
}

impl LibraryConfig {
    /// Settings for synchronous use: no background threads.
    pub fn manual() -> Self {
        Self {
            start_workers: false,
            ..Self::default()
        }
    }

    pub fn maintenance_poll(&self) -> Duration {
        Duration::from_millis(self.maintenance_poll_ms)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    pub fn auto_cleans(&self, table: &str) -> bool {
        self.auto_clean_tables.iter().any(|t| t == table)
    }
}
