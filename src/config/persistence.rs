//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_path() -> PathBuf {
    PathBuf::from("mqttdb.db")
}

fn default_autosave_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Enable snapshot persistence
    pub enabled: bool,

    /// Snapshot file path
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Save periodically (e.g., "30m"; "0s" disables timed saves)
    #[serde(default = "default_autosave_interval", with = "humantime_serde")]
    pub autosave_interval: Duration,

    /// Save after this many queued messages or retained changes (0 = off)
    pub autosave_on_changes: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_path(),
            autosave_interval: default_autosave_interval(),
            autosave_on_changes: 0,
        }
    }
}
