//! Mirroring configuration.

use crate::error::{MirrorError, MirrorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a peer replayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Number of worker threads, i.e. directories synchronized in parallel.
    pub max_concurrent_directory_syncs: usize,
    /// Consecutive failures after which a directory is flagged as failed.
    pub max_consecutive_failures_per_directory: u64,
    /// Seconds a failed directory waits before it is picked again.
    pub retry_failed_directories_interval_secs: u64,
    /// Snapshots synchronized per directory per pick; 0 means no limit.
    pub max_snapshot_sync_per_cycle: u64,
    /// Pause between two picks of the same worker, in milliseconds.
    pub directory_scan_interval_ms: u64,
    /// Chunk size used when streaming file data to the peer.
    pub copy_buffer_size: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_directory_syncs: 3,
            max_consecutive_failures_per_directory: 10,
            retry_failed_directories_interval_secs: 60,
            max_snapshot_sync_per_cycle: 3,
            directory_scan_interval_ms: 10_000,
            copy_buffer_size: 64 * 1024,
        }
    }
}

impl MirrorConfig {
    /// Loads a config from a `.toml` or `.json` file and validates it.
    pub fn from_file(path: &Path) -> MirrorResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MirrorError::fs("read_config", path.display().to_string(), e))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MirrorConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| MirrorError::Config {
                msg: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| MirrorError::Config {
                msg: e.to_string(),
            })?,
            _ => {
                return Err(MirrorError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the replayer cannot run with.
    pub fn validate(&self) -> MirrorResult<()> {
        if self.max_concurrent_directory_syncs == 0 {
            return Err(MirrorError::Config {
                msg: "max_concurrent_directory_syncs must be at least 1".to_string(),
            });
        }
        if self.max_consecutive_failures_per_directory == 0 {
            return Err(MirrorError::Config {
                msg: "max_consecutive_failures_per_directory must be at least 1".to_string(),
            });
        }
        if self.copy_buffer_size == 0 {
            return Err(MirrorError::Config {
                msg: "copy_buffer_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Retry interval for failed directories.
    pub fn retry_failed_interval(&self) -> Duration {
        Duration::from_secs(self.retry_failed_directories_interval_secs)
    }

    /// Pause between picks.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.directory_scan_interval_ms)
    }
}
