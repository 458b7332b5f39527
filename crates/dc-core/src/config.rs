//! Backend configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which eviction policy the backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionKind {
    /// One LRU list; victims are deleted outright.
    Classic,
    /// Reuse-aware lists with a deleted list for refetch detection.
    #[default]
    Tiered,
}

/// Behaviour switches, mostly for tests and tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendFlags {
    /// A restart after a critical error leaves the backend disabled instead
    /// of recreating the files.
    pub unit_test_mode: bool,
    /// Let closes that leave the cache over its limit trim without waiting
    /// for the backend to warm up. Size growth always trims at once.
    pub no_random: bool,
    /// Never report the backend as loaded, so trimming is never deferred.
    pub no_load_protection: bool,
    /// Keep write buffers at their initial 16 KiB.
    pub no_buffering: bool,
    /// Open the files as they are, without bumping the run id or marking
    /// the crash flag. Used by the diagnostics tool.
    pub upgrade_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Cache directory. Created on init when missing.
    pub path: PathBuf,
    /// Size limit in bytes; 0 picks one from `available_space`.
    pub max_size: i64,
    /// Index mask override; 0 uses the whole table.
    pub mask: u32,
    pub eviction: EvictionKind,
    pub flags: BackendFlags,
    /// Period of the stats timer.
    pub stats_interval_ms: u64,
    /// Consecutive I/O failures that disable the backend.
    pub max_io_errors: u32,
    /// Free bytes on the cache volume, used to size an automatic cache.
    /// Unknown space falls back to the default size.
    pub available_space: Option<i64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            max_size: 0,
            mask: 0,
            eviction: EvictionKind::default(),
            flags: BackendFlags::default(),
            stats_interval_ms: 30_000,
            max_io_errors: 5,
            available_space: None,
        }
    }
}

impl BackendConfig {
    /// Configuration for a cache rooted at `path`, everything else default.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    #[must_use]
    pub fn is_tiered(&self) -> bool {
        self.eviction == EvictionKind::Tiered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BackendConfig::default();
        assert_eq!(config.max_size, 0);
        assert_eq!(config.stats_interval(), Duration::from_secs(30));
        assert_eq!(config.max_io_errors, 5);
        assert!(config.is_tiered());
        assert!(!config.flags.no_buffering);
    }

    #[test]
    fn partial_configs_deserialize_with_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"path":"/tmp/c","eviction":"classic","flags":{"no_random":true}}"#)
                .expect("parse");
        assert_eq!(config.path, PathBuf::from("/tmp/c"));
        assert_eq!(config.eviction, EvictionKind::Classic);
        assert!(config.flags.no_random);
        assert!(!config.flags.unit_test_mode);
        assert_eq!(config.stats_interval_ms, 30_000);
    }
}
