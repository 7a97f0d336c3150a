//! Configuration file support.
//!
//! ```toml
//! copy_poll_interval_ms = 500
//! process_poll_interval_ms = 200
//! call_timeout_ms = 5000
//! working_dir = "/var/tmp/orbit"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use orbit_bridge::BridgeConfig;
use serde::Deserialize;

/// Bridge settings as written in a TOML file. Anything left out keeps its
/// default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub copy_poll_interval_ms: Option<u64>,
    pub process_poll_interval_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub working_dir: Option<PathBuf>,
    pub watch: Option<bool>,
    pub event_capacity: Option<usize>,
}

impl ConfigFile {
    /// Parse a configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid configuration")
    }

    /// Apply the file's settings on top of the defaults.
    pub fn into_bridge_config(self) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        if let Some(ms) = self.copy_poll_interval_ms {
            config = config.with_copy_poll_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.process_poll_interval_ms {
            config = config.with_process_poll_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config = config.with_handshake_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.call_timeout_ms {
            config = config.with_call_timeout(Some(Duration::from_millis(ms)));
        }
        if let Some(dir) = self.working_dir {
            config = config.with_working_dir(dir);
        }
        if let Some(watch) = self.watch {
            config = config.with_watch(watch);
        }
        if let Some(capacity) = self.event_capacity {
            config = config.with_event_capacity(capacity);
        }
        config
    }
}

/// Load the bridge configuration, falling back to defaults without a file.
pub fn load(path: Option<&Path>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        return Ok(BridgeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let file = ConfigFile::parse(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(file.into_bridge_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ConfigFile::parse(
            r#"
            copy_poll_interval_ms = 250
            call_timeout_ms = 1500
            watch = false
        "#,
        )
        .unwrap()
        .into_bridge_config();

        assert_eq!(config.copy_poll_interval, Duration::from_millis(250));
        assert_eq!(config.call_timeout, Some(Duration::from_millis(1500)));
        assert!(!config.watch);
        assert_eq!(config.process_poll_interval, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(ConfigFile::parse("poll = 3").is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orbit.toml");
        std::fs::write(&path, "event_capacity = 4\nworking_dir = \"/tmp/orbit\"\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.event_capacity, 4);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp/orbit")));

        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
        assert!(load(None).unwrap().watch);
    }
}
