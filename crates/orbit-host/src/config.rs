//! Configuration for loaded extensions.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an [`ExtensionProcess`](crate::ExtensionProcess).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interval between file-size samples while an overwrite is in progress.
    ///
    /// A reload starts once two consecutive samples agree.
    pub copy_poll_interval: Duration,

    /// Interval between child liveness checks.
    pub process_poll_interval: Duration,

    /// How long a freshly spawned child may take to send its handshake.
    pub handshake_timeout: Duration,

    /// Upper bound on a single call, including the memory traffic it causes.
    ///
    /// `None` waits for as long as the extension takes.
    pub call_timeout: Option<Duration>,

    /// Directory for the working copy of the binary.
    ///
    /// Defaults to the system temporary directory.
    pub working_dir: Option<PathBuf>,

    /// Whether loading starts the hot-reload watcher.
    pub watch: bool,

    /// Capacity of each event subscription channel.
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            copy_poll_interval: Duration::from_secs(3),
            process_poll_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            call_timeout: None,
            working_dir: None,
            watch: true,
            event_capacity: 16,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the copy-stability poll interval.
    pub fn with_copy_poll_interval(mut self, interval: Duration) -> Self {
        self.copy_poll_interval = interval;
        self
    }

    /// Set the liveness poll interval.
    pub fn with_process_poll_interval(mut self, interval: Duration) -> Self {
        self.process_poll_interval = interval;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the directory holding the working copy.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Enable or disable the hot-reload watcher.
    pub fn with_watch(mut self, enabled: bool) -> Self {
        self.watch = enabled;
        self
    }

    /// Set the capacity of event subscription channels.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// A configuration that reacts to changes within a fraction of a second.
    ///
    /// Suited to development loops where extensions are rebuilt often.
    pub fn responsive() -> Self {
        Self {
            copy_poll_interval: Duration::from_millis(250),
            process_poll_interval: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
            call_timeout: None,
            working_dir: None,
            watch: true,
            event_capacity: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.copy_poll_interval, Duration::from_secs(3));
        assert!(config.watch);
        assert!(config.call_timeout.is_none());
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new()
            .with_copy_poll_interval(Duration::from_millis(10))
            .with_call_timeout(Some(Duration::from_secs(1)))
            .with_watch(false)
            .with_event_capacity(0);

        assert_eq!(config.copy_poll_interval, Duration::from_millis(10));
        assert_eq!(config.call_timeout, Some(Duration::from_secs(1)));
        assert!(!config.watch);
        assert_eq!(config.event_capacity, 1);
    }

    #[test]
    fn test_responsive_is_faster() {
        let fast = BridgeConfig::responsive();
        let default = BridgeConfig::default();
        assert!(fast.copy_poll_interval < default.copy_poll_interval);
        assert!(fast.process_poll_interval < default.process_poll_interval);
    }
}
