//! Hub configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the room hub.
///
/// Loaded from the `[hub]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,

    /// Minimum seconds between two slow-consumer warnings for one connection.
    pub slow_consumer_window_secs: u64,

    /// Close connections with no inbound frame for this long (0 = never).
    pub idle_timeout_secs: u64,

    /// Interval between keepalive pings written to every connection (0 = never).
    pub ping_interval_secs: u64,

    /// Create rooms on first join. When false, a room must already be live
    /// or known to the directory.
    pub auto_create_rooms: bool,

    /// Interval of the empty-room reaper (0 = only on explicit trigger).
    pub reap_interval_secs: u64,

    /// Upper bound on live rooms. Unlimited when unset.
    pub max_rooms: Option<usize>,

    /// Tell room members when someone joins or leaves.
    pub announce_membership: bool,

    /// Buffer size of the hub event channel.
    pub event_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            slow_consumer_window_secs: 10,
            idle_timeout_secs: 300,
            ping_interval_secs: 30,
            auto_create_rooms: true,
            reap_interval_secs: 60,
            max_rooms: None,
            announce_membership: true,
            event_buffer: 256,
        }
    }
}

impl HubConfig {
    pub fn slow_consumer_window(&self) -> Duration {
        Duration::from_secs(self.slow_consumer_window_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        non_zero_secs(self.ping_interval_secs)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        non_zero_secs(self.reap_interval_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outbound_capacity == 0 {
            anyhow::bail!("hub.outbound_capacity must be at least 1");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("hub.event_buffer must be at least 1");
        }
        if self.max_rooms == Some(0) {
            anyhow::bail!("hub.max_rooms must be at least 1 when set");
        }
        Ok(())
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then_some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.outbound_capacity, 64);
        assert!(config.auto_create_rooms);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_disables_timers() {
        let config = HubConfig {
            idle_timeout_secs: 0,
            ping_interval_secs: 0,
            reap_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.ping_interval(), None);
        assert_eq!(config.reap_interval(), None);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = HubConfig {
            outbound_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HubConfig = toml::from_str("auto_create_rooms = false\n").unwrap();
        assert!(!config.auto_create_rooms);
        assert_eq!(config.outbound_capacity, 64);
    }
}
