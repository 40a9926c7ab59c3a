//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forwarding::ForwardingRecord;

/// Current forwards.json version
pub const FORWARDS_VERSION: u32 = 1;

/// On-disk form of the forwarding registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardFile {
    pub version: u32,
    #[serde(default)]
    pub forwards: Vec<ForwardingRecord>,
}

impl Default for ForwardFile {
    fn default() -> Self {
        Self {
            version: FORWARDS_VERSION,
            forwards: Vec::new(),
        }
    }
}

/// Tunables for sessions and forwarding engines (settings.json)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingSettings {
    /// How long `stop` waits for in-flight connections before force-closing
    pub drain_timeout_ms: u64,
    /// A spliced connection with no traffic either way for this long is closed
    pub idle_timeout_secs: u64,
    /// Upper bound for one remote command (port discovery)
    pub command_timeout_secs: u64,
    /// SSH keepalive interval, 0 disables keepalives
    pub keepalive_interval_secs: u64,
    /// Missed keepalives before the session is declared dead
    pub keepalive_max: usize,
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 3000,
            idle_timeout_secs: 300,
            command_timeout_secs: 10,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
        }
    }
}

impl ForwardingSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: ForwardingSettings =
            serde_json::from_str(r#"{"drain_timeout_ms": 500}"#).unwrap();
        assert_eq!(settings.drain_timeout(), Duration::from_millis(500));
        assert_eq!(settings.idle_timeout_secs, 300);
        assert_eq!(settings.keepalive_max, 3);
    }

    #[test]
    fn test_zero_keepalive_disables() {
        let settings = ForwardingSettings {
            keepalive_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.keepalive_interval(), None);
        assert_eq!(
            ForwardingSettings::default().keepalive_interval(),
            Some(Duration::from_secs(30))
        );
    }
}
