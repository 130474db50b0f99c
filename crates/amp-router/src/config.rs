//! Session and router configuration

use std::time::Duration;

use amp_protocol::frame::DEFAULT_MAX_BUFFER_LEN;
use serde::{Deserialize, Serialize};

/// Timing and buffering for one device session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between poll queries (ms); one query is sent per tick
    pub poll_interval_ms: u64,
    /// How long to wait for a response before releasing the line (ms)
    pub response_timeout_ms: u64,
    /// TCP connect timeout (ms)
    pub connect_timeout_ms: u64,
    /// First reconnect delay (ms)
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap (ms)
    pub reconnect_max_ms: u64,
    /// Receive buffer cap before the decoder discards everything
    pub max_buffer_len: usize,
    /// Commands that may wait for a free line
    pub command_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            response_timeout_ms: 300,
            connect_timeout_ms: 2_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
            command_queue: 32,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms))
    }
}

/// Router actor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Settings applied to every device session
    pub session: SessionConfig,
    /// Capacity of the outbound event broadcast
    pub event_capacity: usize,
    /// Capacity of the control command queue
    pub command_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            event_capacity: 256,
            command_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RouterConfig =
            serde_json::from_str(r#"{"session": {"poll_interval_ms": 250}}"#).unwrap();
        assert_eq!(config.session.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.session.response_timeout_ms, 300);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_reconnect_cap_never_below_base() {
        let config = SessionConfig {
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 10,
            ..Default::default()
        };
        assert_eq!(config.reconnect_max(), Duration::from_secs(1));
    }
}
