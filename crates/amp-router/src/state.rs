//! Device addresses and per-session state

use std::fmt;
use std::str::FromStr;

use amp_protocol::{CodecStats, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

use crate::error::RouterError;
use crate::poll::PollStats;

/// Network address of one amplifier
///
/// Serialized as `host:port` so it can be used as a plain string in settings
/// files. Parsing accepts a bare host (default port), `host:port`, a bare IPv6
/// address and `[v6]:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress {
    /// Hostname or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address on the default amplifier port
    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_PORT)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for DeviceAddress {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || RouterError::InvalidAddress(s.to_string());
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)?,
            };
            return if host.is_empty() {
                Err(invalid())
            } else {
                Ok(Self::new(host, port))
            };
        }

        let (host, port) = match s.matches(':').count() {
            0 => (s, DEFAULT_PORT),
            1 => {
                let (host, port) = s.split_once(':').ok_or_else(invalid)?;
                (host, parse_port(port)?)
            }
            // Unbracketed IPv6 literal
            _ => (s, DEFAULT_PORT),
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

/// Identity of one session instance
///
/// A new id is issued every time the router opens a session, so events
/// from a session that has since been replaced can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not yet started
    #[default]
    Disconnected,
    /// TCP connect in progress
    Connecting,
    /// Connected and polling
    Connected,
    /// Connection lost or refused, waiting before the next attempt
    ReconnectWait,
    /// Closed by the owner; no further attempts
    Terminated,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectWait => "reconnect-wait",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Traffic counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames written to the device
    pub commands_sent: u64,
    /// Responses matched to the command in flight
    pub responses: u64,
    /// Commands that got no response before the deadline
    pub timeouts: u64,
    /// Responses from a different family than the command in flight
    pub mismatched: u64,
    /// Responses that arrived with no command in flight
    pub unsolicited: u64,
    /// Connection attempts after the first
    pub reconnects: u64,
    /// Decoder counters, carried across reconnects
    pub codec: CodecStats,
    /// Poll rotation and duplicate-suppression counters
    pub poll: PollStats,
}

/// Observable status of a session, published through a watch channel
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    pub stats: SessionStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "10.0.0.5".parse::<DeviceAddress>().unwrap(),
            DeviceAddress::new("10.0.0.5", DEFAULT_PORT)
        );
        assert_eq!(
            "amp-left.local:9000".parse::<DeviceAddress>().unwrap(),
            DeviceAddress::new("amp-left.local", 9000)
        );
        assert_eq!(
            "[fe80::1]:7000".parse::<DeviceAddress>().unwrap(),
            DeviceAddress::new("fe80::1", 7000)
        );
        assert_eq!(
            "::1".parse::<DeviceAddress>().unwrap(),
            DeviceAddress::new("::1", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", ":80", "host:port", "host:99999", "[::1", "[]:80", "a b"] {
            assert!(
                bad.parse::<DeviceAddress>().is_err(),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_display_roundtrips() {
        for addr in ["10.0.0.5:8234", "[::1]:8234", "amp:1"] {
            let parsed: DeviceAddress = addr.parse().unwrap();
            assert_eq!(parsed.to_string(), addr);
        }
    }

    #[test]
    fn test_serde_as_string() {
        let addr = DeviceAddress::new("10.0.0.7", 8234);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"10.0.0.7:8234\"");
        let back: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_stats_serialize_nested_counters() {
        let mut stats = SessionStats::default();
        stats.codec.resyncs = 2;
        stats.poll.suppressed = 5;
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["codec"]["resyncs"], 2);
        assert_eq!(json["codec"]["invalid_frames"], 0);
        assert_eq!(json["poll"]["suppressed"], 5);
        assert_eq!(json["poll"]["cycles"], 0);
    }
}
