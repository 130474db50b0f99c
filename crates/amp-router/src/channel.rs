//! Display channels
//!
//! The router presents a fixed set of eight logical channels (`input1..4`,
//! `output1..4`). Each display channel is backed by one physical channel on
//! one amplifier, chosen by the [`crate::assignment::AssignmentTable`].

use std::fmt;
use std::str::FromStr;

use amp_protocol::{is_valid_channel, ChannelKind, CHANNEL_COUNT};
use serde::{Deserialize, Serialize};

use crate::error::RouterError;

/// One of the eight logical channels shown to clients
///
/// Serialized as its identifier (`"input1"`, `"output4"`) so it can key a JSON map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayChannel {
    pub kind: ChannelKind,
    /// 1-based index within the kind
    pub index: u8,
}

impl DisplayChannel {
    /// Every display channel, inputs first
    pub const ALL: [DisplayChannel; 8] = [
        Self::input(1),
        Self::input(2),
        Self::input(3),
        Self::input(4),
        Self::output(1),
        Self::output(2),
        Self::output(3),
        Self::output(4),
    ];

    /// Validated constructor
    pub fn new(kind: ChannelKind, index: u8) -> Result<Self, RouterError> {
        let channel = Self { kind, index };
        if channel.is_valid() {
            Ok(channel)
        } else {
            Err(RouterError::InvalidChannel(format!("{kind}{index}")))
        }
    }

    /// Input display channel; `index` is not range checked
    pub const fn input(index: u8) -> Self {
        Self {
            kind: ChannelKind::Input,
            index,
        }
    }

    /// Output display channel; `index` is not range checked
    pub const fn output(index: u8) -> Self {
        Self {
            kind: ChannelKind::Output,
            index,
        }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_channel(self.index)
    }

    /// Identifier used by clients and settings files
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DisplayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.index)
    }
}

impl FromStr for DisplayChannel {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let invalid = || RouterError::InvalidChannel(s.to_string());

        let (kind, digits) = [
            ("input", ChannelKind::Input),
            ("output", ChannelKind::Output),
            ("in", ChannelKind::Input),
            ("out", ChannelKind::Output),
        ]
        .into_iter()
        .find_map(|(prefix, kind)| lower.strip_prefix(prefix).map(|rest| (kind, rest)))
        .ok_or_else(invalid)?;

        let index: u8 = digits.parse().map_err(|_| invalid())?;
        if !(1..=CHANNEL_COUNT).contains(&index) {
            return Err(invalid());
        }
        Ok(Self { kind, index })
    }
}

impl TryFrom<String> for DisplayChannel {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DisplayChannel> for String {
    fn from(channel: DisplayChannel) -> Self {
        channel.to_string()
    }
}

/// Target of a mute report published to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteSlot {
    /// A display channel
    Channel(DisplayChannel),
    /// Master mute of the default device
    Master,
}

impl fmt::Display for MuteSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(channel) => channel.fmt(f),
            Self::Master => f.write_str("master"),
        }
    }
}
