//! Normalized command and response representation
//!
//! This module provides the `Command` and `Response` enums which describe
//! everything the controller can say to an amplifier and everything the
//! amplifier says back, independent of the byte layout in [`crate::frame`].

use std::fmt;

use crate::error::ParseError;

/// Number of physical channels per direction on one amplifier
pub const CHANNEL_COUNT: u8 = 4;

/// Wire type byte for input channels
pub const TYPE_INPUT: u8 = 0x01;
/// Wire type byte for output channels
pub const TYPE_OUTPUT: u8 = 0x02;

/// Returns true if `channel` is a valid physical channel number (1..=4)
pub fn is_valid_channel(channel: u8) -> bool {
    (1..=CHANNEL_COUNT).contains(&channel)
}

/// Direction of an amplifier channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChannelKind {
    /// Input (pre-DSP) channel
    Input,
    /// Output (amplified) channel
    Output,
}

impl ChannelKind {
    /// Both kinds, inputs first
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Input, ChannelKind::Output];

    /// Type byte used on the wire
    pub fn type_byte(self) -> u8 {
        match self {
            Self::Input => TYPE_INPUT,
            Self::Output => TYPE_OUTPUT,
        }
    }

    /// Parse a wire type byte
    pub fn from_type_byte(byte: u8) -> Result<Self, ParseError> {
        match byte {
            TYPE_INPUT => Ok(Self::Input),
            TYPE_OUTPUT => Ok(Self::Output),
            other => Err(ParseError::InvalidKind(other)),
        }
    }

    /// Lowercase name, as used in channel identifiers ("input", "output")
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a mute command or mute report refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MuteTarget {
    /// A single physical channel
    Channel { kind: ChannelKind, channel: u8 },
    /// Master mute (all outputs)
    Master,
}

impl MuteTarget {
    /// Shorthand for a per-channel target
    pub fn channel(kind: ChannelKind, channel: u8) -> Self {
        Self::Channel { kind, channel }
    }

    /// `(type, id)` bytes for this target. The master is addressed as output id 0.
    pub fn wire_fields(self) -> (u8, u8) {
        match self {
            Self::Channel { kind, channel } => (kind.type_byte(), channel),
            Self::Master => (TYPE_OUTPUT, 0),
        }
    }

    /// Decode `(type, id)` bytes
    pub fn from_wire_fields(type_byte: u8, id: u8) -> Result<Self, ParseError> {
        let kind = ChannelKind::from_type_byte(type_byte)?;
        match (kind, id) {
            (ChannelKind::Output, 0) => Ok(Self::Master),
            (_, id) if is_valid_channel(id) => Ok(Self::Channel { kind, channel: id }),
            (_, id) => Err(ParseError::InvalidChannel(id)),
        }
    }
}

impl fmt::Display for MuteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { kind, channel } => write!(f, "{}{}", kind, channel),
            Self::Master => f.write_str("master"),
        }
    }
}

/// Channel gain level in tenths of a dB
///
/// The wire carries a big-endian signed 16-bit value with one implied
/// decimal. Keeping the raw integer makes equality exact, which the
/// duplicate suppression in the poll cycle relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Level(pub i16);

impl Level {
    /// Create from the raw wire value (tenths of a dB)
    pub fn from_raw(raw: i16) -> Self {
        Self(raw)
    }

    /// Raw wire value
    pub fn raw(self) -> i16 {
        self.0
    }

    /// Value in dB
    pub fn db(self) -> f64 {
        f64::from(self.0) / 10.0
    }

    /// Nearest level to a dB value, saturating at the i16 range
    pub fn from_db(db: f64) -> Self {
        let tenths = (db * 10.0).round();
        Self(tenths.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16)
    }

    /// Big-endian wire bytes
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Decode big-endian wire bytes
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(i16::from_be_bytes(bytes))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} dB", self.db())
    }
}

/// Command family, identified by the function code byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Function {
    /// Mute read / set (0x03)
    Mute = 0x03,
    /// Gain level read (0x0E)
    Gain = 0x0E,
}

impl Function {
    /// Function code byte
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Function {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Self::Mute),
            0x0E => Ok(Self::Gain),
            other => Err(ParseError::UnknownFunction(other)),
        }
    }
}

/// Command sent from the controller to an amplifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    /// Read the current level of one channel
    ReadGain { kind: ChannelKind, channel: u8 },
    /// Read the mute state of a channel or the master
    ReadMute { target: MuteTarget },
    /// Set the mute state of a channel or the master
    SetMute { target: MuteTarget, muted: bool },
}

impl Command {
    /// Family this command belongs to; the matching response carries the same function code
    pub fn function(&self) -> Function {
        match self {
            Self::ReadGain { .. } => Function::Gain,
            Self::ReadMute { .. } | Self::SetMute { .. } => Function::Mute,
        }
    }

    /// Returns true if this is a query (read) command
    pub fn is_query(&self) -> bool {
        matches!(self, Self::ReadGain { .. } | Self::ReadMute { .. })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadGain { kind, channel } => write!(f, "read gain {}{}", kind, channel),
            Self::ReadMute { target } => write!(f, "read mute {}", target),
            Self::SetMute { target, muted } => {
                write!(f, "{} {}", if *muted { "mute" } else { "unmute" }, target)
            }
        }
    }
}

/// Response sent from an amplifier to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Response {
    /// Current level of one channel
    Gain {
        kind: ChannelKind,
        channel: u8,
        level: Level,
    },
    /// Resulting mute state of a channel or the master
    Mute { target: MuteTarget, muted: bool },
}

impl Response {
    /// Family this response belongs to
    pub fn function(&self) -> Function {
        match self {
            Self::Gain { .. } => Function::Gain,
            Self::Mute { .. } => Function::Mute,
        }
    }

    /// Returns true if this response can answer `cmd`
    pub fn answers(&self, cmd: &Command) -> bool {
        self.function() == cmd.function()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_db_scale() {
        assert_eq!(Level::from_raw(-123).db(), -12.3);
        assert_eq!(Level::from_raw(0).db(), 0.0);
        assert_eq!(Level::from_raw(55).db(), 5.5);
        assert_eq!(Level::from_db(-12.3), Level::from_raw(-123));
        assert_eq!(Level::from_db(1.0e9), Level::from_raw(i16::MAX));
    }

    #[test]
    fn test_level_display() {
        assert_eq!(Level::from_raw(-605).to_string(), "-60.5 dB");
    }

    #[test]
    fn test_mute_target_wire_fields() {
        assert_eq!(MuteTarget::Master.wire_fields(), (TYPE_OUTPUT, 0));
        assert_eq!(
            MuteTarget::channel(ChannelKind::Input, 3).wire_fields(),
            (TYPE_INPUT, 3)
        );
        assert_eq!(
            MuteTarget::from_wire_fields(TYPE_OUTPUT, 0),
            Ok(MuteTarget::Master)
        );
        assert_eq!(
            MuteTarget::from_wire_fields(TYPE_INPUT, 0),
            Err(ParseError::InvalidChannel(0))
        );
        assert_eq!(
            MuteTarget::from_wire_fields(0x07, 1),
            Err(ParseError::InvalidKind(0x07))
        );
    }

    #[test]
    fn test_response_answers_family() {
        let read = Command::ReadGain {
            kind: ChannelKind::Output,
            channel: 2,
        };
        let gain = Response::Gain {
            kind: ChannelKind::Output,
            channel: 2,
            level: Level(-10),
        };
        let mute = Response::Mute {
            target: MuteTarget::Master,
            muted: true,
        };
        assert!(gain.answers(&read));
        assert!(!mute.answers(&read));
        assert!(mute.answers(&Command::SetMute {
            target: MuteTarget::Master,
            muted: false
        }));
    }
}
