//! Event types for sessions and the router
//!
//! Sessions report to the router over an mpsc channel with [`SessionEvent`].
//! The router re-publishes what survives ownership filtering to any number of
//! subscribers as [`RouterEvent`] over a broadcast channel.

use std::time::SystemTime;

use amp_protocol::{ChannelKind, Level, MuteTarget};
use serde::Serialize;

use crate::channel::{DisplayChannel, MuteSlot};
use crate::state::{DeviceAddress, SessionId, SessionState};

/// A deduplicated reading from one device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Gain of a physical channel changed (or was seen for the first time)
    Gain {
        kind: ChannelKind,
        channel: u8,
        level: Level,
        at: SystemTime,
    },
    /// Mute state of a physical channel or the master changed
    Mute {
        target: MuteTarget,
        muted: bool,
        at: SystemTime,
    },
}

/// What happened in a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// TCP connection established
    Connected,
    /// An established connection was lost
    Disconnected { reason: String },
    /// New reading
    Sample(Sample),
    /// Transient failure (connect refused, write error)
    Error(String),
}

/// Report from one session to the router
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Session instance that produced the event
    pub id: SessionId,
    /// Device the session talks to
    pub address: DeviceAddress,
    pub kind: SessionEventKind,
}

/// Event published by the router to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    // -------------------------------------------------------------------------
    // Connection status
    // -------------------------------------------------------------------------
    /// A device connected or disconnected
    Status {
        connected: bool,
        address: DeviceAddress,
    },

    /// A device session changed lifecycle state
    SessionState {
        address: DeviceAddress,
        state: SessionState,
    },

    // -------------------------------------------------------------------------
    // Readings
    // -------------------------------------------------------------------------
    /// Gain of a display channel
    ChannelSample {
        channel: DisplayChannel,
        level: Level,
        at: SystemTime,
    },

    /// Mute state of a display channel or the master
    MuteSample {
        slot: MuteSlot,
        muted: bool,
        at: SystemTime,
    },

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------
    /// Transient error from a device session
    Error { source: String, message: String },
}

impl RouterEvent {
    /// Returns true if this is a channel or mute reading
    pub fn is_sample(&self) -> bool {
        matches!(
            self,
            RouterEvent::ChannelSample { .. } | RouterEvent::MuteSample { .. }
        )
    }

    /// Returns true if this is a connection or session lifecycle event
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            RouterEvent::Status { .. } | RouterEvent::SessionState { .. }
        )
    }

    /// Display channel this event refers to, if any
    pub fn display_channel(&self) -> Option<DisplayChannel> {
        match self {
            RouterEvent::ChannelSample { channel, .. } => Some(*channel),
            RouterEvent::MuteSample {
                slot: MuteSlot::Channel(channel),
                ..
            } => Some(*channel),
            _ => None,
        }
    }
}
