//! Mute command gateway
//!
//! Translates a client mute request (kind, display id, state) into a
//! protocol command for the device that owns the target.

use std::fmt;
use std::str::FromStr;

use amp_protocol::{is_valid_channel, ChannelKind, Command, MuteTarget};
use serde::{Deserialize, Serialize};

use crate::assignment::AssignmentTable;
use crate::channel::{DisplayChannel, MuteSlot};
use crate::error::RouterError;
use crate::state::DeviceAddress;

/// Which mute a client wants to change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MuteKind {
    /// One input display channel
    Input,
    /// One output display channel
    Output,
    /// The master mute on the default device
    AllOutput,
}

impl fmt::Display for MuteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::AllOutput => "all-output",
        })
    }
}

impl FromStr for MuteKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" | "in" => Ok(Self::Input),
            "output" | "out" => Ok(Self::Output),
            "all-output" | "all" | "master" => Ok(Self::AllOutput),
            _ => Err(RouterError::InvalidChannel(format!("unknown mute kind {s:?}"))),
        }
    }
}

/// A client's request to mute or unmute something
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRequest {
    pub kind: MuteKind,
    /// Display index (1..=4); ignored for `AllOutput`
    #[serde(default)]
    pub id: u8,
    pub muted: bool,
}

/// Resolved destination of a mute request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteRoute {
    pub address: DeviceAddress,
    pub slot: MuteSlot,
    pub command: Command,
}

impl MuteRequest {
    pub fn new(kind: MuteKind, id: u8, muted: bool) -> Self {
        Self { kind, id, muted }
    }

    /// Master mute request
    pub fn master(muted: bool) -> Self {
        Self::new(MuteKind::AllOutput, 0, muted)
    }

    /// Display slot this request targets
    pub fn slot(&self) -> Result<MuteSlot, RouterError> {
        let kind = match self.kind {
            MuteKind::AllOutput => return Ok(MuteSlot::Master),
            MuteKind::Input => ChannelKind::Input,
            MuteKind::Output => ChannelKind::Output,
        };
        if !is_valid_channel(self.id) {
            return Err(RouterError::InvalidChannel(format!("{}{}", kind, self.id)));
        }
        Ok(MuteSlot::Channel(DisplayChannel {
            kind,
            index: self.id,
        }))
    }

    /// Find the owning device and build the command
    ///
    /// Display channels use their physical override. The master always goes
    /// to the default device. Fails with `NotConnected` if nothing owns the target.
    pub fn resolve(&self, table: &AssignmentTable) -> Result<MuteRoute, RouterError> {
        let slot = self.slot()?;
        let (address, target) = match slot {
            MuteSlot::Master => {
                let address = table
                    .default_address()
                    .ok_or_else(|| RouterError::NotConnected("no default device".into()))?;
                (address.clone(), MuteTarget::Master)
            }
            MuteSlot::Channel(channel) => {
                let route = table.route(channel).ok_or_else(|| {
                    RouterError::NotConnected(format!("no device assigned to {channel}"))
                })?;
                (
                    route.address,
                    MuteTarget::channel(channel.kind, route.physical),
                )
            }
        };

        Ok(MuteRoute {
            address,
            slot,
            command: Command::SetMute {
                target,
                muted: self.muted,
            },
        })
    }
}
