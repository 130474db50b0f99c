//! Virtual amplifier device model
//!
//! Holds a gain per physical channel and a mute state per channel plus the
//! master, and answers protocol commands the way a real unit does.

use std::collections::HashMap;

use amp_protocol::{ChannelKind, Command, Level, MuteTarget, Response, CHANNEL_COUNT};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for creating a virtual amplifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualAmplifierConfig {
    /// Identifier for logging
    pub id: String,
    /// Level every channel starts at
    pub initial_gain: Level,
    /// Port to listen on; 0 picks a free one
    pub port: u16,
}

impl Default for VirtualAmplifierConfig {
    fn default() -> Self {
        Self {
            id: "virtual-amp".to_string(),
            initial_gain: Level::from_raw(-200),
            port: 0,
        }
    }
}

/// Simulated amplifier
#[derive(Debug, Clone)]
pub struct VirtualAmplifier {
    /// Identifier for logging
    id: String,
    gains: HashMap<(ChannelKind, u8), Level>,
    mutes: HashMap<MuteTarget, bool>,
    /// When set, commands are applied but never answered
    silent: bool,
    /// Commands received (for test verification)
    received_commands: Vec<Command>,
}

impl VirtualAmplifier {
    /// Create an amplifier with every channel at -20.0 dB and nothing muted
    pub fn new(id: impl Into<String>) -> Self {
        Self::from_config(&VirtualAmplifierConfig {
            id: id.into(),
            ..Default::default()
        })
    }

    pub fn from_config(config: &VirtualAmplifierConfig) -> Self {
        let mut amp = Self {
            id: config.id.clone(),
            gains: HashMap::new(),
            mutes: HashMap::new(),
            silent: false,
            received_commands: Vec::new(),
        };
        amp.set_all_gains(config.initial_gain);
        amp
    }

    /// Builder form of [`set_all_gains`](Self::set_all_gains)
    pub fn with_all_gains(mut self, level: Level) -> Self {
        self.set_all_gains(level);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gain(&self, kind: ChannelKind, channel: u8) -> Option<Level> {
        self.gains.get(&(kind, channel)).copied()
    }

    /// Set one channel's level. Returns true if it changed.
    pub fn set_gain(&mut self, kind: ChannelKind, channel: u8, level: Level) -> bool {
        self.gains.insert((kind, channel), level) != Some(level)
    }

    pub fn set_all_gains(&mut self, level: Level) {
        for kind in ChannelKind::ALL {
            for channel in 1..=CHANNEL_COUNT {
                self.gains.insert((kind, channel), level);
            }
        }
    }

    pub fn muted(&self, target: MuteTarget) -> bool {
        self.mutes.get(&target).copied().unwrap_or(false)
    }

    /// Set a mute state. Returns true if it changed.
    pub fn set_muted(&mut self, target: MuteTarget, muted: bool) -> bool {
        self.mutes.insert(target, muted).unwrap_or(false) != muted
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Stop (or resume) answering commands
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Apply a command and build the response a real unit would send
    ///
    /// Returns `None` while silent or for a gain read of a channel the model
    /// does not have.
    pub fn process_command(&mut self, command: Command) -> Option<Response> {
        self.received_commands.push(command);

        let response = match command {
            Command::ReadGain { kind, channel } => Response::Gain {
                kind,
                channel,
                level: self.gain(kind, channel)?,
            },
            Command::ReadMute { target } => Response::Mute {
                target,
                muted: self.muted(target),
            },
            Command::SetMute { target, muted } => {
                if self.set_muted(target, muted) {
                    debug!("Virtual amp {} {} -> muted={}", self.id, target, muted);
                }
                Response::Mute { target, muted }
            }
        };

        if self.silent {
            debug!("Virtual amp {} silently dropping {}", self.id, command);
            return None;
        }
        Some(response)
    }

    /// Get received commands (for testing)
    pub fn received_commands(&self) -> &[Command] {
        &self.received_commands
    }

    /// Clear received commands
    pub fn clear_received(&mut self) {
        self.received_commands.clear();
    }
}
