//! Amplifier Simulation Library
//!
//! This crate provides a simulation layer for exercising the amplifier
//! protocol client without physical hardware. It includes:
//!
//! - **VirtualAmplifier**: device model that answers gain and mute commands
//! - **run_virtual_amp_task**: serves a `VirtualAmplifier` over any byte stream
//! - **VirtualAmpServer**: loopback TCP listener with a control channel for
//!   changing levels, going silent and dropping the connection
//!
//! # Example
//!
//! ```rust
//! use amp_protocol::{ChannelKind, Command, Level, Response};
//! use amp_sim::VirtualAmplifier;
//!
//! let mut amp = VirtualAmplifier::new("bench").with_all_gains(Level::from_raw(-60));
//! let response = amp.process_command(Command::ReadGain { kind: ChannelKind::Input, channel: 1 });
//!
//! if let Some(Response::Gain { level, .. }) = response {
//!     assert_eq!(level.db(), -6.0);
//! }
//! ```

pub mod amplifier;
pub mod amplifier_task;

pub use amplifier::{VirtualAmplifier, VirtualAmplifierConfig};
pub use amplifier_task::{
    run_virtual_amp_task, SimError, TaskExit, VirtualAmpCommand, VirtualAmpEvent,
    VirtualAmpServer,
};
