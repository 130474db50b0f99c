//! Amplifier Session Router
//!
//! This crate keeps TCP sessions open to one or more networked amplifiers,
//! polls their gain and mute state, and routes every reading to the logical
//! "display channel" it is currently assigned to.
//!
//! # Architecture
//!
//! - [`session`]: one task per device. Connects, polls one query per tick
//!   under a strict half-duplex discipline, and reconnects with backoff.
//! - [`poll`]: the 17-query cycle and the per-channel duplicate filter
//! - [`assignment`]: which device and physical channel backs each of the
//!   eight display channels
//! - [`gateway`]: turns a client mute request into a protocol command for
//!   the owning device
//! - [`actor`]: the router actor that owns the table and the sessions and
//!   publishes [`RouterEvent`]s to any number of subscribers
//!
//! Readings are attributed when they are delivered, never when they are
//! requested, so a reassignment takes effect for the very next sample.

pub mod actor;
pub mod assignment;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod poll;
pub mod session;
pub mod state;

// Re-export actor types
pub use actor::{run_router, RouterCommand, RouterHandle, SessionSummary, StatusSnapshot};

// Re-export routing types
pub use assignment::{AssignmentTable, ChannelAssignment, Route};
pub use channel::{DisplayChannel, MuteSlot};
pub use gateway::{MuteKind, MuteRequest, MuteRoute};

// Re-export session types
pub use config::{RouterConfig, SessionConfig};
pub use error::RouterError;
pub use events::{RouterEvent, Sample, SessionEvent, SessionEventKind};
pub use poll::{default_queries, PollCycle, PollStats};
pub use session::{Backoff, SessionHandle};
pub use state::{DeviceAddress, SessionId, SessionState, SessionStats, SessionStatus};
