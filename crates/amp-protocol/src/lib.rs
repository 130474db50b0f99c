//! Amplifier Control Protocol Library
//!
//! This crate provides encoding and streaming decoding for the fixed-format
//! binary TCP protocol spoken by networked audio power amplifiers:
//!
//! - **Gain read**: query the current level of one input or output channel
//! - **Mute read / set**: query or change the mute state of a channel or the master
//!
//! # Architecture
//!
//! - [`command`] holds the normalized `Command` / `Response` enums
//! - [`frame`] holds the byte layout and a streaming `FrameCodec` that handles
//!   partial reads, coalesced reads and garbage on the line
//!
//! The protocol is strictly half-duplex and responses carry no request id, so
//! correlating a response with its request is left to the caller (see the
//! session layer in `amp-router`).
//!
//! # Example
//!
//! ```rust
//! use amp_protocol::{ChannelKind, Command, EncodeFrame, ProtocolCodec, Response, ResponseCodec};
//!
//! let query = Command::ReadGain { kind: ChannelKind::Input, channel: 1 };
//! assert_eq!(query.encode().len(), 11);
//!
//! let mut codec = ResponseCodec::new();
//! codec.push_bytes(&[
//!     0xA5, 0xC3, 0x3C, 0x5A, 0xFF, 0x63, 0x0E, 0x04, 0x01, 0x01, 0xFF, 0x85, 0xEE,
//! ]);
//!
//! if let Some(Response::Gain { level, .. }) = codec.next_frame() {
//!     assert_eq!(level.db(), -12.3);
//! }
//! ```

pub mod command;
pub mod error;
pub mod frame;

pub use command::{
    is_valid_channel, ChannelKind, Command, Function, Level, MuteTarget, Response, CHANNEL_COUNT,
};
pub use error::ParseError;
pub use frame::{CodecStats, CommandCodec, FrameCodec, ResponseCodec, WireFrame};

/// TCP port amplifiers listen on unless configured otherwise
pub const DEFAULT_PORT: u16 = 8234;

/// Trait for codecs that parse incoming data streams
pub trait ProtocolCodec {
    /// The frame type produced by this codec
    type Frame;

    /// Push raw bytes into the codec's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete frame from the buffer
    fn next_frame(&mut self) -> Option<Self::Frame>;

    /// Try to extract the next complete frame along with its raw bytes
    ///
    /// This is useful for traffic logging where we want to show the exact
    /// bytes that were parsed for each frame.
    fn next_frame_with_bytes(&mut self) -> Option<(Self::Frame, Vec<u8>)>;

    /// Clear the internal buffer
    fn clear(&mut self);
}

/// Trait for frames that can be encoded to bytes
pub trait EncodeFrame {
    /// Encode this frame to its wire format
    fn encode(&self) -> Vec<u8>;
}
