//! Wire Frame Layout and Streaming Codec
//!
//! Every frame on the wire has the same shape:
//!
//! # Frame Format
//! ```text
//! A5 C3 3C 5A [dev] [class] [func] [len] [payload...] EE
//! ```
//!
//! - `A5 C3 3C 5A`: Start sentinel
//! - `dev`: Device id, always `FF`
//! - `class`: Command class, always `63`
//! - `func`: Function code (`0E` gain, `03` mute)
//! - `len`: Payload length
//! - `payload`: `type id [state]` for mute, `type ch [hi lo]` for gain
//! - `EE`: Trailer
//!
//! There is no checksum and no request id. A frame is recognised purely by
//! its sentinel, its size and its trailer. Responses are sized by their
//! function code alone; the length byte is not relied on. Commands need the
//! length byte too, since mute read and mute set share function `03`.
//!
//! | Frame          | Size | Payload               |
//! |----------------|------|-----------------------|
//! | Gain read      | 11   | `type ch`             |
//! | Mute read      | 11   | `type id`             |
//! | Mute set       | 12   | `type id state`       |
//! | Gain response  | 13   | `type ch hi lo`       |
//! | Mute response  | 12   | `type id state`       |
//!
//! # Resynchronisation
//! When the head of the buffer is not a valid frame the codec drops bytes up
//! to the next start sentinel and carries on; a garbled frame never poisons
//! the rest of the stream.

use std::marker::PhantomData;

use crate::command::{ChannelKind, Command, Function, Level, MuteTarget, Response};
use crate::error::ParseError;
use crate::{EncodeFrame, ProtocolCodec};

/// Start-of-frame sentinel
pub const SENTINEL: [u8; 4] = [0xA5, 0xC3, 0x3C, 0x5A];
/// End-of-frame trailer byte
pub const TRAILER: u8 = 0xEE;
/// Device id byte sent in every frame
pub const DEVICE_ID: u8 = 0xFF;
/// Command class byte sent in every frame
pub const COMMAND_CLASS: u8 = 0x63;

/// Bytes before the payload (sentinel, device id, class, function, length)
pub const HEADER_LEN: usize = 8;
/// Smallest command frame (gain read / mute read)
pub const MIN_COMMAND_LEN: usize = 11;
/// Smallest response frame (mute response)
pub const MIN_RESPONSE_LEN: usize = 12;
/// Largest frame in either direction (gain response)
pub const MAX_FRAME_LEN: usize = 13;
/// Default cap on the reassembly buffer
pub const DEFAULT_MAX_BUFFER_LEN: usize = 256;

const FUNCTION_OFFSET: usize = 6;
const LENGTH_OFFSET: usize = 7;

/// A frame type that can be decoded from the wire
///
/// Implemented for [`Response`] (amplifier → controller) and [`Command`]
/// (controller → amplifier) so the same streaming codec serves both sides.
pub trait WireFrame: Sized {
    /// Frames shorter than this are always incomplete
    const MIN_LEN: usize;

    /// Possible total sizes, smallest first, for a frame whose header carries
    /// `function` and `payload_len`. Empty if no such frame exists in this
    /// direction.
    fn frame_lens(function: u8, payload_len: u8) -> &'static [usize];

    /// Decode the payload of a correctly framed message
    fn parse_payload(function: Function, payload: &[u8]) -> Result<Self, ParseError>;
}

impl WireFrame for Response {
    const MIN_LEN: usize = MIN_RESPONSE_LEN;

    fn frame_lens(function: u8, _payload_len: u8) -> &'static [usize] {
        match function {
            0x0E => &[13],
            0x03 => &[12],
            // Unknown function: any response size, so the frame is dropped
            // whole instead of resyncing through it
            _ => &[12, 13],
        }
    }

    fn parse_payload(function: Function, payload: &[u8]) -> Result<Self, ParseError> {
        match (function, payload) {
            (Function::Gain, &[type_byte, channel, hi, lo]) => {
                let kind = ChannelKind::from_type_byte(type_byte)?;
                if !crate::is_valid_channel(channel) {
                    return Err(ParseError::InvalidChannel(channel));
                }
                Ok(Response::Gain {
                    kind,
                    channel,
                    level: Level::from_be_bytes([hi, lo]),
                })
            }
            (Function::Mute, &[type_byte, id, state]) => Ok(Response::Mute {
                target: MuteTarget::from_wire_fields(type_byte, id)?,
                muted: state != 0x00,
            }),
            _ => Err(ParseError::InvalidFrame(format!(
                "unexpected {}-byte payload for {:?}",
                payload.len(),
                function
            ))),
        }
    }
}

impl WireFrame for Command {
    const MIN_LEN: usize = MIN_COMMAND_LEN;

    fn frame_lens(function: u8, payload_len: u8) -> &'static [usize] {
        match (function, payload_len) {
            (0x0E, 2) | (0x03, 2) => &[11],
            (0x03, 3) => &[12],
            _ => &[],
        }
    }

    fn parse_payload(function: Function, payload: &[u8]) -> Result<Self, ParseError> {
        match (function, payload) {
            (Function::Gain, &[type_byte, channel]) => {
                let kind = ChannelKind::from_type_byte(type_byte)?;
                if !crate::is_valid_channel(channel) {
                    return Err(ParseError::InvalidChannel(channel));
                }
                Ok(Command::ReadGain { kind, channel })
            }
            (Function::Mute, &[type_byte, id]) => Ok(Command::ReadMute {
                target: MuteTarget::from_wire_fields(type_byte, id)?,
            }),
            (Function::Mute, &[type_byte, id, state]) => Ok(Command::SetMute {
                target: MuteTarget::from_wire_fields(type_byte, id)?,
                muted: state != 0x00,
            }),
            _ => Err(ParseError::InvalidFrame(format!(
                "unexpected {}-byte payload for {:?}",
                payload.len(),
                function
            ))),
        }
    }
}

/// Assemble a frame around a payload
fn build_frame(function: Function, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.extend_from_slice(&SENTINEL);
    frame.push(DEVICE_ID);
    frame.push(COMMAND_CLASS);
    frame.push(function.code());
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame.push(TRAILER);
    frame
}

fn mute_state_byte(muted: bool) -> u8 {
    if muted {
        0x01
    } else {
        0x00
    }
}

impl EncodeFrame for Command {
    fn encode(&self) -> Vec<u8> {
        match *self {
            Command::ReadGain { kind, channel } => {
                build_frame(Function::Gain, &[kind.type_byte(), channel])
            }
            Command::ReadMute { target } => {
                let (type_byte, id) = target.wire_fields();
                build_frame(Function::Mute, &[type_byte, id])
            }
            Command::SetMute { target, muted } => {
                let (type_byte, id) = target.wire_fields();
                build_frame(Function::Mute, &[type_byte, id, mute_state_byte(muted)])
            }
        }
    }
}

impl EncodeFrame for Response {
    fn encode(&self) -> Vec<u8> {
        match *self {
            Response::Gain {
                kind,
                channel,
                level,
            } => {
                let [hi, lo] = level.to_be_bytes();
                build_frame(Function::Gain, &[kind.type_byte(), channel, hi, lo])
            }
            Response::Mute { target, muted } => {
                let (type_byte, id) = target.wire_fields();
                build_frame(Function::Mute, &[type_byte, id, mute_state_byte(muted)])
            }
        }
    }
}

/// Decode one complete, correctly sized frame
pub fn parse_frame<T: WireFrame>(frame: &[u8]) -> Result<T, ParseError> {
    if frame.len() < T::MIN_LEN {
        return Err(ParseError::Incomplete {
            needed: T::MIN_LEN - frame.len(),
        });
    }
    if frame[..SENTINEL.len()] != SENTINEL {
        return Err(ParseError::InvalidFrame("missing start sentinel".into()));
    }
    if frame[frame.len() - 1] != TRAILER {
        return Err(ParseError::InvalidFrame("missing trailer".into()));
    }

    if !T::frame_lens(frame[FUNCTION_OFFSET], frame[LENGTH_OFFSET]).contains(&frame.len()) {
        return Err(ParseError::InvalidFrame(format!(
            "no {:02X}/{:02X} frame is {} bytes long",
            frame[FUNCTION_OFFSET],
            frame[LENGTH_OFFSET],
            frame.len()
        )));
    }

    let function = Function::try_from(frame[FUNCTION_OFFSET])?;
    T::parse_payload(function, &frame[HEADER_LEN..frame.len() - 1])
}

/// Counters kept by a streaming codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodecStats {
    /// Frames decoded successfully
    pub frames: u64,
    /// Times the codec skipped ahead to the next sentinel
    pub resyncs: u64,
    /// Well-framed messages dropped without resync (unknown function or bad payload)
    pub invalid_frames: u64,
    /// Bytes thrown away by resyncs and overflows
    pub discarded_bytes: u64,
    /// Times the buffer hit its cap and was cleared
    pub overflows: u64,
}

/// What the head of the buffer currently holds
enum Head {
    /// Not enough bytes yet
    Incomplete,
    /// Head cannot be the start of a valid frame
    Invalid(&'static str),
    /// A complete frame of this many bytes
    Complete(usize),
}

/// Streaming frame codec
///
/// Bytes are appended with [`ProtocolCodec::push_bytes`]; complete frames are
/// taken from the head of the buffer one at a time. Leftover bytes stay
/// buffered for the next read.
pub struct FrameCodec<T> {
    buffer: Vec<u8>,
    max_buffer_len: usize,
    stats: CodecStats,
    _frame: PhantomData<fn() -> T>,
}

/// Codec for frames coming from an amplifier
pub type ResponseCodec = FrameCodec<Response>;
/// Codec for frames coming from a controller
pub type CommandCodec = FrameCodec<Command>;

impl<T: WireFrame> FrameCodec<T> {
    /// Create a new codec with the default buffer cap
    pub fn new() -> Self {
        Self::with_max_buffer_len(DEFAULT_MAX_BUFFER_LEN)
    }

    /// Create a codec that clears its buffer once it grows past `max_buffer_len`
    /// without yielding a frame
    pub fn with_max_buffer_len(max_buffer_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_LEN * 2),
            max_buffer_len,
            stats: CodecStats::default(),
            _frame: PhantomData,
        }
    }

    /// Counters since creation
    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn head(&self) -> Head {
        let buf = &self.buffer;
        let prefix = buf.len().min(SENTINEL.len());
        if buf[..prefix] != SENTINEL[..prefix] {
            return Head::Invalid("missing start sentinel");
        }
        if buf.len() < T::MIN_LEN {
            return Head::Incomplete;
        }
        let lens = T::frame_lens(buf[FUNCTION_OFFSET], buf[LENGTH_OFFSET]);
        if lens.is_empty() {
            return Head::Invalid("unknown frame family");
        }
        for &len in lens {
            if buf.len() < len {
                return Head::Incomplete;
            }
            if buf[len - 1] == TRAILER {
                return Head::Complete(len);
            }
        }
        Head::Invalid("missing trailer")
    }

    /// Drop bytes up to the next start sentinel after the head
    fn resync(&mut self, reason: &str) {
        let skip = match find_sentinel(&self.buffer[1..]) {
            Some(pos) => pos + 1,
            // Keep a trailing partial sentinel, it may complete on the next read
            None => self.buffer.len() - partial_sentinel_suffix(&self.buffer[1..]),
        };

        tracing::debug!(
            "Resync ({}): discarding {} bytes {:02X?}",
            reason,
            skip,
            &self.buffer[..skip.min(16)]
        );
        self.buffer.drain(..skip);
        self.stats.resyncs += 1;
        self.stats.discarded_bytes += skip as u64;
    }
}

impl<T: WireFrame> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WireFrame> ProtocolCodec for FrameCodec<T> {
    type Frame = T;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Self::Frame> {
        self.next_frame_with_bytes().map(|(frame, _)| frame)
    }

    fn next_frame_with_bytes(&mut self) -> Option<(Self::Frame, Vec<u8>)> {
        loop {
            match self.head() {
                Head::Incomplete => {
                    if self.buffer.len() > self.max_buffer_len {
                        tracing::warn!(
                            "Frame buffer exceeded {} bytes without a frame, clearing",
                            self.max_buffer_len
                        );
                        self.stats.overflows += 1;
                        self.stats.discarded_bytes += self.buffer.len() as u64;
                        self.buffer.clear();
                    }
                    return None;
                }
                Head::Invalid(reason) => self.resync(reason),
                Head::Complete(len) => {
                    let raw: Vec<u8> = self.buffer.drain(..len).collect();
                    match parse_frame::<T>(&raw) {
                        Ok(frame) => {
                            self.stats.frames += 1;
                            return Some((frame, raw));
                        }
                        Err(e) => {
                            tracing::warn!("Failed to parse frame {:02X?}: {}", raw, e);
                            self.stats.invalid_frames += 1;
                        }
                    }
                }
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Position of the first complete start sentinel in `data`
pub fn find_sentinel(data: &[u8]) -> Option<usize> {
    data.windows(SENTINEL.len()).position(|w| w == SENTINEL)
}

/// Length of the longest suffix of `data` that is a proper prefix of the sentinel
fn partial_sentinel_suffix(data: &[u8]) -> usize {
    (1..SENTINEL.len())
        .rev()
        .find(|&k| data.len() >= k && data[data.len() - k..] == SENTINEL[..k])
        .unwrap_or(0)
}
