//! Error types for amplifier frame parsing

use thiserror::Error;

/// Errors that can occur while parsing protocol frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Invalid frame structure (bad sentinel, trailer or size)
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Function code not known for this direction
    #[error("unknown function code: 0x{0:02X}")]
    UnknownFunction(u8),

    /// Channel type byte is neither input nor output
    #[error("invalid channel type: 0x{0:02X}")]
    InvalidKind(u8),

    /// Channel number outside 1..=4 (or 0 where the master is not allowed)
    #[error("invalid channel number: {0}")]
    InvalidChannel(u8),
}
