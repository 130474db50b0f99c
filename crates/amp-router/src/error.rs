//! Error types for sessions and the router

use amp_protocol::ParseError;
use thiserror::Error;

/// Errors that can occur in the router or a device session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// No session for the target device, or the session is not connected
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Channel id or physical channel number out of range
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// Device address could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Device did not answer the command in flight
    #[error("response timeout after {0}ms")]
    ResponseTimeout(u64),

    /// TCP connect, read or write failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Session command queue is full
    #[error("command queue full for {0}")]
    QueueFull(String),

    /// Malformed input from a device or a caller
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The router actor has stopped
    #[error("router is not running")]
    RouterClosed,
}
