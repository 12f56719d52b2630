//! Error types for the ibgate-tws library.

use thiserror::Error;

/// Top-level error type for the TWS client library.
#[derive(Debug, Error)]
pub enum TwsError {
    /// TCP connection failure or socket error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Failed to encode a request message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a response message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Protocol-level error (version mismatch, bad message format, redirect).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection was unexpectedly closed.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for this library.
pub type Result<T> = std::result::Result<T, TwsError>;
