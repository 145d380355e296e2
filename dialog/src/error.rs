//! Error types for the dialogue client.

use thiserror::Error;

/// Result type alias for dialogue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dialogue operations.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding error.
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// IO error (gzip, buffers).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A declared length in a frame exceeds the remaining bytes.
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),

    /// Unsupported protocol version in a frame header.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Error reported by the upstream service.
    #[error("upstream error {code}: {message}")]
    Upstream { code: u32, message: String },

    /// Operation requires a started session.
    #[error("session not started")]
    SessionNotStarted,

    /// A bounded wait expired.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Other error.
    #[error("{0}")]
    Other(String),
}
