//! Error types for the staged pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for staged ASR / LLM / TTS operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Speech recognition failed.
    #[error("asr error: {0}")]
    Asr(String),

    /// Language model call failed.
    #[error("llm error: {0}")]
    Llm(String),

    /// Speech synthesis failed.
    #[error("tts error: {0}")]
    Tts(String),

    /// HTTP request error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire frame error.
    #[error("frame error: {0}")]
    Frame(#[from] ponytalk_dialog::Error),

    /// Base64 decoding error.
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
