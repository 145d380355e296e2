//! Client-facing JSON envelopes.
//!
//! Every outbound message is `{"type", "data", "timestamp"}`; inbound
//! messages are `{"type", "data"}`. Upstream errors are never forwarded
//! verbatim: they are wrapped into the uniform error envelope here.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use ponytalk_text::Emotion;

/// Error codes surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AsrError,
    LlmError,
    TtsError,
    NetworkError,
    UnknownError,
}

/// Outbound message body; the envelope adds the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        session_id: String,
    },
    AsrResult {
        text: String,
        is_final: bool,
    },
    AsrEnd {
        text: String,
    },
    ChatText {
        text: String,
    },
    TtsChunk {
        text: String,
        /// Base64-encoded audio.
        audio: String,
        seq: i32,
        is_final: bool,
    },
    TtsEnd {
        full_text: String,
    },
    Emotion {
        emotion: Emotion,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    /// Serializes with a server-assigned millisecond timestamp.
    pub fn envelope(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }
        value
    }
}

/// Inbound client message.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// String field accessor with an empty default.
    pub fn str_field(&self, key: &str) -> &str {
        self.data.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

/// Outbound channel to one client socket.
///
/// The writer task on the other end serializes the frames; both the
/// reader and the forwarder send through this handle.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<serde_json::Value>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<serde_json::Value>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: ServerMessage) {
        if self.tx.send(message.envelope()).await.is_err() {
            debug!("client gone, dropping outbound message");
        }
    }

    pub async fn error(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        error!("client error [{:?}]: {}", code, message);
        self.send(ServerMessage::Error { code, message }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_data_timestamp() {
        let value = ServerMessage::AsrResult {
            text: "你好".to_string(),
            is_final: true,
        }
        .envelope();

        assert_eq!(value["type"], "asr_result");
        assert_eq!(value["data"]["text"], "你好");
        assert_eq!(value["data"]["is_final"], true);
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let value = ServerMessage::Error {
            code: ErrorCode::NetworkError,
            message: "x".to_string(),
        }
        .envelope();
        assert_eq!(value["data"]["code"], "NETWORK_ERROR");

        let value = serde_json::to_value(ErrorCode::UnknownError).unwrap();
        assert_eq!(value, "UNKNOWN_ERROR");
    }

    #[test]
    fn tts_chunk_shape() {
        let value = ServerMessage::TtsChunk {
            text: String::new(),
            audio: "QUJD".to_string(),
            seq: 3,
            is_final: false,
        }
        .envelope();

        assert_eq!(value["type"], "tts_chunk");
        assert_eq!(value["data"]["audio"], "QUJD");
        assert_eq!(value["data"]["seq"], 3);
        assert_eq!(value["data"]["is_final"], false);
    }

    #[test]
    fn emotion_envelope_uses_labels() {
        let value = ServerMessage::Emotion {
            emotion: Emotion::Empathy,
        }
        .envelope();
        assert_eq!(value["data"]["emotion"], "共情倾听");
    }

    #[test]
    fn client_message_parsing() {
        let msg = ClientMessage::parse(r#"{"type":"text_query","data":{"text":"你好"}}"#).unwrap();
        assert_eq!(msg.kind, "text_query");
        assert_eq!(msg.str_field("text"), "你好");

        // Missing data defaults to null.
        let msg = ClientMessage::parse(r#"{"type":"interrupt"}"#).unwrap();
        assert_eq!(msg.kind, "interrupt");
        assert_eq!(msg.str_field("anything"), "");

        assert!(ClientMessage::parse("{{").is_err());
    }
}
