//! Per-sentence TTS client for the ws_binary synthesis endpoint.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use ponytalk_dialog::protocol::{build_full_client_request, parse_frame, MessageType};

use crate::error::{Error, Result};

/// Default binary TTS endpoint.
pub const DEFAULT_TTS_URL: &str = "wss://openspeech.bytedance.com/api/v1/tts/ws_binary";

/// TTS configuration.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub app_id: String,
    /// Bearer token, sent as `Authorization: Bearer;{token}`.
    pub access_token: String,
    pub cluster: String,
    pub voice_type: String,
    pub encoding: String,
    pub speed_ratio: f64,
    pub volume_ratio: f64,
    pub pitch_ratio: f64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TTS_URL.to_string(),
            app_id: String::new(),
            access_token: String::new(),
            cluster: "volcano_tts".to_string(),
            voice_type: "zh_female_cancan_mars_bigtts".to_string(),
            encoding: "mp3".to_string(),
            speed_ratio: 1.0,
            volume_ratio: 1.0,
            pitch_ratio: 1.0,
        }
    }
}

/// Synthesized audio for one sentence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TtsAudio {
    pub data: Vec<u8>,
    pub duration_ms: i64,
}

/// A speech synthesizer seam for the stream processor.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesizes one sentence. Empty input yields empty audio.
    async fn synthesize(&self, text: &str) -> Result<TtsAudio>;
}

/// Cloned voices (S_ prefix) live on the voice-clone cluster.
pub fn cluster_for_voice(voice_type: &str) -> &'static str {
    if voice_type.starts_with("S_") {
        "volcano_icl"
    } else {
        "volcano_tts"
    }
}

/// Binary-WebSocket TTS client. Opens one connection per sentence.
pub struct TtsClient {
    config: TtsConfig,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Self {
        Self { config }
    }

    /// Synthesizes one sentence, collecting audio frames until the last
    /// one.
    pub async fn synthesize(&self, text: &str) -> Result<TtsAudio> {
        if text.trim().is_empty() {
            return Ok(TtsAudio::default());
        }

        let mut request = self.config.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer;{}", self.config.access_token))
                .map_err(|e| Error::Tts(format!("invalid access token: {}", e)))?,
        );

        let (ws_stream, _response) = connect_async(request).await?;
        let (mut writer, mut reader) = ws_stream.split();

        let frame = build_full_client_request(&self.request_payload(text), true)?;
        writer.send(WsMessage::Binary(frame.into())).await?;
        debug!("tts request sent: {} chars", text.chars().count());

        let mut audio = Vec::new();
        while let Some(msg) = reader.next().await {
            let msg = msg?;
            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => break,
                other => {
                    warn!("unexpected tts message: {:?}", other);
                    continue;
                }
            };

            let frame = parse_frame(&data)?;
            match frame.msg_type {
                MessageType::ServerAck => {
                    audio.extend_from_slice(&frame.payload);
                    if frame.is_last_audio() {
                        break;
                    }
                }
                MessageType::FullServer => {
                    // Some responses wrap base64 audio in a JSON body.
                    if let Ok(payload) = frame.payload_json() {
                        if let Some(b64) = payload.get("data").and_then(|v| v.as_str()) {
                            if !b64.is_empty() {
                                audio.extend_from_slice(&BASE64.decode(b64)?);
                            }
                        }
                    }
                }
                MessageType::FrontendResult => break,
                MessageType::Error => {
                    let message = frame
                        .payload_json()
                        .ok()
                        .and_then(|p| {
                            p.get("message").and_then(|v| v.as_str()).map(String::from)
                        })
                        .unwrap_or_else(|| frame.payload_text());
                    return Err(Error::Tts(format!(
                        "{} (code={})",
                        message, frame.error_code
                    )));
                }
                _ => {}
            }
        }

        let duration_ms = estimate_duration_ms(audio.len());
        Ok(TtsAudio {
            data: audio,
            duration_ms,
        })
    }

    fn request_payload(&self, text: &str) -> serde_json::Value {
        let cluster = if self.config.cluster.is_empty() {
            cluster_for_voice(&self.config.voice_type).to_string()
        } else {
            self.config.cluster.clone()
        };

        json!({
            "app": {
                "appid": self.config.app_id,
                "token": self.config.access_token,
                "cluster": cluster,
            },
            "user": {
                "uid": format!("user_{}", &Uuid::new_v4().simple().to_string()[..8]),
            },
            "audio": {
                "voice_type": self.config.voice_type,
                "encoding": self.config.encoding,
                "rate": 24000,
                "speed_ratio": self.config.speed_ratio,
                "volume_ratio": self.config.volume_ratio,
                "pitch_ratio": self.config.pitch_ratio,
            },
            "request": {
                "reqid": Uuid::new_v4().to_string(),
                "text": text,
                "text_type": "plain",
                "operation": "submit",
                "with_timestamp": 1,
            },
        })
    }
}

#[async_trait]
impl Synthesizer for TtsClient {
    async fn synthesize(&self, text: &str) -> Result<TtsAudio> {
        TtsClient::synthesize(self, text).await
    }
}

/// 128kbps MP3 is roughly 16 KB per second.
fn estimate_duration_ms(audio_size: usize) -> i64 {
    (audio_size as i64) * 1000 / 16_000
}
