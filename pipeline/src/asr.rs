//! Streaming ASR client for the SAUC bigmodel service.
//!
//! One WebSocket per utterance stream: a configuration frame first, then
//! sequence-numbered audio frames, the last one carrying a negative
//! sequence. Recognition results are published to an owner-supplied
//! channel as they arrive.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ponytalk_dialog::protocol::{
    build_audio_only_request, build_full_client_request, parse_frame, Frame, MessageType,
};

use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Default SAUC bigmodel streaming endpoint.
pub const DEFAULT_ASR_URL: &str = "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel";

/// Resource id for duration-billed streaming ASR.
pub const RESOURCE_ASR_STREAM: &str = "volc.bigasr.sauc.duration";

/// Streaming ASR configuration.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub url: String,
    pub app_id: String,
    pub access_key: String,
    pub format: String,
    pub sample_rate: i32,
    pub bits: i32,
    pub channel: i32,
    pub enable_itn: bool,
    pub enable_punc: bool,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ASR_URL.to_string(),
            app_id: String::new(),
            access_key: String::new(),
            format: "pcm".to_string(),
            sample_rate: 16000,
            bits: 16,
            channel: 1,
            enable_itn: true,
            enable_punc: true,
        }
    }
}

/// One recognition hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct AsrUpdate {
    pub text: String,
    pub is_final: bool,
}

/// Streaming ASR WebSocket client.
pub struct AsrClient {
    writer: Arc<Mutex<WsWriter>>,
    connected: Arc<AtomicBool>,
    request_id: String,
    seq: AtomicI32,
    receive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AsrClient {
    /// Connects, sends the configuration frame, and starts the receive
    /// task publishing into `result_tx`.
    pub async fn connect(
        config: &AsrConfig,
        result_tx: mpsc::Sender<Result<AsrUpdate>>,
    ) -> Result<Self> {
        let request_id = Uuid::new_v4().to_string();

        let mut request = config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("X-Api-Resource-Id", header_value(RESOURCE_ASR_STREAM)?);
        headers.insert("X-Api-Access-Key", header_value(&config.access_key)?);
        headers.insert("X-Api-App-Key", header_value(&config.app_id)?);
        headers.insert("X-Api-Request-Id", header_value(&request_id)?);

        let (ws_stream, _response) = connect_async(request).await?;
        let (writer, reader) = ws_stream.split();
        info!("asr connected, request_id={}", request_id);

        let connected = Arc::new(AtomicBool::new(true));
        let client = Self {
            writer: Arc::new(Mutex::new(writer)),
            connected: connected.clone(),
            request_id,
            seq: AtomicI32::new(0),
            receive_task: Mutex::new(None),
        };

        client.send_config(config).await?;

        let handle = tokio::spawn(receive_loop(reader, result_tx, connected));
        *client.receive_task.lock().await = Some(handle);

        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends one base64-encoded audio chunk.
    pub async fn send_audio(&self, audio_base64: &str, seq: i32, is_last: bool) -> Result<()> {
        if !self.is_connected() {
            warn!("asr not connected, audio dropped");
            return Ok(());
        }

        let audio = BASE64.decode(audio_base64)?;
        let frame = build_audio_only_request(&audio, seq, is_last, true)?;
        self.send(frame).await?;
        self.seq.store(seq, Ordering::Relaxed);
        debug!(
            "asr audio sent, seq={}, is_last={}, size={}",
            seq,
            is_last,
            audio.len()
        );
        Ok(())
    }

    /// Closes the audio stream with an empty last frame.
    pub async fn finish(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let seq = self.seq.load(Ordering::Relaxed) + 1;
        let frame = build_audio_only_request(&[], seq, true, true)?;
        self.send(frame).await?;
        debug!("asr stream finished, last seq={}", seq);
        Ok(())
    }

    /// Closes the socket and waits for the receive task.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.close().await {
                debug!("error closing asr websocket: {}", e);
            }
        }

        let handle = self.receive_task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("asr receive task did not stop within 5s");
            }
        }
        info!("asr disconnected, request_id={}", self.request_id);
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Binary(data.into())).await?;
        Ok(())
    }

    async fn send_config(&self, config: &AsrConfig) -> Result<()> {
        let payload = json!({
            "user": {
                "uid": self.request_id,
            },
            "audio": {
                "format": config.format,
                "sample_rate": config.sample_rate,
                "bits": config.bits,
                "channel": config.channel,
                "codec": "raw",
            },
            "request": {
                "model_name": "bigmodel",
                "enable_itn": config.enable_itn,
                "enable_punc": config.enable_punc,
                "result_type": "single",
            },
        });

        let frame = build_full_client_request(&payload, true)?;
        self.send(frame).await?;
        debug!("asr config sent");
        Ok(())
    }
}

async fn receive_loop(
    mut reader: WsReader,
    result_tx: mpsc::Sender<Result<AsrUpdate>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = reader.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                let _ = result_tx
                    .send(Err(Error::Asr(format!("接收错误: {}", e))))
                    .await;
                break;
            }
        };

        match msg {
            WsMessage::Binary(data) => {
                let frame = match parse_frame(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping unparseable asr frame: {}", e);
                        continue;
                    }
                };
                match decode_result(&frame) {
                    Some(Ok(update)) => {
                        if !update.text.is_empty() {
                            debug!("asr result: {}, is_final={}", update.text, update.is_final);
                            if result_tx.send(Ok(update)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        if result_tx.send(Err(e)).await.is_err() {
                            break;
                        }
                    }
                    None => {}
                }
            }
            WsMessage::Close(_) => {
                info!("asr connection closed");
                break;
            }
            _ => {}
        }
    }

    connected.store(false, Ordering::Relaxed);
}

/// Decodes one server frame into a recognition update or an error.
fn decode_result(frame: &Frame) -> Option<Result<AsrUpdate>> {
    if frame.is_error() {
        let message = frame
            .payload_json()
            .ok()
            .and_then(|p| p.get("message").and_then(|v| v.as_str()).map(String::from))
            .unwrap_or_else(|| frame.payload_text());
        return Some(Err(Error::Asr(format!(
            "{} (code={})",
            message, frame.error_code
        ))));
    }

    if frame.msg_type != MessageType::FullServer {
        return None;
    }
    let payload = frame.payload_json().ok()?;

    let code = payload.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    if code != 0 {
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        return Some(Err(Error::Asr(format!("{} (code={})", message, code))));
    }

    match payload.get("result") {
        Some(result) if result.is_object() => {
            let text = result
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let is_final = result
                .get("utterance_end")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Some(Ok(AsrUpdate { text, is_final }))
        }
        // Utterance-list shape used by older responses.
        Some(result) if result.is_array() => {
            let first = result.as_array()?.first()?;
            let text = first
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let is_final = first.get("type").and_then(|v| v.as_str()) == Some("final");
            Some(Ok(AsrUpdate { text, is_final }))
        }
        _ => None,
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Asr(format!("invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ponytalk_dialog::protocol::MessageFlags;
    use serde_json::json;

    fn full_server(payload: serde_json::Value) -> Frame {
        Frame {
            msg_type: MessageType::FullServer,
            flags: MessageFlags::PosSequence,
            sequence: 1,
            payload: payload.to_string().into_bytes(),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_interim_and_final_results() {
        let frame = full_server(json!({"result": {"text": "你好", "utterance_end": false}}));
        assert_eq!(
            decode_result(&frame).unwrap().unwrap(),
            AsrUpdate {
                text: "你好".to_string(),
                is_final: false
            }
        );

        let frame = full_server(json!({"result": {"text": "你好呀", "utterance_end": true}}));
        assert_eq!(
            decode_result(&frame).unwrap().unwrap(),
            AsrUpdate {
                text: "你好呀".to_string(),
                is_final: true
            }
        );
    }

    #[test]
    fn decodes_list_shape() {
        let frame = full_server(json!({"result": [{"text": "早", "type": "final"}]}));
        assert_eq!(
            decode_result(&frame).unwrap().unwrap(),
            AsrUpdate {
                text: "早".to_string(),
                is_final: true
            }
        );
    }

    #[test]
    fn surfaces_service_errors() {
        let frame = full_server(json!({"code": 1013, "message": "invalid audio"}));
        match decode_result(&frame) {
            Some(Err(Error::Asr(msg))) => assert!(msg.contains("invalid audio")),
            other => panic!("expected asr error, got {:?}", other.map(|r| r.is_ok())),
        }

        let frame = Frame {
            msg_type: MessageType::Error,
            error_code: 55000001,
            payload: json!({"message": "server busy"}).to_string().into_bytes(),
            ..Default::default()
        };
        match decode_result(&frame) {
            Some(Err(Error::Asr(msg))) => assert!(msg.contains("server busy")),
            other => panic!("expected asr error, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn ignores_non_result_frames() {
        let frame = full_server(json!({"audio_info": {"duration": 120}}));
        assert!(decode_result(&frame).is_none());
    }
}
