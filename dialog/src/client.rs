//! WebSocket client for the end-to-end realtime dialogue service.
//!
//! Owns the single outbound connection: sends protocol frames, runs one
//! receive task that decodes incoming frames, and maintains the
//! connection/session flags. Decoded frames and upstream errors are
//! published to owner-supplied channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DialogConfig, InputMod, DEFAULT_GREETING};
use crate::error::{Error, Result};
use crate::protocol::{
    build_audio_frame, build_event_frame, event_name, events, parse_frame, Frame, MessageType,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Events logged at info level; the rest go to debug.
const NOTABLE_EVENTS: [i32; 9] = [150, 152, 153, 350, 359, 450, 459, 550, 559];

/// An error reported by the upstream side.
///
/// `fatal` is true for session failures and transport faults; per-turn
/// errors are non-fatal and the turn-end events still arrive.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub message: String,
    pub fatal: bool,
}

/// End-to-end dialogue WebSocket client.
pub struct DialogClient {
    config: Arc<DialogConfig>,
    session_id: String,
    connect_id: String,
    logid: String,
    writer: Arc<Mutex<WsWriter>>,
    connected: Arc<AtomicBool>,
    session_started: Arc<AtomicBool>,
    receive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DialogClient {
    /// Connects to the dialogue service and sends StartConnection.
    ///
    /// Decoded frames go to `response_tx`; upstream and transport errors
    /// go to `error_tx`. On handshake failure no receive task is started.
    pub async fn connect(
        config: Arc<DialogConfig>,
        session_id: String,
        response_tx: mpsc::Sender<Frame>,
        error_tx: mpsc::UnboundedSender<UpstreamError>,
    ) -> Result<Self> {
        let connect_id = Uuid::new_v4().to_string();
        let request = ws_request(&config, &connect_id)?;

        info!("connecting to dialogue service: {}", config.base_url);
        let (ws_stream, response) = connect_async(request).await?;

        // The upstream does not answer pings; tungstenite never originates
        // them on its own, so nothing to disable here.
        let logid = response
            .headers()
            .get("X-Tt-Logid")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        info!("dialogue websocket connected, logid={}", logid);

        let (writer, reader) = ws_stream.split();
        let writer = Arc::new(Mutex::new(writer));
        let connected = Arc::new(AtomicBool::new(true));
        let session_started = Arc::new(AtomicBool::new(false));

        let client = Self {
            config,
            session_id,
            connect_id,
            logid,
            writer,
            connected: connected.clone(),
            session_started: session_started.clone(),
            receive_task: Mutex::new(None),
        };

        client
            .send_frame(build_event_frame(
                events::START_CONNECTION,
                "",
                &serde_json::json!({}),
            )?)
            .await?;
        debug!("StartConnection sent");

        let handle = tokio::spawn(receive_loop(
            reader,
            response_tx,
            error_tx,
            connected,
            session_started,
        ));
        *client.receive_task.lock().await = Some(handle);

        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_session_started(&self) -> bool {
        self.session_started.load(Ordering::Relaxed)
    }

    /// Server-side diagnostic id captured from the handshake response.
    pub fn logid(&self) -> &str {
        &self.logid
    }

    pub fn connect_id(&self) -> &str {
        &self.connect_id
    }

    /// Sends StartSession. Session readiness is signalled by a subsequent
    /// SessionStarted event observed by the receive task.
    pub async fn start_session(&self, input_mod: InputMod) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Closed);
        }
        if self.is_session_started() {
            debug!("session already started");
            return Ok(());
        }

        let payload = self.config.start_session_payload(input_mod);
        self.send_frame(build_event_frame(
            events::START_SESSION,
            &self.session_id,
            &payload,
        )?)
        .await?;
        info!(
            "StartSession sent, session_id={}, input_mod={}",
            self.session_id,
            input_mod.as_str()
        );
        Ok(())
    }

    /// Sends a PCM audio chunk (16kHz, 16bit, mono).
    ///
    /// Dropped with a warning when the session is not started.
    pub async fn send_audio(&self, audio: &[u8]) -> Result<()> {
        if !self.is_session_started() {
            warn!("cannot send audio: session not started");
            return Ok(());
        }

        self.send_frame(build_audio_frame(
            events::TASK_REQUEST,
            &self.session_id,
            audio,
        )?)
        .await?;
        debug!("audio sent: {} bytes", audio.len());
        Ok(())
    }

    /// Sends a text query turn.
    pub async fn send_text_query(&self, text: &str) -> Result<()> {
        if !self.is_session_started() {
            warn!("cannot send text query: session not started");
            return Ok(());
        }

        self.send_frame(build_event_frame(
            events::CHAT_TEXT_QUERY,
            &self.session_id,
            &serde_json::json!({"content": text}),
        )?)
        .await?;
        info!("TextQuery sent: {}", truncate(text, 50));
        Ok(())
    }

    /// Sends a greeting for the bot to speak.
    pub async fn say_hello(&self, content: Option<&str>) -> Result<()> {
        if !self.is_session_started() {
            warn!("cannot say hello: session not started");
            return Ok(());
        }

        let content = content.unwrap_or(DEFAULT_GREETING);
        self.send_frame(build_event_frame(
            events::SAY_HELLO,
            &self.session_id,
            &serde_json::json!({"content": content}),
        )?)
        .await?;
        info!("SayHello sent: {}", truncate(content, 30));
        Ok(())
    }

    /// Finishes the session while keeping the connection open.
    ///
    /// The started flag is cleared optimistically; the upstream still
    /// emits SessionFinished which the receive task observes.
    pub async fn finish_session(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        self.send_frame(build_event_frame(
            events::FINISH_SESSION,
            &self.session_id,
            &serde_json::json!({}),
        )?)
        .await?;
        self.session_started.store(false, Ordering::Relaxed);
        info!("FinishSession sent");
        Ok(())
    }

    /// Sends the connection-level FinishConnection event.
    pub async fn finish_connection(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        self.send_frame(build_event_frame(
            events::FINISH_CONNECTION,
            "",
            &serde_json::json!({}),
        )?)
        .await?;
        info!("FinishConnection sent");
        Ok(())
    }

    /// Closes the socket and waits for the receive task to terminate, so
    /// no read happens on a half-closed stream.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.session_started.store(false, Ordering::Relaxed);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.close().await {
                warn!("error closing websocket: {}", e);
            }
        }

        let handle = self.receive_task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("receive task did not stop within 5s");
            }
        }

        info!("dialogue client closed, logid={}", self.logid);
    }

    async fn send_frame(&self, data: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Binary(data.into())).await?;
        Ok(())
    }
}

/// Reads frames until the connection closes, maintaining session flags
/// and routing errors.
async fn receive_loop(
    mut reader: WsReader,
    response_tx: mpsc::Sender<Frame>,
    error_tx: mpsc::UnboundedSender<UpstreamError>,
    connected: Arc<AtomicBool>,
    session_started: Arc<AtomicBool>,
) {
    while let Some(msg) = reader.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                error!("dialogue receive error: {}", e);
                let _ = error_tx.send(UpstreamError {
                    message: format!("接收错误: {}", e),
                    fatal: true,
                });
                break;
            }
        };

        match msg {
            WsMessage::Binary(data) => {
                let frame = match parse_frame(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // A single malformed frame never kills the session.
                        warn!("dropping unparseable frame: {}", e);
                        continue;
                    }
                };
                if !handle_frame(frame, &response_tx, &error_tx, &session_started) {
                    continue;
                }
            }
            WsMessage::Close(close) => {
                info!("dialogue connection closed: {:?}", close);
                break;
            }
            other => {
                warn!("received non-binary message: {:?}", other);
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
    session_started.store(false, Ordering::Relaxed);
}

/// Routes one decoded frame. Returns false when the frame was consumed as
/// an error.
fn handle_frame(
    frame: Frame,
    response_tx: &mpsc::Sender<Frame>,
    error_tx: &mpsc::UnboundedSender<UpstreamError>,
    session_started: &AtomicBool,
) -> bool {
    if frame.event != 0 {
        if NOTABLE_EVENTS.contains(&frame.event) {
            info!("dialogue event: {} ({})", event_name(frame.event), frame.event);
        } else {
            debug!("dialogue event: {} ({})", event_name(frame.event), frame.event);
        }
    }

    match frame.event {
        events::SESSION_STARTED => {
            session_started.store(true, Ordering::Relaxed);
            let dialog_id = frame
                .payload_json()
                .ok()
                .and_then(|p| p.get("dialog_id").and_then(|v| v.as_str()).map(String::from))
                .unwrap_or_default();
            info!("session started, dialog_id={}", dialog_id);
        }
        events::SESSION_FINISHED => {
            session_started.store(false, Ordering::Relaxed);
            info!("session finished");
        }
        events::SESSION_FAILED => {
            session_started.store(false, Ordering::Relaxed);
            let message = frame
                .payload_json()
                .ok()
                .and_then(|p| p.get("error").and_then(|v| v.as_str()).map(String::from))
                .unwrap_or_else(|| "Session failed".to_string());
            error!("session failed: {}", message);
            let _ = error_tx.send(UpstreamError {
                message,
                fatal: true,
            });
            return false;
        }
        events::DIALOG_COMMON_ERROR => {
            let info = frame.payload_json().unwrap_or_default();
            let status_code = info
                .get("status_code")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let message = info
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Dialog error")
                .to_string();
            error!("dialog error: {} - {}", status_code, message);
            let _ = error_tx.send(UpstreamError {
                message: format!("{}: {}", status_code, message),
                fatal: false,
            });
            return false;
        }
        _ => {}
    }

    if frame.msg_type == MessageType::Error {
        let message = frame
            .payload_json()
            .ok()
            .and_then(|p| p.get("error").and_then(|v| v.as_str()).map(String::from))
            .unwrap_or_else(|| frame.payload_text());
        error!("server error {}: {}", frame.error_code, message);
        let _ = error_tx.send(UpstreamError {
            message,
            fatal: false,
        });
        return false;
    }

    // Bounded queue: drop with a warning on overflow rather than stall the
    // receive task. Session failures and dialog errors never reach this
    // path.
    if let Err(mpsc::error::TrySendError::Full(frame)) = response_tx.try_send(frame) {
        warn!(
            "response queue full, dropping {} frame",
            event_name(frame.event)
        );
    }
    true
}

fn ws_request(
    config: &DialogConfig,
    connect_id: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = config.base_url.as_str().into_client_request()?;

    let headers = request.headers_mut();
    headers.insert("X-Api-App-ID", header_value(&config.app_id)?);
    headers.insert("X-Api-Access-Key", header_value(&config.access_key)?);
    headers.insert("X-Api-Resource-Id", header_value(&config.resource_id)?);
    headers.insert("X-Api-App-Key", header_value(&config.app_key)?);
    headers.insert("X-Api-Connect-Id", header_value(connect_id)?);

    Ok(request)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("invalid header value: {}", e)))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageFlags;

    fn channels() -> (
        mpsc::Sender<Frame>,
        mpsc::Receiver<Frame>,
        mpsc::UnboundedSender<UpstreamError>,
        mpsc::UnboundedReceiver<UpstreamError>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let (etx, erx) = mpsc::unbounded_channel();
        (tx, rx, etx, erx)
    }

    fn event_frame(event: i32, payload: serde_json::Value) -> Frame {
        Frame {
            msg_type: MessageType::FullServer,
            flags: MessageFlags::WithEvent,
            event,
            session_id: "sess".to_string(),
            payload: payload.to_string().into_bytes(),
            ..Default::default()
        }
    }

    #[test]
    fn session_started_sets_flag_and_forwards() {
        let (tx, mut rx, etx, _erx) = channels();
        let started = AtomicBool::new(false);

        let frame = event_frame(events::SESSION_STARTED, serde_json::json!({"dialog_id": "d1"}));
        assert!(handle_frame(frame, &tx, &etx, &started));

        assert!(started.load(Ordering::Relaxed));
        assert_eq!(rx.try_recv().unwrap().event, events::SESSION_STARTED);
    }

    #[test]
    fn session_failed_is_fatal_and_not_forwarded() {
        let (tx, mut rx, etx, mut erx) = channels();
        let started = AtomicBool::new(true);

        let frame = event_frame(events::SESSION_FAILED, serde_json::json!({"error": "no quota"}));
        assert!(!handle_frame(frame, &tx, &etx, &started));

        assert!(!started.load(Ordering::Relaxed));
        let err = erx.try_recv().unwrap();
        assert!(err.fatal);
        assert_eq!(err.message, "no quota");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dialog_common_error_is_nonfatal() {
        let (tx, _rx, etx, mut erx) = channels();
        let started = AtomicBool::new(true);

        let frame = event_frame(
            events::DIALOG_COMMON_ERROR,
            serde_json::json!({"status_code": 550, "message": "rate limited"}),
        );
        assert!(!handle_frame(frame, &tx, &etx, &started));

        let err = erx.try_recv().unwrap();
        assert!(!err.fatal);
        assert_eq!(err.message, "550: rate limited");
        // Session flag is untouched by per-turn errors.
        assert!(started.load(Ordering::Relaxed));
    }

    #[test]
    fn server_error_frame_is_nonfatal() {
        let (tx, _rx, etx, mut erx) = channels();
        let started = AtomicBool::new(true);

        let frame = Frame {
            msg_type: MessageType::Error,
            error_code: 45000001,
            payload: br#"{"error":"bad audio"}"#.to_vec(),
            ..Default::default()
        };
        assert!(!handle_frame(frame, &tx, &etx, &started));

        let err = erx.try_recv().unwrap();
        assert!(!err.fatal);
        assert_eq!(err.message, "bad audio");
    }

    #[test]
    fn queue_overflow_drops_frames() {
        let (tx, mut rx, etx, _erx) = channels();
        let started = AtomicBool::new(true);

        for _ in 0..10 {
            let frame = event_frame(events::CHAT_RESPONSE, serde_json::json!({"content": "hi"}));
            handle_frame(frame, &tx, &etx, &started);
        }

        // Channel capacity is 8 in this test; the overflow was dropped.
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 8);
    }
}
