//! End-to-end dialogue WebSocket endpoint.
//!
//! One connection manager per accepted socket. Three concurrent
//! activities while the client is connected: the reader routing inbound
//! envelopes, the forwarder draining normalized dialogue events, and a
//! writer task owning the socket sink.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ponytalk_dialog::{DialogEvent, DialogEvents, DialogService, InputMod};

use crate::messages::{ClientMessage, ErrorCode, Outbound, ServerMessage};
use crate::AppState;

pub async fn e2e_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("e2e websocket client connected");
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(64);
    let writer = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if sink
                .send(Message::Text(value.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = E2eConnection::new(state.settings, Outbound::new(out_tx));

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => conn.handle_message(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("e2e websocket error: {}", e);
                break;
            }
        }
    }

    conn.shutdown().await;
    drop(conn);
    let _ = writer.await;
    info!("e2e websocket disconnected");
}

/// Per-connection state for the end-to-end path.
struct E2eConnection {
    settings: Arc<crate::settings::Settings>,
    out: Outbound,
    dialog: Option<Arc<DialogService>>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

impl E2eConnection {
    fn new(settings: Arc<crate::settings::Settings>, out: Outbound) -> Self {
        Self {
            settings,
            out,
            dialog: None,
            forwarder: None,
        }
    }

    async fn handle_message(&mut self, raw: &str) {
        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.out
                    .error(ErrorCode::UnknownError, format!("Invalid JSON: {}", e))
                    .await;
                return;
            }
        };

        match message.kind.as_str() {
            "start_session" => {
                let input_mod = InputMod::parse(message.str_field("input_mod"));
                self.start_session(input_mod).await;
            }
            "audio_data" => {
                let audio = message.str_field("audio");
                if audio.is_empty() {
                    return;
                }
                if let Some(dialog) = &self.dialog {
                    if let Err(e) = dialog.send_audio(audio).await {
                        warn!("failed to send audio: {}", e);
                    }
                }
            }
            "text_query" => {
                let text = message.str_field("text");
                if text.is_empty() {
                    return;
                }
                if let Some(dialog) = &self.dialog {
                    if let Err(e) = dialog.send_text(text).await {
                        warn!("failed to send text query: {}", e);
                    }
                }
            }
            "say_hello" => {
                let content = message.data.get("content").and_then(|v| v.as_str());
                if let Some(dialog) = &self.dialog {
                    if let Err(e) = dialog.say_hello(content).await {
                        warn!("failed to say hello: {}", e);
                    }
                }
            }
            "interrupt" => {
                if let Some(dialog) = &self.dialog {
                    dialog.interrupt();
                    self.out
                        .send(ServerMessage::TtsEnd {
                            full_text: String::new(),
                        })
                        .await;
                }
            }
            "finish_session" => {
                if let Some(dialog) = &self.dialog {
                    if let Err(e) = dialog.finish_session().await {
                        warn!("failed to finish session: {}", e);
                    }
                }
            }
            other => {
                self.out
                    .error(ErrorCode::UnknownError, format!("未知消息类型: {}", other))
                    .await;
            }
        }
    }

    async fn start_session(&mut self, input_mod: InputMod) {
        if let Some(dialog) = &self.dialog {
            // Already live; tell the client the session id again.
            self.out
                .send(ServerMessage::SessionStarted {
                    session_id: dialog.session_id().to_string(),
                })
                .await;
            return;
        }

        let mut service = DialogService::new(self.settings.dialog.clone());
        if let Err(e) = service.connect().await {
            warn!("e2e connect failed: {}", e);
            self.out
                .error(ErrorCode::NetworkError, "连接端到端语音服务失败")
                .await;
            return;
        }

        if let Err(e) = service.start_session(input_mod).await {
            warn!("e2e start session failed: {}", e);
            self.out
                .error(ErrorCode::NetworkError, "启动端到端会话失败")
                .await;
            service.close().await;
            return;
        }

        let Some(events) = service.take_events() else {
            self.out
                .error(ErrorCode::UnknownError, "会话事件流不可用")
                .await;
            return;
        };

        let session_id = service.session_id().to_string();
        self.dialog = Some(Arc::new(service));
        self.forwarder = Some(tokio::spawn(forward_events(events, self.out.clone())));

        info!("e2e session started, session_id={}", session_id);
        self.out
            .send(ServerMessage::SessionStarted { session_id })
            .await;
    }

    async fn shutdown(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
        if let Some(dialog) = self.dialog.take() {
            dialog.close().await;
        }
    }
}

/// Drains normalized events into client envelopes until the stream ends
/// or a fatal error arrives.
async fn forward_events(mut events: DialogEvents, out: Outbound) {
    let mut turn = TurnTracker::default();

    while let Some(event) = events.recv().await {
        let fatal = matches!(&event, DialogEvent::Error { fatal: true, .. });
        for message in turn.on_event(event) {
            out.send(message).await;
        }
        if fatal {
            return;
        }
    }
}

/// Translates dialogue events into envelopes, owning the per-turn
/// sequence counter and the accumulated reply text.
#[derive(Default)]
struct TurnTracker {
    tts_seq: i32,
    full_text: String,
}

impl TurnTracker {
    fn on_event(&mut self, event: DialogEvent) -> Vec<ServerMessage> {
        match event {
            DialogEvent::AsrStarted { question_id } => {
                // A new user turn resets the reply state.
                debug!("asr started, question_id={}", question_id);
                self.tts_seq = 0;
                self.full_text.clear();
                Vec::new()
            }
            DialogEvent::AsrResult { text, is_final } => {
                vec![ServerMessage::AsrResult { text, is_final }]
            }
            DialogEvent::AsrEnded => vec![ServerMessage::AsrEnd {
                text: String::new(),
            }],
            DialogEvent::ChatText { text, .. } => {
                self.full_text.push_str(&text);
                vec![ServerMessage::ChatText { text }]
            }
            DialogEvent::ChatEnded(_) => {
                debug!("chat ended, full text: {} chars", self.full_text.chars().count());
                Vec::new()
            }
            DialogEvent::TtsStart { tts_type, .. } => {
                debug!("tts started, type={}", tts_type);
                Vec::new()
            }
            DialogEvent::TtsChunk { audio } => {
                if audio.is_empty() {
                    return Vec::new();
                }
                let message = ServerMessage::TtsChunk {
                    text: String::new(),
                    audio: BASE64.encode(&audio),
                    seq: self.tts_seq,
                    is_final: false,
                };
                self.tts_seq += 1;
                vec![message]
            }
            DialogEvent::TtsEnded(_) => {
                let message = ServerMessage::TtsEnd {
                    full_text: std::mem::take(&mut self.full_text),
                };
                self.tts_seq = 0;
                vec![message]
            }
            DialogEvent::Error { message, fatal } => {
                if fatal {
                    vec![ServerMessage::Error {
                        code: ErrorCode::UnknownError,
                        message,
                    }]
                } else {
                    warn!("e2e non-fatal error: {}", message);
                    Vec::new()
                }
            }
        }
    }
}
