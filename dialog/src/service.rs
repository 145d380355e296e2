//! Dialogue service: a normalized event stream over the wire client.
//!
//! Owns one [`DialogClient`] and the queues it publishes into, and
//! translates raw frames into [`DialogEvent`]s. Interruption is local
//! only: the upstream keeps streaming until the turn ends, and this layer
//! drops the stale events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{DialogClient, UpstreamError};
use crate::config::{DialogConfig, InputMod};
use crate::error::{Error, Result};
use crate::protocol::{events, Frame, MessageType};
use crate::types::DialogEvent;

/// Capacity of the decoded-frame queue. Overflow drops frames with a
/// warning in the client receive task.
const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// How long to wait for SessionStarted after sending StartSession.
const SESSION_START_TIMEOUT: Duration = Duration::from_secs(10);

/// End-to-end dialogue service.
pub struct DialogService {
    config: Arc<DialogConfig>,
    client: Option<DialogClient>,
    session_id: String,
    response_rx: Option<mpsc::Receiver<Frame>>,
    error_rx: Option<mpsc::UnboundedReceiver<UpstreamError>>,
    interrupted: Arc<AtomicBool>,
}

impl DialogService {
    pub fn new(config: DialogConfig) -> Self {
        Self {
            config: Arc::new(config),
            client: None,
            session_id: String::new(),
            response_rx: None,
            error_rx: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The server-visible session id, fresh per connect.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_connected())
    }

    pub fn is_session_started(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_session_started())
    }

    /// Connects to the dialogue service under a fresh session UUID.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.session_id = Uuid::new_v4().to_string();
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let client = DialogClient::connect(
            self.config.clone(),
            self.session_id.clone(),
            response_tx,
            error_tx,
        )
        .await?;

        self.client = Some(client);
        self.response_rx = Some(response_rx);
        self.error_rx = Some(error_rx);
        info!("dialogue service connected, session_id={}", self.session_id);
        Ok(())
    }

    /// Starts the session and blocks until SessionStarted arrives.
    ///
    /// Frames drained while waiting are connection bootstrap events the
    /// owner does not need and are discarded.
    pub async fn start_session(&mut self, input_mod: InputMod) -> Result<()> {
        let client = self.client.as_ref().ok_or(Error::Closed)?;
        client.start_session(input_mod).await?;

        let response_rx = self.response_rx.as_mut().ok_or(Error::Closed)?;
        let wait = async {
            while let Some(frame) = response_rx.recv().await {
                if frame.event == events::SESSION_STARTED {
                    return Ok(());
                }
                debug!("discarding bootstrap frame, event={}", frame.event);
            }
            Err(Error::Closed)
        };

        match tokio::time::timeout(SESSION_START_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("SessionStarted")),
        }
    }

    /// Forwards base64-encoded PCM audio. Ignored when the session is not
    /// ready.
    pub async fn send_audio(&self, audio_base64: &str) -> Result<()> {
        let Some(client) = self.client.as_ref() else {
            warn!("cannot send audio: not connected");
            return Ok(());
        };
        let audio = BASE64.decode(audio_base64)?;
        client.send_audio(&audio).await
    }

    /// Sends a text query, starting a fresh turn.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let Some(client) = self.client.as_ref() else {
            warn!("cannot send text: not connected");
            return Ok(());
        };
        self.interrupted.store(false, Ordering::Relaxed);
        client.send_text_query(text).await
    }

    /// Asks the bot to greet, starting a fresh turn.
    pub async fn say_hello(&self, content: Option<&str>) -> Result<()> {
        let Some(client) = self.client.as_ref() else {
            warn!("cannot say hello: not connected");
            return Ok(());
        };
        self.interrupted.store(false, Ordering::Relaxed);
        client.say_hello(content).await
    }

    /// Interrupts the current reply. Idempotent; never cancels the
    /// transport, only filters downstream events.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        info!("response interrupted");
    }

    /// Takes the normalized event stream. Call once after `start_session`.
    pub fn take_events(&mut self) -> Option<DialogEvents> {
        let response_rx = self.response_rx.take()?;
        let error_rx = self.error_rx.take()?;
        Some(DialogEvents {
            response_rx,
            error_rx,
            error_closed: false,
            done: false,
            interrupted: self.interrupted.clone(),
        })
    }

    pub async fn finish_session(&self) -> Result<()> {
        if let Some(client) = self.client.as_ref() {
            client.finish_session().await?;
        }
        Ok(())
    }

    /// Gracefully finishes the session and connection, then tears the
    /// client down.
    pub async fn close(&self) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.finish_session().await {
                warn!("error during graceful shutdown: {}", e);
            }
            if let Err(e) = client.finish_connection().await {
                warn!("error during graceful shutdown: {}", e);
            }
            client.close().await;
        }
        info!("dialogue service closed");
    }
}

/// The normalized event stream of one dialogue connection.
pub struct DialogEvents {
    response_rx: mpsc::Receiver<Frame>,
    error_rx: mpsc::UnboundedReceiver<UpstreamError>,
    error_closed: bool,
    done: bool,
    interrupted: Arc<AtomicBool>,
}

impl DialogEvents {
    /// Receives the next normalized event.
    ///
    /// Returns `None` after a fatal error or once the upstream closed.
    /// Queued errors take priority over queued frames.
    pub async fn recv(&mut self) -> Option<DialogEvent> {
        enum Next {
            Frame(Option<Frame>),
            Error(Option<UpstreamError>),
        }

        loop {
            if self.done {
                return None;
            }

            match self.error_rx.try_recv() {
                Ok(err) => return Some(self.error_event(err)),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.error_closed = true,
            }

            let error_open = !self.error_closed;
            let next = tokio::select! {
                frame = self.response_rx.recv() => Next::Frame(frame),
                err = self.error_rx.recv(), if error_open => Next::Error(err),
            };

            match next {
                Next::Frame(Some(frame)) => {
                    if let Some(event) = self.filter_convert(frame) {
                        return Some(event);
                    }
                }
                Next::Frame(None) => {
                    self.done = true;
                    return Some(DialogEvent::Error {
                        message: "连接已断开".to_string(),
                        fatal: true,
                    });
                }
                Next::Error(Some(err)) => return Some(self.error_event(err)),
                Next::Error(None) => self.error_closed = true,
            }
        }
    }

    fn error_event(&mut self, err: UpstreamError) -> DialogEvent {
        if err.fatal {
            self.done = true;
        }
        DialogEvent::Error {
            message: err.message,
            fatal: err.fatal,
        }
    }

    /// Applies the interruption filter, then converts.
    ///
    /// While interrupted, every event of the stale turn is dropped; the
    /// filter clears when the upstream signals a new turn.
    fn filter_convert(&mut self, frame: Frame) -> Option<DialogEvent> {
        if self.interrupted.load(Ordering::Relaxed) {
            if matches!(
                frame.event,
                events::ASR_INFO | events::CHAT_TEXT_QUERY_CONFIRMED
            ) {
                self.interrupted.store(false, Ordering::Relaxed);
            } else {
                debug!("dropping interrupted-turn frame, event={}", frame.event);
                return None;
            }
        }
        convert_frame(&frame)
    }
}

/// Translates one upstream frame into a normalized event.
///
/// Events the owner does not need yield `None`.
pub fn convert_frame(frame: &Frame) -> Option<DialogEvent> {
    let payload = frame.payload_json().ok();

    match frame.event {
        events::ASR_INFO => {
            let question_id = payload
                .as_ref()
                .and_then(|p| p.get("question_id").and_then(|v| v.as_str()))
                .unwrap_or_default()
                .to_string();
            Some(DialogEvent::AsrStarted { question_id })
        }
        events::ASR_RESPONSE => {
            let payload = payload?;
            let results = payload.get("results")?.as_array()?;
            for result in results {
                let text = result.get("text").and_then(|v| v.as_str()).unwrap_or("");
                if text.is_empty() {
                    continue;
                }
                let is_interim = result
                    .get("is_interim")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                return Some(DialogEvent::AsrResult {
                    text: text.to_string(),
                    is_final: !is_interim,
                });
            }
            None
        }
        events::ASR_ENDED => Some(DialogEvent::AsrEnded),
        events::CHAT_RESPONSE => {
            let payload = payload?;
            let text = payload.get("content").and_then(|v| v.as_str())?;
            if text.is_empty() {
                return None;
            }
            Some(DialogEvent::ChatText {
                text: text.to_string(),
                question_id: str_field(&payload, "question_id"),
                reply_id: str_field(&payload, "reply_id"),
            })
        }
        events::CHAT_ENDED => Some(DialogEvent::ChatEnded(payload.unwrap_or_default())),
        events::TTS_SENTENCE_START => {
            let payload = payload?;
            let tts_type = payload
                .get("tts_type")
                .and_then(|v| v.as_str())
                .unwrap_or("default")
                .to_string();
            Some(DialogEvent::TtsStart {
                tts_type,
                text: str_field(&payload, "text"),
            })
        }
        events::TTS_RESPONSE => {
            if frame.msg_type == MessageType::ServerAck && !frame.payload.is_empty() {
                Some(DialogEvent::TtsChunk {
                    audio: frame.payload.clone(),
                })
            } else {
                None
            }
        }
        events::TTS_ENDED => Some(DialogEvent::TtsEnded(payload.unwrap_or_default())),
        events::USAGE => {
            debug!("usage: {}", frame.payload_text());
            None
        }
        _ => None,
    }
}

fn str_field(payload: &serde_json::Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageFlags;
    use serde_json::json;

    fn server_frame(event: i32, payload: serde_json::Value) -> Frame {
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
    fn converts_asr_events() {
        let frame = server_frame(events::ASR_INFO, json!({"question_id": "q1"}));
        assert_eq!(
            convert_frame(&frame),
            Some(DialogEvent::AsrStarted {
                question_id: "q1".to_string()
            })
        );

        let frame = server_frame(
            events::ASR_RESPONSE,
            json!({"results": [{"text": "你好", "is_interim": false}]}),
        );
        assert_eq!(
            convert_frame(&frame),
            Some(DialogEvent::AsrResult {
                text: "你好".to_string(),
                is_final: true
            })
        );

        // Empty results are not forwarded.
        let frame = server_frame(events::ASR_RESPONSE, json!({"results": [{"text": ""}]}));
        assert_eq!(convert_frame(&frame), None);

        let frame = server_frame(events::ASR_ENDED, json!({}));
        assert_eq!(convert_frame(&frame), Some(DialogEvent::AsrEnded));
    }

    #[test]
    fn converts_chat_events() {
        let frame = server_frame(
            events::CHAT_RESPONSE,
            json!({"content": "我在", "question_id": "q1", "reply_id": "r1"}),
        );
        assert_eq!(
            convert_frame(&frame),
            Some(DialogEvent::ChatText {
                text: "我在".to_string(),
                question_id: "q1".to_string(),
                reply_id: "r1".to_string(),
            })
        );

        let frame = server_frame(events::CHAT_RESPONSE, json!({"content": ""}));
        assert_eq!(convert_frame(&frame), None);
    }

    #[test]
    fn converts_tts_audio_chunks() {
        let frame = Frame {
            msg_type: MessageType::ServerAck,
            flags: MessageFlags::WithEvent,
            event: events::TTS_RESPONSE,
            payload: vec![1, 2, 3],
            ..Default::default()
        };
        assert_eq!(
            convert_frame(&frame),
            Some(DialogEvent::TtsChunk {
                audio: vec![1, 2, 3]
            })
        );

        // A TTSResponse without the ACK message type carries no audio.
        let frame = server_frame(events::TTS_RESPONSE, json!({}));
        assert_eq!(convert_frame(&frame), None);
    }

    #[test]
    fn ignores_unknown_events() {
        let frame = server_frame(997, json!({"x": 1}));
        assert_eq!(convert_frame(&frame), None);
        let frame = server_frame(events::CHAT_TEXT_QUERY_CONFIRMED, json!({}));
        assert_eq!(convert_frame(&frame), None);
    }

    #[tokio::test]
    async fn interrupt_drops_until_new_turn() {
        let (tx, rx) = mpsc::channel(16);
        let (_etx, erx) = mpsc::unbounded_channel();
        let interrupted = Arc::new(AtomicBool::new(false));
        let mut events_stream = DialogEvents {
            response_rx: rx,
            error_rx: erx,
            error_closed: false,
            done: false,
            interrupted: interrupted.clone(),
        };

        interrupted.store(true, Ordering::Relaxed);

        // Stale turn frames are dropped.
        tx.send(server_frame(events::CHAT_RESPONSE, json!({"content": "旧回复"})))
            .await
            .unwrap();
        tx.send(Frame {
            msg_type: MessageType::ServerAck,
            flags: MessageFlags::WithEvent,
            event: events::TTS_RESPONSE,
            payload: vec![9, 9],
            ..Default::default()
        })
        .await
        .unwrap();

        // A new turn clears the filter and is delivered.
        tx.send(server_frame(events::ASR_INFO, json!({"question_id": "q2"})))
            .await
            .unwrap();

        let event = events_stream.recv().await.unwrap();
        assert_eq!(
            event,
            DialogEvent::AsrStarted {
                question_id: "q2".to_string()
            }
        );
        assert!(!interrupted.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn fatal_error_ends_stream() {
        let (_tx, rx) = mpsc::channel(4);
        let (etx, erx) = mpsc::unbounded_channel();
        let mut events_stream = DialogEvents {
            response_rx: rx,
            error_rx: erx,
            error_closed: false,
            done: false,
            interrupted: Arc::new(AtomicBool::new(false)),
        };

        etx.send(UpstreamError {
            message: "session failed".to_string(),
            fatal: true,
        })
        .unwrap();

        assert_eq!(
            events_stream.recv().await,
            Some(DialogEvent::Error {
                message: "session failed".to_string(),
                fatal: true
            })
        );
        assert_eq!(events_stream.recv().await, None);
    }

    #[tokio::test]
    async fn closed_upstream_yields_fatal_error() {
        let (tx, rx) = mpsc::channel(4);
        let (etx, erx) = mpsc::unbounded_channel();
        let mut events_stream = DialogEvents {
            response_rx: rx,
            error_rx: erx,
            error_closed: false,
            done: false,
            interrupted: Arc::new(AtomicBool::new(false)),
        };

        drop(tx);
        drop(etx);

        match events_stream.recv().await {
            Some(DialogEvent::Error { fatal: true, .. }) => {}
            other => panic!("expected fatal error, got {:?}", other),
        }
        assert_eq!(events_stream.recv().await, None);
    }
}
