//! Staged-pipeline WebSocket endpoint.
//!
//! Wires discrete ASR, LLM, and TTS services into one turn flow: audio
//! chunks stream into the recognizer, `audio_end` closes the utterance,
//! and the recognized text drives one LLM → splitter → TTS turn whose
//! chunks stream back to the client.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use ponytalk_pipeline::{
    AsrClient, Error as PipelineError, LlmClient, ProcessorEvent, StreamProcessor, TtsClient,
};
use ponytalk_text::{parse_reply, ContextManager, Emotion};

use crate::messages::{ClientMessage, ErrorCode, Outbound, ServerMessage};
use crate::AppState;

pub async fn staged_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("staged websocket client connected");
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

    let out = Outbound::new(out_tx);
    let mut conn = match StagedConnection::new(state.settings, out.clone()) {
        Ok(conn) => conn,
        Err(e) => {
            out.error(ErrorCode::UnknownError, e.to_string()).await;
            drop(out);
            let _ = writer.await;
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => conn.handle_message(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("staged websocket error: {}", e);
                break;
            }
        }
    }

    conn.shutdown().await;
    drop(conn);
    drop(out);
    let _ = writer.await;
    info!("staged websocket disconnected");
}

/// Per-connection state for the staged path.
struct StagedConnection {
    settings: Arc<crate::settings::Settings>,
    out: Outbound,
    asr: Option<Arc<AsrClient>>,
    asr_task: Option<tokio::task::JoinHandle<()>>,
    /// Last final recognition of the current utterance.
    final_text: Arc<Mutex<String>>,
    context: Arc<Mutex<ContextManager>>,
    processor: Arc<StreamProcessor>,
    current_emotion: Arc<Mutex<Emotion>>,
    turn_task: Option<tokio::task::JoinHandle<()>>,
}

impl StagedConnection {
    fn new(
        settings: Arc<crate::settings::Settings>,
        out: Outbound,
    ) -> Result<Self, PipelineError> {
        let llm = LlmClient::new(settings.llm.clone())?;
        let tts = TtsClient::new(settings.tts.clone());
        let processor = Arc::new(StreamProcessor::new(Arc::new(llm), Arc::new(tts)));
        let context = Arc::new(Mutex::new(ContextManager::new(settings.context.clone())));

        Ok(Self {
            settings,
            out,
            asr: None,
            asr_task: None,
            final_text: Arc::new(Mutex::new(String::new())),
            context,
            processor,
            current_emotion: Arc::new(Mutex::new(Emotion::default())),
            turn_task: None,
        })
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
            "audio_data" => {
                let audio = message.str_field("audio").to_string();
                if audio.is_empty() {
                    return;
                }
                let seq = message
                    .data
                    .get("seq")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32;
                self.handle_audio(&audio, seq).await;
            }
            "audio_end" => self.handle_audio_end().await,
            "interrupt" => {
                self.processor.interrupt();
                self.out
                    .send(ServerMessage::TtsEnd {
                        full_text: String::new(),
                    })
                    .await;
            }
            other => {
                self.out
                    .error(ErrorCode::UnknownError, format!("未知消息类型: {}", other))
                    .await;
            }
        }
    }

    async fn handle_audio(&mut self, audio: &str, seq: i32) {
        if self.asr.as_ref().is_none_or(|a| !a.is_connected()) {
            if !self.start_asr().await {
                return;
            }
        }
        if let Some(asr) = &self.asr {
            if let Err(e) = asr.send_audio(audio, seq, false).await {
                warn!("asr send audio failed: {}", e);
            }
        }
    }

    async fn start_asr(&mut self) -> bool {
        let (result_tx, mut result_rx) = mpsc::channel(64);

        let asr = match AsrClient::connect(&self.settings.asr, result_tx).await {
            Ok(asr) => Arc::new(asr),
            Err(e) => {
                self.out
                    .error(ErrorCode::AsrError, format!("ASR 连接失败: {}", e))
                    .await;
                return false;
            }
        };

        let out = self.out.clone();
        let final_text = self.final_text.clone();
        self.asr_task = Some(tokio::spawn(async move {
            while let Some(result) = result_rx.recv().await {
                match result {
                    Ok(update) => {
                        if update.is_final {
                            *final_text.lock().await = update.text.clone();
                        }
                        out.send(ServerMessage::AsrResult {
                            text: update.text,
                            is_final: update.is_final,
                        })
                        .await;
                    }
                    Err(e) => out.error(ErrorCode::AsrError, e.to_string()).await,
                }
            }
        }));

        self.asr = Some(asr);
        true
    }

    /// Closes the utterance, reports the recognized text, and runs one
    /// pipeline turn over it.
    async fn handle_audio_end(&mut self) {
        let Some(asr) = self.asr.take() else {
            return;
        };

        if let Err(e) = asr.finish().await {
            warn!("asr finish failed: {}", e);
        }

        // The final hypothesis arrives on the result channel before the
        // recognizer closes it.
        if let Some(task) = self.asr_task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("asr result stream did not settle within 5s");
                abort.abort();
            }
        }
        asr.close().await;

        let text = std::mem::take(&mut *self.final_text.lock().await);
        self.out
            .send(ServerMessage::AsrEnd { text: text.clone() })
            .await;

        if !text.is_empty() {
            self.run_turn(text);
        }
    }

    /// Spawns one LLM → splitter → TTS turn; chunks stream back as they
    /// are synthesized.
    fn run_turn(&mut self, user_text: String) {
        let context = self.context.clone();
        let processor = self.processor.clone();
        let current_emotion = self.current_emotion.clone();
        let out = self.out.clone();

        self.turn_task = Some(tokio::spawn(async move {
            let messages = {
                let mut context = context.lock().await;
                context.add_user_message(user_text);
                context.messages().to_vec()
            };

            let mut events = Box::pin(processor.process(messages));
            while let Some(event) = events.next().await {
                match event {
                    Ok(ProcessorEvent::Chunk(chunk)) => {
                        out.send(ServerMessage::TtsChunk {
                            text: chunk.text,
                            audio: BASE64.encode(&chunk.audio),
                            seq: chunk.seq,
                            is_final: chunk.is_final,
                        })
                        .await;
                    }
                    Ok(ProcessorEvent::Emotion(emotion)) => {
                        let mut current = current_emotion.lock().await;
                        if *current != emotion {
                            info!(
                                "emotion changed: {} -> {}",
                                current.as_str(),
                                emotion.as_str()
                            );
                            *current = emotion;
                            out.send(ServerMessage::Emotion { emotion }).await;
                        }
                    }
                    Ok(ProcessorEvent::Done {
                        full_text,
                        interrupted,
                    }) => {
                        // An interrupted turn already got its tts_end from
                        // the interrupt handler; its partial reply is not
                        // remembered.
                        if !interrupted {
                            let content = parse_reply(&full_text).content;
                            context.lock().await.add_assistant_message(&content);
                            out.send(ServerMessage::TtsEnd { full_text: content }).await;
                        }
                    }
                    Err(e) => {
                        out.error(error_code_for(&e), e.to_string()).await;
                        break;
                    }
                }
            }
        }));
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.turn_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.asr_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(asr) = self.asr.take() {
            asr.close().await;
        }
    }
}

/// Maps pipeline failures onto the client error taxonomy.
fn error_code_for(error: &PipelineError) -> ErrorCode {
    match error {
        PipelineError::Asr(_) => ErrorCode::AsrError,
        PipelineError::Llm(_) | PipelineError::Http(_) => ErrorCode::LlmError,
        PipelineError::Tts(_) => ErrorCode::TtsError,
        PipelineError::WebSocket(_) => ErrorCode::NetworkError,
        _ => ErrorCode::UnknownError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_their_codes() {
        assert_eq!(
            error_code_for(&PipelineError::Asr("x".to_string())),
            ErrorCode::AsrError
        );
        assert_eq!(
            error_code_for(&PipelineError::Llm("x".to_string())),
            ErrorCode::LlmError
        );
        assert_eq!(
            error_code_for(&PipelineError::Tts("x".to_string())),
            ErrorCode::TtsError
        );
        assert_eq!(
            error_code_for(&PipelineError::Json(
                serde_json::from_str::<serde_json::Value>("{{").unwrap_err()
            )),
            ErrorCode::UnknownError
        );
    }
}
