//! Stream processor: LLM output → sentence splitting → per-sentence TTS.
//!
//! Drives one user turn through the staged pipeline and yields chunks as
//! they become speakable. A TTS failure degrades that sentence to a
//! text-only chunk rather than aborting the turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::Stream;
use futures::StreamExt;
use tracing::{debug, info, warn};

use ponytalk_text::{parse_reply, strip_markup, Emotion, Message, SentenceSplitter};

use crate::error::Result;
use crate::llm::ChatModel;
use crate::tts::Synthesizer;

/// One speakable chunk of the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsChunk {
    pub text: String,
    /// Synthesized audio; empty when synthesis failed for this sentence.
    pub audio: Vec<u8>,
    pub seq: i32,
    pub is_final: bool,
}

/// Events yielded while processing one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    Chunk(TtsChunk),
    /// Parsed from the complete reply once the model is done.
    Emotion(Emotion),
    /// Turn finished; carries the raw accumulated reply.
    Done { full_text: String, interrupted: bool },
}

/// LLM + splitter + TTS composition for one connection.
pub struct StreamProcessor {
    chat: Arc<dyn ChatModel>,
    tts: Arc<dyn Synthesizer>,
    interrupted: Arc<AtomicBool>,
}

impl StreamProcessor {
    pub fn new(chat: Arc<dyn ChatModel>, tts: Arc<dyn Synthesizer>) -> Self {
        Self {
            chat,
            tts,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops the current turn at the next sentence boundary.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        info!("stream processor interrupted");
    }

    /// Processes one turn against the given history.
    ///
    /// Chunks carry ascending sequence numbers starting at 0. The final
    /// emotion is parsed from the complete reply and yielded before
    /// `Done`.
    pub fn process(
        &self,
        messages: Vec<Message>,
    ) -> impl Stream<Item = Result<ProcessorEvent>> + Send + 'static {
        let chat = self.chat.clone();
        let tts = self.tts.clone();
        let interrupted = self.interrupted.clone();
        interrupted.store(false, Ordering::Relaxed);

        try_stream! {
            let mut splitter = SentenceSplitter::new();
            let mut full_text = String::new();
            let mut seq = 0;

            let mut deltas = chat.chat_stream(messages);
            'turn: while let Some(delta) = deltas.next().await {
                let delta = delta?;
                if interrupted.load(Ordering::Relaxed) {
                    info!("turn interrupted, stopping model stream");
                    break 'turn;
                }
                full_text.push_str(&delta);

                for sentence in splitter.feed(&delta) {
                    if interrupted.load(Ordering::Relaxed) {
                        break 'turn;
                    }
                    debug!("processing sentence {}: {}", seq, sentence);
                    if let Some(chunk) = synthesize_chunk(tts.as_ref(), &sentence, seq).await {
                        seq += 1;
                        yield ProcessorEvent::Chunk(chunk);
                    }
                }
            }

            let was_interrupted = interrupted.load(Ordering::Relaxed);
            if !was_interrupted {
                if let Some(rest) = splitter.flush() {
                    if let Some(chunk) = synthesize_chunk(tts.as_ref(), &rest, seq).await {
                        yield ProcessorEvent::Chunk(chunk);
                    }
                }
            }

            if !full_text.is_empty() {
                yield ProcessorEvent::Emotion(parse_reply(&full_text).emotion);
            }
            yield ProcessorEvent::Done {
                full_text,
                interrupted: was_interrupted,
            };
        }
    }
}

/// Cleans a sentence and synthesizes it; markup-only sentences are
/// skipped, synthesis failures degrade to text-only chunks.
async fn synthesize_chunk(tts: &dyn Synthesizer, sentence: &str, seq: i32) -> Option<TtsChunk> {
    let clean = strip_markup(sentence);
    if clean.is_empty() {
        return None;
    }

    match tts.synthesize(&clean).await {
        Ok(audio) => Some(TtsChunk {
            text: clean,
            audio: audio.data,
            seq,
            is_final: false,
        }),
        Err(e) => {
            warn!("tts failed for sentence: {}", e);
            Some(TtsChunk {
                text: clean,
                audio: Vec::new(),
                seq,
                is_final: false,
            })
        }
    }
}
