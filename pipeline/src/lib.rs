//! Staged voice pipeline: discrete ASR, LLM, and TTS services composed
//! into one turn-by-turn flow.
//!
//! Used when the operator wires the stages independently instead of the
//! end-to-end dialogue service:
//!
//! 1. [`AsrClient`] streams microphone audio to the SAUC bigmodel
//!    recognizer.
//! 2. The recognized turn goes through the dialogue context into
//!    [`LlmClient`].
//! 3. [`StreamProcessor`] splits the streamed reply into sentences and
//!    synthesizes each one with [`TtsClient`], yielding
//!    [`TtsChunk`]s as they become speakable.

mod asr;
mod error;
mod llm;
mod processor;
mod tts;

pub use asr::{AsrClient, AsrConfig, AsrUpdate, DEFAULT_ASR_URL, RESOURCE_ASR_STREAM};
pub use error::{Error, Result};
pub use llm::{ChatModel, LlmClient, LlmConfig, LlmReply, DEFAULT_LLM_URL, SYSTEM_PROMPT};
pub use processor::{ProcessorEvent, StreamProcessor, TtsChunk};
pub use tts::{cluster_for_voice, Synthesizer, TtsAudio, TtsClient, TtsConfig, DEFAULT_TTS_URL};
