//! Normalized dialogue events.

/// A normalized event produced by the dialogue service, decoupled from
/// the upstream wire representation.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogEvent {
    /// The user started speaking (a new audio turn).
    AsrStarted { question_id: String },
    /// A recognition hypothesis; interim results may still be revised.
    AsrResult { text: String, is_final: bool },
    /// The user stopped speaking.
    AsrEnded,
    /// A streamed piece of the textual answer.
    ChatText {
        text: String,
        question_id: String,
        reply_id: String,
    },
    /// The textual answer is complete.
    ChatEnded(serde_json::Value),
    /// A synthesized sentence is starting.
    TtsStart { tts_type: String, text: String },
    /// A chunk of synthesized audio.
    TtsChunk { audio: Vec<u8> },
    /// The synthesized reply is complete.
    TtsEnded(serde_json::Value),
    /// An upstream or transport error.
    Error { message: String, fatal: bool },
}
