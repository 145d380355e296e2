//! Streaming text utilities for the voice dialogue gateway.
//!
//! - [`SentenceSplitter`]: incremental sentence segmentation for
//!   streaming LLM output.
//! - [`ContextManager`]: bounded dialogue history with token-estimated
//!   trimming.
//! - [`emotion`]: `<content>`/`<emotion>` markup parsing and cleanup.

mod context;
pub mod emotion;
mod splitter;

pub use context::{ContextConfig, ContextManager, Message, Role};
pub use emotion::{parse_reply, strip_markup, Emotion, ParsedReply};
pub use splitter::SentenceSplitter;
