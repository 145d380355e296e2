//! Bounded dialogue history with token-estimated trimming.

use serde::{Deserialize, Serialize};

/// Speaker role of a context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One dialogue message, in chat-completion wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Context store configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Trim threshold in estimated tokens.
    pub max_tokens: usize,
    /// Chinese text averages about 1.5 chars per token.
    pub chars_per_token: f64,
    /// Number of user/assistant pairs always kept.
    pub min_history_count: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50_000,
            chars_per_token: 1.5,
            min_history_count: 2,
        }
    }
}

/// Dialogue history bounded by an estimated token budget.
///
/// On overflow the oldest user/assistant pair is dropped, repeatedly, but
/// never below `min_history_count` pairs.
#[derive(Debug, Default)]
pub struct ContextManager {
    config: ContextConfig,
    messages: Vec<Message>,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
        }
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
        self.trim_if_needed();
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
        self.trim_if_needed();
    }

    /// The retained history, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Estimated token count of the retained history.
    pub fn estimate_tokens(&self) -> usize {
        let total_chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        (total_chars as f64 / self.config.chars_per_token) as usize
    }

    fn trim_if_needed(&mut self) {
        while self.estimate_tokens() > self.config.max_tokens
            && self.messages.len() > self.config.min_history_count * 2
        {
            // Drop the oldest pair, keeping user/assistant alignment.
            self.messages.remove(0);
            if self
                .messages
                .first()
                .is_some_and(|m| m.role == Role::Assistant)
            {
                self.messages.remove(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_context() -> ContextManager {
        ContextManager::new(ContextConfig {
            max_tokens: 50,
            chars_per_token: 1.0,
            min_history_count: 1,
        })
    }

    #[test]
    fn keeps_recent_pairs_under_budget() {
        let mut ctx = small_context();
        for i in 0..5 {
            ctx.add_user_message(format!("问题{}组成的二十个字符串串串串串串", i));
            ctx.add_assistant_message(format!("回答{}组成的二十个字符串串串串串串", i));
        }

        assert!(ctx.len() >= 2);
        assert!(ctx.len() <= 4);

        // The most recent pair survives.
        let last = &ctx.messages()[ctx.len() - 2..];
        assert!(last[0].content.starts_with("问题4"));
        assert!(last[1].content.starts_with("回答4"));
    }

    #[test]
    fn trim_invariant_holds() {
        let mut ctx = small_context();
        for i in 0..20 {
            ctx.add_user_message(format!("用户消息内容较长一些{}", i));
            ctx.add_assistant_message(format!("助手消息内容较长一些{}", i));

            assert!(
                ctx.len() >= 2 * 1 || ctx.estimate_tokens() <= 50,
                "history below floor while over budget"
            );
        }
    }

    #[test]
    fn trim_keeps_alignment() {
        let mut ctx = small_context();
        for i in 0..6 {
            ctx.add_user_message(format!("这是一条比较长的用户消息内容{}", i));
            ctx.add_assistant_message(format!("这是一条比较长的助手消息内容{}", i));
        }
        assert_eq!(ctx.messages()[0].role, Role::User);
    }

    #[test]
    fn no_trim_under_budget() {
        let mut ctx = ContextManager::new(ContextConfig::default());
        ctx.add_user_message("你好");
        ctx.add_assistant_message("你好呀");
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.estimate_tokens(), (5.0_f64 / 1.5) as usize);
    }

    #[test]
    fn clear_empties_history() {
        let mut ctx = small_context();
        ctx.add_user_message("你好");
        ctx.clear();
        assert!(ctx.is_empty());
    }

    #[test]
    fn messages_serialize_in_wire_shape() {
        let msg = Message::user("你好");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, serde_json::json!({"role": "user", "content": "你好"}));
    }
}
