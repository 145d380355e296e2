//! Chat-completion client for the staged pipeline.
//!
//! Talks to an OpenAI-compatible endpoint (DeepSeek by default). The
//! system prompt mandates the `<content>…</content><emotion>…</emotion>`
//! reply format that the emotion tagger expects.

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tracing::debug;

use ponytalk_text::{parse_reply, Emotion, Message};

use crate::error::{Error, Result};

/// Default chat-completion endpoint.
pub const DEFAULT_LLM_URL: &str = "https://api.deepseek.com/chat/completions";

/// System prompt establishing the persona and the markup contract.
pub const SYSTEM_PROMPT: &str = "你是一个善解人意的小马，帮助对方聊天。\
返回格式要求用 <content> </content> <emotion></emotion> 标签标记，\
content中间是返回的对话，emotion中间是当前小马的表情，\
有 默认陪伴、共情倾听、安慰支持、轻松愉悦 四种，其中 默认陪伴 是默认状态。";

/// Chat-completion configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_LLM_URL.to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// A complete reply with its markup resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub content: String,
    pub emotion: Emotion,
    /// Raw model output, for debugging.
    pub raw: String,
}

/// A streaming text generator.
///
/// The trait seam lets the stream processor run against any model
/// backend.
pub trait ChatModel: Send + Sync {
    /// Streams reply text deltas for the given history.
    fn chat_stream(&self, messages: Vec<Message>) -> BoxStream<'static, Result<String>>;
}

/// OpenAI-compatible chat-completion client.
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { config, http })
    }

    /// Non-streaming chat call; parses content and emotion.
    pub async fn chat(&self, messages: &[Message]) -> Result<LlmReply> {
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(messages, false))
            .send()
            .await?
            .error_for_status()?;

        let data: serde_json::Value = response.json().await?;
        let raw = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::Llm("response carries no content".to_string()))?
            .to_string();

        let parsed = parse_reply(&raw);
        Ok(LlmReply {
            content: parsed.content,
            emotion: parsed.emotion,
            raw,
        })
    }

    fn request_body(&self, messages: &[Message], stream: bool) -> serde_json::Value {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(Message::system(SYSTEM_PROMPT));
        full.extend_from_slice(messages);

        json!({
            "model": self.config.model,
            "messages": full,
            "stream": stream,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        })
    }
}

impl ChatModel for LlmClient {
    /// Streams SSE deltas from the completion endpoint.
    fn chat_stream(&self, messages: Vec<Message>) -> BoxStream<'static, Result<String>> {
        let http = self.http.clone();
        let url = self.config.api_url.clone();
        let api_key = self.config.api_key.clone();
        let body = self.request_body(&messages, true);

        Box::pin(try_stream! {
            let response = http
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;

            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'read;
                    }

                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!("skipping malformed sse line: {}", e);
                            continue;
                        }
                    };
                    if let Some(content) = event["choices"][0]["delta"]["content"].as_str() {
                        if !content.is_empty() {
                            yield content.to_string();
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ponytalk_text::Role;

    #[test]
    fn request_body_prepends_system_prompt() {
        let client = LlmClient::new(LlmConfig::default()).unwrap();
        let body = client.request_body(&[Message::user("你好")], true);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("默认陪伴"));
        assert_eq!(messages[1], serde_json::json!({"role": "user", "content": "你好"}));
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["max_tokens"], 2048);
    }

    #[test]
    fn system_message_role_serializes() {
        let msg = Message::system("x");
        assert_eq!(msg.role, Role::System);
        assert_eq!(
            serde_json::to_value(&msg).unwrap()["role"],
            serde_json::json!("system")
        );
    }
}
