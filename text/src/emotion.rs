//! Emotion markup parsing for LLM replies.
//!
//! The model is prompted to answer as
//! `<content>…</content><emotion>…</emotion>`; this module extracts the
//! user-visible text and the emotion label, and strips leftover markup
//! before synthesis.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static CONTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<content>(.*?)</content>").expect("static pattern"));
static EMOTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<emotion>(.*?)</emotion>").expect("static pattern"));
static CONTENT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?content>").expect("static pattern"));
static ANY_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static pattern"));

/// Emotion state of the companion bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Emotion {
    /// 默认陪伴
    #[default]
    #[serde(rename = "默认陪伴")]
    Companion,
    /// 共情倾听
    #[serde(rename = "共情倾听")]
    Empathy,
    /// 安慰支持
    #[serde(rename = "安慰支持")]
    Comfort,
    /// 轻松愉悦
    #[serde(rename = "轻松愉悦")]
    Cheerful,
}

impl Emotion {
    pub const ALL: [Emotion; 4] = [
        Emotion::Companion,
        Emotion::Empathy,
        Emotion::Comfort,
        Emotion::Cheerful,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Companion => "默认陪伴",
            Emotion::Empathy => "共情倾听",
            Emotion::Comfort => "安慰支持",
            Emotion::Cheerful => "轻松愉悦",
        }
    }

    /// Parses a label; unknown labels map to `None`.
    pub fn from_label(label: &str) -> Option<Emotion> {
        Emotion::ALL.into_iter().find(|e| e.as_str() == label)
    }
}

/// A reply with its markup resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    /// The user-visible text.
    pub content: String,
    /// The emotion label; falls back to 默认陪伴.
    pub emotion: Emotion,
    /// Whether a non-empty content was found.
    pub is_valid: bool,
}

/// Parses an LLM reply into content and emotion.
///
/// Without a `<content>` tag the raw text is returned with any
/// `<emotion>` tag stripped. Unknown or missing emotions fall back to
/// the default.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let content = extract_content(raw);
    let emotion = EMOTION_RE
        .captures(raw)
        .and_then(|c| Emotion::from_label(c[1].trim()))
        .unwrap_or_default();

    ParsedReply {
        is_valid: !content.is_empty(),
        content,
        emotion,
    }
}

fn extract_content(raw: &str) -> String {
    if let Some(captures) = CONTENT_RE.captures(raw) {
        return captures[1].trim().to_string();
    }

    let fallback = EMOTION_RE.replace_all(raw, "");
    let fallback = fallback.trim();
    if fallback.is_empty() {
        raw.trim().to_string()
    } else {
        fallback.to_string()
    }
}

/// Strips markup so only plain text reaches the synthesizer.
///
/// Removes content tags, whole emotion tags, and any other `<…>` tags
/// that leak through.
pub fn strip_markup(text: &str) -> String {
    let text = CONTENT_TAG_RE.replace_all(text, "");
    let text = EMOTION_RE.replace_all(&text, "");
    let text = ANY_TAG_RE.replace_all(&text, "");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let parsed = parse_reply("<content>我理解你</content><emotion>共情倾听</emotion>");
        assert_eq!(parsed.content, "我理解你");
        assert_eq!(parsed.emotion, Emotion::Empathy);
        assert!(parsed.is_valid);
    }

    #[test]
    fn unknown_emotion_falls_back() {
        let parsed = parse_reply("<content>哈哈</content><emotion>开心</emotion>");
        assert_eq!(parsed.content, "哈哈");
        assert_eq!(parsed.emotion, Emotion::Companion);
    }

    #[test]
    fn missing_content_tag_uses_raw_text() {
        let parsed = parse_reply("直接的回答<emotion>轻松愉悦</emotion>");
        assert_eq!(parsed.content, "直接的回答");
        assert_eq!(parsed.emotion, Emotion::Cheerful);
    }

    #[test]
    fn missing_emotion_defaults() {
        let parsed = parse_reply("<content>晚安</content>");
        assert_eq!(parsed.emotion, Emotion::Companion);
    }

    #[test]
    fn multiline_content() {
        let parsed = parse_reply("<content>第一行\n第二行</content><emotion>安慰支持</emotion>");
        assert_eq!(parsed.content, "第一行\n第二行");
        assert_eq!(parsed.emotion, Emotion::Comfort);
    }

    #[test]
    fn strip_markup_removes_leaked_tags() {
        assert_eq!(strip_markup("<content>你好"), "你好");
        assert_eq!(
            strip_markup("没事的。<emotion>安慰支持</emotion>"),
            "没事的。"
        );
        assert_eq!(strip_markup("带<b>标签</b>的话"), "带标签的话");
        assert_eq!(strip_markup("  纯文本  "), "纯文本");
    }

    #[test]
    fn emotion_serializes_to_label() {
        assert_eq!(
            serde_json::to_value(Emotion::Empathy).unwrap(),
            serde_json::json!("共情倾听")
        );
        assert_eq!(Emotion::from_label("安慰支持"), Some(Emotion::Comfort));
        assert_eq!(Emotion::from_label("无效"), None);
    }
}
