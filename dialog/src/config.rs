//! Dialogue service configuration.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Default realtime dialogue endpoint.
pub const DEFAULT_DIALOGUE_URL: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

/// Resource id for the realtime dialogue service.
pub const RESOURCE_DIALOG: &str = "volc.speech.dialog";

/// Fixed X-Api-App-Key for the realtime dialogue API. This is a documented
/// constant, not a user credential.
pub const APP_KEY_DIALOG: &str = "PlgvMymc7f3tQnJ6";

/// Default greeting used by `say_hello` when no content is given.
pub const DEFAULT_GREETING: &str = "你好，我是小马，有什么可以帮助你的吗？";

/// Input mode advertised in the StartSession payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMod {
    #[default]
    Audio,
    Text,
    AudioFile,
    KeepAlive,
}

impl InputMod {
    pub fn as_str(self) -> &'static str {
        match self {
            InputMod::Audio => "audio",
            InputMod::Text => "text",
            InputMod::AudioFile => "audio_file",
            InputMod::KeepAlive => "keep_alive",
        }
    }

    /// Parses a client-supplied mode string, defaulting to audio.
    pub fn parse(s: &str) -> Self {
        match s {
            "text" => InputMod::Text,
            "audio_file" => InputMod::AudioFile,
            "keep_alive" => InputMod::KeepAlive,
            _ => InputMod::Audio,
        }
    }
}

/// Location information advertised to the dialogue model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub province: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub district: String,
}

impl Default for LocationInfo {
    fn default() -> Self {
        Self {
            city: "北京".to_string(),
            country: "中国".to_string(),
            province: String::new(),
            district: String::new(),
        }
    }
}

/// End-to-end dialogue configuration.
///
/// Defaults follow the vendor recommendations for a Chinese-speaking
/// companion bot; every field maps into the handshake headers or the
/// StartSession payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,
    pub base_url: String,

    /// Model version: O, SC, 1.2.1.0, 2.2.0.0.
    pub model: String,

    // TTS
    pub speaker: String,
    pub output_audio_format: String,
    pub output_sample_rate: i32,

    // Dialog persona
    pub bot_name: String,
    pub system_role: String,
    pub speaking_style: String,
    pub location: LocationInfo,

    // ASR
    pub end_smooth_window_ms: i32,

    /// Upstream receive timeout in seconds; longer than the vendor default
    /// so long dialogues do not get cut off.
    pub recv_timeout: i32,
    pub strict_audit: bool,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            access_key: String::new(),
            resource_id: RESOURCE_DIALOG.to_string(),
            app_key: APP_KEY_DIALOG.to_string(),
            base_url: DEFAULT_DIALOGUE_URL.to_string(),
            model: "O".to_string(),
            speaker: "zh_female_vv_jupiter_bigtts".to_string(),
            output_audio_format: "pcm".to_string(),
            output_sample_rate: 24000,
            bot_name: "小马".to_string(),
            system_role: "你是一个友善、温暖的AI助手，名叫小马。你善于倾听，能够给予用户情感支持和陪伴。"
                .to_string(),
            speaking_style: "你的说话风格简洁明了，语速适中，语调自然，充满关怀。".to_string(),
            location: LocationInfo::default(),
            end_smooth_window_ms: 1500,
            recv_timeout: 30,
            strict_audit: false,
        }
    }
}

impl DialogConfig {
    /// Builds the StartSession payload for the given input mode.
    pub fn start_session_payload(&self, input_mod: InputMod) -> serde_json::Value {
        json!({
            "asr": {
                "extra": {
                    "end_smooth_window_ms": self.end_smooth_window_ms,
                },
            },
            "tts": {
                "speaker": self.speaker,
                "audio_config": {
                    "channel": 1,
                    "format": self.output_audio_format,
                    "sample_rate": self.output_sample_rate,
                },
            },
            "dialog": {
                "bot_name": self.bot_name,
                "system_role": self.system_role,
                "speaking_style": self.speaking_style,
                "location": self.location,
                "extra": {
                    "strict_audit": self.strict_audit,
                    "recv_timeout": self.recv_timeout,
                    "input_mod": input_mod.as_str(),
                    "model": self.model,
                },
            },
        })
    }
}
