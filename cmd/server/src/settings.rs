//! Environment-driven configuration for the gateway.

use std::str::FromStr;

use ponytalk_dialog::DialogConfig;
use ponytalk_pipeline::{AsrConfig, LlmConfig, TtsConfig};
use ponytalk_text::ContextConfig;

/// Gateway settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub dialog: DialogConfig,
    pub asr: AsrConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub context: ContextConfig,
}

impl Settings {
    /// Reads every tunable from the environment, with the service
    /// defaults as fallback.
    pub fn from_env() -> Self {
        let dialog_defaults = DialogConfig::default();
        let dialog = DialogConfig {
            app_id: env_or("VOLC_E2E_APP_ID", ""),
            access_key: env_or("VOLC_E2E_ACCESS_KEY", ""),
            model: env_or("VOLC_E2E_MODEL", &dialog_defaults.model),
            speaker: env_or("VOLC_E2E_SPEAKER", &dialog_defaults.speaker),
            bot_name: env_or("VOLC_E2E_BOT_NAME", &dialog_defaults.bot_name),
            system_role: env_or("VOLC_E2E_SYSTEM_ROLE", &dialog_defaults.system_role),
            speaking_style: env_or("VOLC_E2E_SPEAKING_STYLE", &dialog_defaults.speaking_style),
            output_audio_format: env_or(
                "VOLC_E2E_AUDIO_FORMAT",
                &dialog_defaults.output_audio_format,
            ),
            output_sample_rate: env_parse(
                "VOLC_E2E_SAMPLE_RATE",
                dialog_defaults.output_sample_rate,
            ),
            end_smooth_window_ms: env_parse(
                "VOLC_E2E_END_SMOOTH_WINDOW_MS",
                dialog_defaults.end_smooth_window_ms,
            ),
            recv_timeout: env_parse("VOLC_E2E_RECV_TIMEOUT", dialog_defaults.recv_timeout),
            strict_audit: env_parse("VOLC_E2E_STRICT_AUDIT", dialog_defaults.strict_audit),
            ..dialog_defaults
        };

        let asr_defaults = AsrConfig::default();
        let asr = AsrConfig {
            url: env_or("VOLC_ASR_URL", &asr_defaults.url),
            app_id: env_or("VOLC_ASR_APP_ID", ""),
            access_key: env_or("VOLC_ASR_ACCESS_KEY", ""),
            ..asr_defaults
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            api_url: env_or("DEEPSEEK_API_URL", &llm_defaults.api_url),
            api_key: env_or("DEEPSEEK_API_KEY", ""),
            model: env_or("DEEPSEEK_MODEL", &llm_defaults.model),
            ..llm_defaults
        };

        let tts_defaults = TtsConfig::default();
        let tts = TtsConfig {
            app_id: env_or("VOLC_TTS_APP_ID", ""),
            access_token: env_or("VOLC_TTS_ACCESS_KEY", ""),
            cluster: env_or("VOLC_TTS_CLUSTER", &tts_defaults.cluster),
            voice_type: env_or("VOLC_TTS_VOICE", &tts_defaults.voice_type),
            ..tts_defaults
        };

        let context_defaults = ContextConfig::default();
        let context = ContextConfig {
            max_tokens: env_parse("CONTEXT_MAX_TOKENS", context_defaults.max_tokens),
            chars_per_token: env_parse("CONTEXT_CHARS_PER_TOKEN", context_defaults.chars_per_token),
            min_history_count: env_parse(
                "CONTEXT_MIN_HISTORY_COUNT",
                context_defaults.min_history_count,
            ),
        };

        Self {
            app_name: "PonyTalk API",
            app_version: env!("CARGO_PKG_VERSION"),
            dialog,
            asr,
            llm,
            tts,
            context,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let settings = Settings::from_env();
        assert_eq!(settings.app_name, "PonyTalk API");
        assert_eq!(settings.dialog.output_sample_rate, 24000);
        assert_eq!(settings.dialog.recv_timeout, 30);
        assert_eq!(settings.asr.sample_rate, 16000);
        assert_eq!(settings.llm.model, "deepseek-chat");
        assert_eq!(settings.context.max_tokens, 50_000);
    }
}
