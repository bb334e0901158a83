//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between these structs and TOML/JSON/environment values
//! - **#[serde(default)]**: Missing fields fall back to `Default`
//! - **#[serde(skip_serializing)]**: Keeps the API key out of `GET /api/v1/config`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY`
//! 2. Environment variables (APP__SERVER__PORT, APP__PROVIDER__API_KEY, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::pcm::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::{Arc, PoisonError, RwLock};

/// Configuration shared by the HTTP layer and the provider clients, so runtime
/// updates reach the next provider call.
pub type SharedConfig = Arc<RwLock<AppConfig>>;

pub fn shared(config: AppConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// A copy of the current provider settings; the lock is released immediately.
pub fn provider_settings(config: &SharedConfig) -> ProviderConfig {
    config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .provider
        .clone()
}

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: Where to listen
/// - `provider`: The generative AI service (answers, TTS, live voice)
/// - `audio`: Sample rates and frame sizes on both sides of the live session
/// - `questions`: Where the question catalog comes from
/// - `performance`: Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub audio: AudioConfig,
    pub questions: QuestionsConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Generative AI provider settings.
///
/// ## Fields:
/// - `api_base`: REST base URL, `generateContent` calls go to `{api_base}/models/{model}:generateContent`
/// - `live_url`: WebSocket endpoint of the live conversational service
/// - `answer_model` / `tts_model` / `live_model`: Model names per use
/// - `voice`: Prebuilt voice used for TTS and live replies
/// - `api_key`: Never serialized back out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_base: String,
    pub live_url: String,
    pub answer_model: String,
    pub tts_model: String,
    pub live_model: String,
    pub voice: String,
    pub request_timeout_secs: u64,
    #[serde(default, skip_serializing)]
    pub api_key: String,
}

/// Audio format settings.
///
/// ## Fields:
/// - `capture_sample_rate`: Rate of the float frames the UI streams from its microphone
/// - `input_sample_rate`: Rate the live service expects (16kHz)
/// - `output_sample_rate`: Rate of TTS and live replies (24kHz)
/// - `frame_size`: Samples per microphone frame the UI should send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionsConfig {
    /// Empty means the built-in catalog
    pub catalog_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of simultaneous `/ws/voice` connections
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                answer_model: "gemini-2.5-flash".to_string(),
                tts_model: "gemini-2.5-flash-preview-tts".to_string(),
                live_model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Kore".to_string(),
                request_timeout_secs: 60,
                api_key: String::new(),
            },
            audio: AudioConfig {
                capture_sample_rate: 48_000,  // typical browser AudioContext rate
                input_sample_rate: INPUT_SAMPLE_RATE,
                output_sample_rate: OUTPUT_SAMPLE_RATE,
                frame_size: 4096,
            },
            questions: QuestionsConfig {
                catalog_path: String::new(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__PROVIDER__VOICE=Puck`: Override TTS voice
    /// - `GEMINI_API_KEY=...`: Provider API key
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform conventions
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore so multi-word keys (api_key) survive
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("provider.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is not an error here: the server still serves the
    /// catalog and cached answers, and provider calls fail individually.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let rates = [
            ("capture_sample_rate", self.audio.capture_sample_rate),
            ("input_sample_rate", self.audio.input_sample_rate),
            ("output_sample_rate", self.audio.output_sample_rate),
        ];
        for (name, rate) in rates {
            if rate == 0 {
                return Err(anyhow!("audio.{} must be greater than 0", name));
            }
        }

        // Microphone audio is only ever downsampled
        if self.audio.capture_sample_rate < self.audio.input_sample_rate {
            return Err(anyhow!(
                "audio.capture_sample_rate ({}) must be at least audio.input_sample_rate ({})",
                self.audio.capture_sample_rate,
                self.audio.input_sample_rate
            ));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow!("audio.frame_size must be greater than 0"));
        }

        if self.provider.request_timeout_secs == 0 {
            return Err(anyhow!("provider.request_timeout_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Whether provider calls can be made at all.
    pub fn has_api_key(&self) -> bool {
        !self.provider.api_key.trim().is_empty()
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only fields present in the JSON change, e.g. `{"provider": {"voice": "Puck"}}`.
    /// Server address and API key are not runtime-updatable. On validation
    /// failure `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(provider) = partial.get("provider") {
            let fields: [(&str, &mut String); 4] = [
                ("answer_model", &mut updated.provider.answer_model),
                ("tts_model", &mut updated.provider.tts_model),
                ("live_model", &mut updated.provider.live_model),
                ("voice", &mut updated.provider.voice),
            ];
            for (name, slot) in fields {
                if let Some(value) = provider.get(name).and_then(|v| v.as_str()) {
                    *slot = value.to_string();
                }
            }
            if let Some(timeout) = provider.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                updated.provider.request_timeout_secs = timeout;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = audio.get("capture_sample_rate").and_then(|v| v.as_u64()) {
                updated.audio.capture_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow!("audio.capture_sample_rate {} is out of range", rate))?;
            }
            if let Some(size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                updated.audio.frame_size = usize::try_from(size)
                    .map_err(|_| anyhow!("audio.frame_size {} is out of range", size))?;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_sessions = usize::try_from(sessions)
                    .map_err(|_| anyhow!("performance.max_concurrent_sessions {} is out of range", sessions))?;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert!(!config.has_api_key());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_sample_rate = 8_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"provider": {"voice": "Puck"}, "performance": {"max_concurrent_sessions": 3}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.provider.voice, "Puck");
        assert_eq!(config.performance.max_concurrent_sessions, 3);
        assert_eq!(config.provider.answer_model, "gemini-2.5-flash");
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"provider": {"voice": "Puck"}, "performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.provider.voice, "Kore");
        assert_eq!(config.performance.max_concurrent_sessions, 10);
    }

    #[test]
    fn test_out_of_range_rate_is_rejected() {
        let mut config = AppConfig::default();
        // 2^32 + 16000 would wrap to a valid-looking 16000
        let json = r#"{"audio": {"capture_sample_rate": 4294983296}}"#;
        let err = config.update_from_json(json).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(config.audio.capture_sample_rate, 48_000);
    }

    #[test]
    fn test_shared_provider_settings_follow_updates() {
        let shared = shared(AppConfig::default());
        assert_eq!(provider_settings(&shared).voice, "Kore");

        shared
            .write()
            .unwrap()
            .update_from_json(r#"{"provider": {"voice": "Puck"}}"#)
            .unwrap();
        assert_eq!(provider_settings(&shared).voice, "Puck");
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut config = AppConfig::default();
        config.provider.api_key = "secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("api_key"));
    }
}
