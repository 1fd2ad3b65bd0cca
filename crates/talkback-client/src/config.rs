//! Client configuration
//!
//! Values come from built-in defaults, overridden by `TALKBACK_*` environment
//! variables (an optional `.env` file is loaded first).

use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_PROVIDER_URL: &str = "https://api.openai.com/v1/realtime/calls";
pub const DEFAULT_MODEL: &str = "gpt-realtime";
pub const DEFAULT_VOICE: &str = "ash";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Backend REST base URL
    pub api_url: String,
    /// Provider SDP signaling endpoint
    pub provider_url: String,
    pub default_model: String,
    pub default_voice: String,
    pub min_tokens_to_start: i64,
    pub min_tokens_to_continue: i64,
    pub max_reconnect_attempts: u32,
    /// Mean spectral byte level above which a sample counts as speech
    pub vad_threshold: f32,
    pub vad_required_frames: u32,
    pub vad_interval_ms: u64,
    pub health_interval_secs: u64,
    /// Upper bound for every backend and signaling request
    pub request_timeout_secs: u64,
}

impl ClientConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Failed to read .env file: {}", e);
            }
        }

        config::Config::builder()
            .set_default("api_url", DEFAULT_API_URL)?
            .set_default("provider_url", DEFAULT_PROVIDER_URL)?
            .set_default("default_model", DEFAULT_MODEL)?
            .set_default("default_voice", DEFAULT_VOICE)?
            .set_default("min_tokens_to_start", 2000_i64)?
            .set_default("min_tokens_to_continue", 2000_i64)?
            .set_default("max_reconnect_attempts", 3_i64)?
            .set_default("vad_threshold", 15.0_f64)?
            .set_default("vad_required_frames", 2_i64)?
            .set_default("vad_interval_ms", 50_i64)?
            .set_default("health_interval_secs", 5_i64)?
            .set_default("request_timeout_secs", 10_i64)?
            .add_source(config::Environment::with_prefix("TALKBACK").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            provider_url: DEFAULT_PROVIDER_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            default_voice: DEFAULT_VOICE.to_string(),
            min_tokens_to_start: 2000,
            min_tokens_to_continue: 2000,
            max_reconnect_attempts: 3,
            vad_threshold: 15.0,
            vad_required_frames: 2,
            vad_interval_ms: 50,
            health_interval_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_builtin_values() {
        let config = ClientConfig::default();
        assert_eq!(config.api_url, "http://localhost:8080/api");
        assert_eq!(config.min_tokens_to_start, 2000);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.health_interval(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }
}
