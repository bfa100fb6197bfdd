// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

fn default_enabled() -> bool {
    true
}
fn default_provider() -> String {
    "gemini".into()
}
fn default_api_key() -> String {
    "ENV".into()
}
fn default_model() -> String {
    "gemini-1.5-pro".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_max_input_chars() -> usize {
    100_000
}
fn default_daily_limit() -> u32 {
    500
}
fn default_cache_dir() -> String {
    "cache/llm".into()
}
fn default_timeout_secs() -> u64 {
    60
}

/// LLM analysis settings (`[analysis]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// "gemini" | "openai" | "disabled" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// "ENV" means: read from GEMINI_API_KEY / OPENAI_API_KEY (by provider)
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Overrides the provider's API origin (used against local mocks).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Document text beyond this many characters is cut before prompting.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            provider: default_provider(),
            api_key: default_api_key(),
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_input_chars: default_max_input_chars(),
            daily_limit: default_daily_limit(),
            cache_dir: default_cache_dir(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl AiConfig {
    /// Normalize the provider, resolve an "ENV" key and clamp numeric fields.
    ///
    /// A missing key env var leaves the key empty; the client factory then
    /// falls back to a disabled client instead of failing startup.
    pub fn resolve(mut self) -> Self {
        self.provider = self.provider.trim().to_lowercase();

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            let var = match self.provider.as_str() {
                "openai" => "OPENAI_API_KEY",
                _ => "GEMINI_API_KEY",
            };
            self.api_key = env::var(var).unwrap_or_default();
            if self.api_key.is_empty() && self.enabled {
                tracing::warn!(target: "config", var, "llm api key env var not set");
            }
        }

        if !(0.0..=2.0).contains(&self.temperature) || self.temperature.is_nan() {
            self.temperature = default_temperature();
        }
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        if self.max_input_chars == 0 {
            self.max_input_chars = default_max_input_chars();
        }
        self.timeout_secs = self.timeout_secs.clamp(5, 300);
        self
    }
}
