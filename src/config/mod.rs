// src/config/mod.rs
//! Pipeline configuration: a TOML file with serde defaults, then a few env
//! overrides, then clamping into supported bounds.

pub mod ai;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use ai::AiConfig;

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub analysis: AiConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub listing_url: String,
    /// Origin prepended to relative document links.
    pub origin: String,
    /// IANA zone that listing times are expressed in.
    pub timezone: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            listing_url: "https://www.asx.com.au/asx/v2/statistics/todayAnns.do".into(),
            origin: "https://www.asx.com.au".into(),
            timezone: "Australia/Sydney".into(),
            user_agent: CHROME_UA.into(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub max_concurrent_downloads: usize,
    /// Upper bound on follow-up URLs tried when a consent page comes back.
    pub max_consent_candidates: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_secs: 5,
            max_concurrent_downloads: 3,
            max_consent_candidates: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "local" | "memory" | "s3" | "r2"
    pub storage_type: String,
    pub local_path: String,
    pub object_base_url: Option<String>,
    /// "ENV" reads OBJECT_STORAGE_TOKEN.
    pub object_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "local".into(),
            local_path: "./data".into(),
            object_base_url: None,
            object_token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    pub page_markers: bool,
    /// Documents extracted at once by a batch conversion.
    pub max_concurrent: usize,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            page_markers: true,
            max_concurrent: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub enabled: bool,
    pub base_url: String,
    pub ticker_suffix: String,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    /// Reaction fields are only computed for announcements younger than this.
    pub reaction_window_days: i64,
    pub precision: u32,
    pub timeout_secs: u64,
    /// Also call the quote endpoint for market cap and P/E.
    pub fetch_fundamentals: bool,
    /// Tickers fetched at once by a batch snapshot.
    pub max_concurrent: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://query1.finance.yahoo.com".into(),
            ticker_suffix: ".AX".into(),
            retry_attempts: 3,
            retry_delay_secs: 5,
            reaction_window_days: 60,
            precision: 2,
            timeout_secs: 30,
            fetch_fundamentals: true,
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub price_sensitive_only: bool,
    pub limit: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            price_sensitive_only: true,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// "interval" | "cron" | "market_hours"
    pub mode: String,
    pub interval_minutes: u64,
    pub cron: Option<String>,
    pub timezone: String,
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: "interval".into(),
            interval_minutes: 60,
            cron: None,
            timezone: "Australia/Sydney".into(),
            run_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// "jsonl" | "memory"
    pub kind: String,
    pub dir: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: "jsonl".into(),
            dir: "data/records".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" | "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML file, then apply env overrides and sanitize.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let cfg: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        Ok(cfg.finish())
    }

    /// Load using env var + fallback:
    /// 1) $PIPELINE_CONFIG_PATH
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(PipelineConfig::default().finish())
    }

    fn finish(mut self) -> Self {
        self.apply_env_overrides();
        self.sanitize();
        self.analysis = self.analysis.resolve();
        self
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_str("STORAGE_TYPE") {
            self.storage.storage_type = v;
        }
        if let Some(v) = env_str("LOCAL_STORAGE_PATH") {
            self.storage.local_path = v;
        }
        if let Some(v) = env_parse::<u64>("SCRAPE_INTERVAL_MINUTES") {
            self.scheduler.interval_minutes = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_CONCURRENT_DOWNLOADS") {
            self.fetch.max_concurrent_downloads = v;
        }
        if let Some(v) = env_str("SCHEDULER_MODE") {
            self.scheduler.mode = v;
        }
        if let Some(v) = env_str("SCHEDULER_CRON") {
            self.scheduler.cron = Some(v);
        }
        if let Some(v) = env_str("SCHEDULER_TIMEZONE") {
            self.scheduler.timezone = v;
        }
        if let Some(v) = env_str("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_str("LOG_FORMAT") {
            self.logging.format = v;
        }
        if self
            .storage
            .object_token
            .as_deref()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("env"))
        {
            self.storage.object_token = env_str("OBJECT_STORAGE_TOKEN");
        }
    }

    fn sanitize(&mut self) {
        self.scheduler.interval_minutes = self.scheduler.interval_minutes.clamp(5, 1440);
        self.scheduler.mode = self.scheduler.mode.trim().to_ascii_lowercase();
        self.fetch.max_concurrent_downloads = self.fetch.max_concurrent_downloads.clamp(1, 20);
        self.fetch.timeout_secs = self.fetch.timeout_secs.clamp(5, 120);
        self.fetch.max_retries = self.fetch.max_retries.clamp(1, 10);
        self.fetch.retry_delay_secs = self.fetch.retry_delay_secs.clamp(1, 60);
        self.fetch.max_consent_candidates = self.fetch.max_consent_candidates.clamp(1, 10);
        self.exchange.timeout_secs = self.exchange.timeout_secs.clamp(5, 120);
        self.market.retry_attempts = self.market.retry_attempts.clamp(1, 10);
        self.market.retry_delay_secs = self.market.retry_delay_secs.clamp(1, 60);
        self.market.timeout_secs = self.market.timeout_secs.clamp(5, 120);
        self.market.max_concurrent = self.market.max_concurrent.clamp(1, 10);
        self.convert.max_concurrent = self.convert.max_concurrent.clamp(1, 8);
        self.market.precision = self.market.precision.min(6);
        if self.market.reaction_window_days < 0 {
            self.market.reaction_window_days = MarketConfig::default().reaction_window_days;
        }

        let fmt = self.logging.format.trim().to_ascii_lowercase();
        self.logging.format = match fmt.as_str() {
            "json" => fmt,
            _ => "text".into(),
        };
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(target: "config", key, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}
