//! AI adapter: provider abstraction + file cache + daily limit.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::sentiment::is_usable_reply;
use crate::config::AiConfig;
use crate::error::AnalysisError;

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

/// A language model that turns a prompt into raw reply text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
    /// Model identifier recorded on each analysis.
    fn model(&self) -> &str;
}

pub type DynLlm = Arc<dyn LlmProvider>;

/// Factory: build a client according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns a deterministic mock client.
/// * Else if analysis is disabled or no key is configured, returns a disabled client.
/// * Else builds the configured provider wrapped with caching + daily limit.
pub fn build_client_from_config(config: &AiConfig) -> DynLlm {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        let client = CachingClient::new(
            MockProvider::default(),
            PathBuf::from(&config.cache_dir),
            config.daily_limit,
        )
        .with_reply_check(is_usable_reply);
        return Arc::new(client);
    }

    if !config.enabled || config.provider == "disabled" {
        return Arc::new(DisabledClient);
    }
    if config.api_key.trim().is_empty() {
        tracing::warn!(target: "analyzer", provider = %config.provider, "no api key, analysis disabled");
        return Arc::new(DisabledClient);
    }

    let cache_dir = PathBuf::from(&config.cache_dir);
    let built: Result<DynLlm, AnalysisError> = match config.provider.as_str() {
        "gemini" => GeminiProvider::new(config).map(|p| {
            Arc::new(CachingClient::new(p, cache_dir, config.daily_limit).with_reply_check(is_usable_reply))
                as DynLlm
        }),
        "openai" => OpenAiProvider::new(config).map(|p| {
            Arc::new(CachingClient::new(p, cache_dir, config.daily_limit).with_reply_check(is_usable_reply))
                as DynLlm
        }),
        other => Err(AnalysisError::Request(format!("unsupported provider {other}"))),
    };
    match built {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(target: "analyzer", "llm client unavailable, analysis disabled: {e}");
            Arc::new(DisabledClient)
        }
    }
}

fn http_client(config: &AiConfig) -> Result<reqwest::Client, AnalysisError> {
    reqwest::Client::builder()
        .user_agent(concat!("disclosure-pipeline/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| AnalysisError::Request(e.to_string()))
}

fn request_error(e: reqwest::Error) -> AnalysisError {
    AnalysisError::Request(e.to_string())
}

// ------------------------------------------------------------
// Concrete providers
// ------------------------------------------------------------

/// Google Gemini `generateContent`.
pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

impl GeminiProvider {
    pub fn new(config: &AiConfig) -> Result<Self, AnalysisError> {
        Ok(Self {
            http: http_client(config)?,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into())
                .trim_end_matches('/')
                .to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
        #[derive(Serialize)]
        struct Part<'a> {
            text: &'a str,
        }
        #[derive(Serialize)]
        struct Content<'a> {
            parts: Vec<Part<'a>>,
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerationConfig {
            temperature: f32,
            max_output_tokens: u32,
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            contents: Vec<Content<'a>>,
            generation_config: GenerationConfig,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            candidates: Vec<Candidate>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Option<RespContent>,
        }
        #[derive(Deserialize)]
        struct RespContent {
            #[serde(default)]
            parts: Vec<RespPart>,
        }
        #[derive(Deserialize)]
        struct RespPart {
            #[serde(default)]
            text: String,
        }

        let req = Req {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        };
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let resp = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&req)
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(AnalysisError::Status(resp.status().as_u16()));
        }
        let body: Resp = resp.json().await.map_err(request_error)?;
        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AnalysisError::EmptyReply);
        }
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// OpenAI Chat Completions.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(config: &AiConfig) -> Result<Self, AnalysisError> {
        // the shared default names a Gemini model
        let model = if config.model.starts_with("gemini") {
            "gpt-4o-mini".to_string()
        } else {
            config.model.clone()
        };
        Ok(Self {
            http: http_client(config)?,
            api_key: config.api_key.clone(),
            model,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into())
                .trim_end_matches('/')
                .to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            #[serde(default)]
            content: Option<String>,
        }

        let sys = "You are a financial analyst. Reply with a single JSON object only.";
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(AnalysisError::Status(resp.status().as_u16()));
        }
        let body: Resp = resp.json().await.map_err(request_error)?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AnalysisError::EmptyReply);
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Always fails with [`AnalysisError::Disabled`].
pub struct DisabledClient;

#[async_trait]
impl LlmProvider for DisabledClient {
    async fn complete(&self, _prompt: &str) -> Result<String, AnalysisError> {
        Err(AnalysisError::Disabled)
    }
    fn name(&self) -> &'static str {
        "disabled"
    }
    fn model(&self) -> &str {
        "none"
    }
}

/// Deterministic provider for tests/local runs.
#[derive(Clone)]
pub struct MockProvider {
    pub reply: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            reply: r#"{"summary":"Mock summary of the announcement.","sentiment":"neutral","key_insights":["First point","Second point","Third point"],"financial_impact":"Limited near-term impact.","confidence_score":0.5}"#.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, AnalysisError> {
        Ok(self.reply.clone())
    }
    fn name(&self) -> &'static str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock"
    }
}

// ------------------------------------------------------------
// Caching client wrapper (file cache + daily limit)
// ------------------------------------------------------------

/// Cache hits are free; only real provider calls count toward the limit.
/// Replies rejected by the reply check are returned but never cached.
pub struct CachingClient<P: LlmProvider> {
    inner: P,
    cache_dir: PathBuf,
    daily_limit_max: u32,
    counter: Mutex<DailyCounter>,
    reply_check: fn(&str) -> bool,
}

impl<P: LlmProvider> CachingClient<P> {
    pub fn new(inner: P, cache_dir: PathBuf, daily_limit_max: u32) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            tracing::warn!(target: "analyzer", dir = %cache_dir.display(), "cache dir unavailable: {e}");
        }
        let counter = Mutex::new(load_daily_counter(&cache_dir).unwrap_or_default());
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter,
            reply_check: |_| true,
        }
    }

    pub fn with_reply_check(mut self, check: fn(&str) -> bool) -> Self {
        self.reply_check = check;
        self
    }

    pub fn calls_today(&self) -> u32 {
        let mut g = self.counter.lock();
        if g.is_expired() {
            g.reset_to_today();
        }
        g.count
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for CachingClient<P> {
    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
        let key = cache_key(self.inner.model(), prompt);
        if let Some(hit) = read_cache_file(&self.cache_dir, &key) {
            return Ok(hit);
        }

        {
            let mut g = self.counter.lock();
            if g.is_expired() {
                g.reset_to_today();
                let _ = save_daily_counter(&self.cache_dir, &g);
            }
            if g.count >= self.daily_limit_max {
                return Err(AnalysisError::DailyLimit(self.daily_limit_max));
            }
        }

        let fresh = self.inner.complete(prompt).await?;
        if (self.reply_check)(&fresh) {
            if let Err(e) = write_cache_file(&self.cache_dir, &key, &fresh) {
                tracing::debug!(target: "analyzer", "cache write failed: {e}");
            }
        } else {
            tracing::warn!(target: "analyzer", provider = self.inner.name(), "unusable reply, not cached");
        }
        let mut g = self.counter.lock();
        g.count = g.count.saturating_add(1);
        let _ = save_daily_counter(&self.cache_dir, &g);
        Ok(fresh)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

// ------------------------------------------------------------
// File cache helpers
// ------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    reply: String,
}

fn cache_key(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    crate::model::hex(&hasher.finalize())
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cache_file(dir: &Path, key: &str) -> Option<String> {
    let s = fs::read_to_string(cache_path(dir, key)).ok()?;
    serde_json::from_str::<CacheEntry>(&s).ok().map(|e| e.reply)
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(contents)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn write_cache_file(dir: &Path, key: &str, reply: &str) -> io::Result<()> {
    let json = serde_json::to_vec(&CacheEntry {
        reply: reply.to_string(),
    })
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&cache_path(dir, key), &json)
}

// ------------------------------------------------------------
// Daily counter helpers
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}
impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}
impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

fn load_daily_counter(dir: &Path) -> io::Result<DailyCounter> {
    let s = fs::read_to_string(counter_path(dir))?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_daily_counter(dir: &Path, dc: &DailyCounter) -> io::Result<()> {
    let s = serde_json::to_vec(dc).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&counter_path(dir), &s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for Counting {
        async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("reply to {}", prompt.len()))
        }
        fn name(&self) -> &'static str {
            "counting"
        }
        fn model(&self) -> &str {
            "counting-1"
        }
    }

    #[tokio::test]
    async fn cache_hits_skip_provider_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let client = CachingClient::new(
            Counting {
                calls: calls.clone(),
            },
            tmp.path().to_path_buf(),
            1,
        );

        let a = client.complete("prompt a").await.unwrap();
        let again = client.complete("prompt a").await.unwrap();
        assert_eq!(a, again);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.calls_today(), 1);

        let err = client.complete("prompt b").await.unwrap_err();
        assert!(matches!(err, AnalysisError::DailyLimit(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_replies_are_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let client = CachingClient::new(
            Counting {
                calls: calls.clone(),
            },
            tmp.path().to_path_buf(),
            10,
        )
        .with_reply_check(|reply| !reply.starts_with("reply to"));

        client.complete("prompt a").await.unwrap();
        client.complete("prompt a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.calls_today(), 2);
    }

    #[tokio::test]
    async fn counter_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let c = CachingClient::new(Counting { calls: calls.clone() }, tmp.path().to_path_buf(), 5);
            c.complete("one").await.unwrap();
            c.complete("two").await.unwrap();
        }
        let c = CachingClient::new(Counting { calls }, tmp.path().to_path_buf(), 5);
        assert_eq!(c.calls_today(), 2);
    }

    #[tokio::test]
    async fn disabled_client_reports_disabled() {
        let err = DisabledClient.complete("x").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Disabled));
    }

    #[serial_test::serial]
    #[test]
    fn factory_falls_back_to_disabled_without_key() {
        std::env::remove_var("AI_TEST_MODE");
        let cfg = AiConfig {
            api_key: String::new(),
            ..AiConfig::default()
        };
        assert_eq!(build_client_from_config(&cfg).name(), "disabled");

        let off = AiConfig {
            enabled: false,
            api_key: "k".into(),
            ..AiConfig::default()
        };
        assert_eq!(build_client_from_config(&off).name(), "disabled");
    }

    #[serial_test::serial]
    #[test]
    fn factory_honors_mock_mode() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("AI_TEST_MODE", "mock");
        let cfg = AiConfig {
            cache_dir: tmp.path().display().to_string(),
            ..AiConfig::default()
        };
        assert_eq!(build_client_from_config(&cfg).name(), "mock");
        std::env::remove_var("AI_TEST_MODE");
    }
}
