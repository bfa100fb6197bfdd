//! Document download with dedup against the blob store, bounded retry and a
//! bounded worker pool for batches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, Semaphore};

use super::consent;
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::metrics::{DOCUMENTS_DOWNLOADED, DOCUMENTS_SKIPPED, FETCH_FAILURES};
use crate::model::Disclosure;
use crate::storage::{document_path, BlobStore};

const PDF_MAGIC: &[u8] = b"%PDF";

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// One download attempt for a URL, including any interstitial follow-ups.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError>;
    fn name(&self) -> &'static str;
}

/// Cookie-carrying HTTP client that can step through a consent page.
pub struct HttpDocumentSource {
    http: reqwest::Client,
    timeout_secs: u64,
    max_candidates: usize,
}

impl HttpDocumentSource {
    pub fn new(cfg: &FetchConfig, user_agent: &str) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .cookie_store(true)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            timeout_secs: cfg.timeout_secs,
            max_candidates: cfg.max_consent_candidates,
        })
    }

    async fn get(&self, url: &str) -> Result<(Vec<u8>, String), FetchError> {
        let resp = self
            .http
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "application/pdf,text/html;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        Ok((body.to_vec(), content_type))
    }

    fn transport_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout_secs)
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

fn looks_like_html(bytes: &[u8], content_type: &str) -> bool {
    if content_type.contains("html") {
        return true;
    }
    let head = &bytes[..bytes.len().min(512)];
    let lower = String::from_utf8_lossy(head).to_ascii_lowercase();
    lower.contains("<html") || lower.contains("<!doctype html")
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let (body, content_type) = self.get(url).await?;
        if is_pdf(&body) {
            return Ok(body);
        }
        if !looks_like_html(&body, &content_type) {
            return Err(FetchError::InvalidDocument(format!(
                "body from {url} does not start with %PDF"
            )));
        }

        let html = String::from_utf8_lossy(&body);
        let candidates = consent::candidates(&html, url, self.max_candidates);
        tracing::debug!(
            target: "fetcher",
            url,
            candidates = candidates.len(),
            "interstitial page, trying follow-up links"
        );
        let mut last_err = None;
        for candidate in &candidates {
            match self.get(candidate).await {
                Ok((bytes, _)) if is_pdf(&bytes) => {
                    tracing::info!(target: "fetcher", url, via = %candidate, "document reached through interstitial");
                    return Ok(bytes);
                }
                Ok(_) => last_err = None,
                Err(e) => {
                    tracing::debug!(target: "fetcher", candidate = %candidate, "follow-up failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        // a transient failure on the last follow-up is worth another attempt
        if let Some(e) = last_err.filter(FetchError::is_retryable) {
            return Err(e);
        }
        Err(FetchError::InvalidDocument(format!(
            "interstitial at {url} yielded no document after {} follow-ups",
            candidates.len()
        )))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { path: String, bytes: usize },
    Skipped { path: String },
}

impl FetchOutcome {
    pub fn path(&self) -> &str {
        match self {
            FetchOutcome::Downloaded { path, .. } | FetchOutcome::Skipped { path } => path,
        }
    }

    pub fn was_downloaded(&self) -> bool {
        matches!(self, FetchOutcome::Downloaded { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchFetchStats {
    pub requested: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ContentFetcher {
    store: Arc<dyn BlobStore>,
    source: Arc<dyn DocumentSource>,
    max_attempts: u32,
    base_delay: Duration,
    max_concurrent: usize,
}

impl ContentFetcher {
    pub fn new(store: Arc<dyn BlobStore>, source: Arc<dyn DocumentSource>, cfg: &FetchConfig) -> Self {
        Self {
            store,
            source,
            max_attempts: cfg.max_retries.max(1),
            base_delay: Duration::from_secs(cfg.retry_delay_secs),
            max_concurrent: cfg.max_concurrent_downloads.max(1),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Store the disclosure's document, unless it is already stored.
    pub async fn fetch(&self, disclosure: &Disclosure) -> Result<FetchOutcome, FetchError> {
        let path = document_path(disclosure);
        if self.store.exists(&path).await? {
            tracing::debug!(target: "fetcher", issuer = %disclosure.issuer_code, path = %path, "already stored");
            counter!(DOCUMENTS_SKIPPED).increment(1);
            return Ok(FetchOutcome::Skipped { path });
        }

        let bytes = match self
            .download_with_retry(&disclosure.document_url, &disclosure.issuer_code)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                counter!(FETCH_FAILURES).increment(1);
                return Err(e);
            }
        };
        self.store.put(&path, &bytes).await?;
        counter!(DOCUMENTS_DOWNLOADED).increment(1);
        tracing::info!(
            target: "fetcher",
            issuer = %disclosure.issuer_code,
            path = %path,
            bytes = bytes.len(),
            "document stored"
        );
        Ok(FetchOutcome::Downloaded {
            path,
            bytes: bytes.len(),
        })
    }

    async fn download_with_retry(&self, url: &str, issuer: &str) -> Result<Vec<u8>, FetchError> {
        let mut last = String::new();
        for attempt in 0..self.max_attempts {
            match self.source.download(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        target: "fetcher",
                        issuer,
                        attempt = attempt + 1,
                        max = self.max_attempts,
                        "download failed: {e}"
                    );
                    last = e.to_string();
                    if attempt + 1 < self.max_attempts {
                        tokio::time::sleep(self.base_delay * 2u32.saturating_pow(attempt)).await;
                    }
                }
            }
        }
        Err(FetchError::RetriesExhausted {
            attempts: self.max_attempts,
            last,
        })
    }

    /// Fetch every disclosure through a pool of at most `max_concurrent`
    /// workers. Results come back in input order.
    pub async fn fetch_batch(
        &self,
        disclosures: &[Disclosure],
    ) -> (Vec<Result<FetchOutcome, FetchError>>, BatchFetchStats) {
        let total = disclosures.len();
        let mut stats = BatchFetchStats {
            requested: total,
            ..Default::default()
        };
        if total == 0 {
            return (Vec::new(), stats);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<FetchOutcome, FetchError>)>(total);
        let mut handles = Vec::with_capacity(total);

        for (idx, disclosure) in disclosures.iter().cloned().enumerate() {
            let fetcher = self.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => fetcher.fetch(&disclosure).await,
                    Err(e) => Err(FetchError::Worker(e.to_string())),
                };
                let _ = tx.send((idx, result)).await;
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<Result<FetchOutcome, FetchError>>> =
            (0..total).map(|_| None).collect();
        while let Some((idx, result)) = rx.recv().await {
            match &result {
                Ok(FetchOutcome::Downloaded { .. }) => stats.downloaded += 1,
                Ok(FetchOutcome::Skipped { .. }) => stats.skipped += 1,
                Err(_) => stats.failed += 1,
            }
            slots[idx] = Some(result);
        }

        let mut panics = Vec::new();
        for h in handles {
            if let Err(e) = h.await {
                panics.push(e.to_string());
            }
        }

        let results = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    stats.failed += 1;
                    Err(FetchError::Worker(
                        panics.first().cloned().unwrap_or_else(|| "worker exited".into()),
                    ))
                })
            })
            .collect();

        tracing::info!(
            target: "fetcher",
            requested = stats.requested,
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            failed = stats.failed,
            "batch fetched"
        );
        (results, stats)
    }
}
