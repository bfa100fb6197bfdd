//! Market-data enrichment: quote fields, trailing performance and the price
//! reaction to an announcement.

pub mod performance;
pub mod yahoo;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use metrics::counter;
use tokio::sync::Semaphore;

use crate::config::MarketConfig;
use crate::error::EnrichmentError;
use crate::metrics::MARKET_SNAPSHOTS;
use crate::model::MarketSnapshot;

pub use yahoo::YahooChartProvider;

/// Trailing history requested for the performance windows.
const HISTORY_DAYS: i64 = 186;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub close: f64,
    pub volume: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quote {
    pub price: Option<f64>,
    pub volume: Option<u64>,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn quote(&self, ticker: &str) -> Result<Quote, EnrichmentError>;
    /// Time-ordered samples between `from` and `to`.
    async fn history(
        &self,
        ticker: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, EnrichmentError>;
    fn name(&self) -> &'static str;
}

/// `bhp` -> `BHP.AX`; an existing suffix is not doubled, whatever its case.
pub fn format_ticker(issuer_code: &str, suffix: &str) -> String {
    let code = issuer_code.trim().to_ascii_uppercase();
    let suffix = suffix.trim().to_ascii_uppercase();
    let bare = code.strip_suffix(&suffix).unwrap_or(&code);
    format!("{bare}{suffix}")
}

#[derive(Clone)]
pub struct MarketEnricher {
    provider: Arc<dyn MarketDataProvider>,
    ticker_suffix: String,
    attempts: u32,
    retry_delay: Duration,
    reaction_window_days: i64,
    precision: u32,
    max_concurrent: usize,
}

impl MarketEnricher {
    pub fn new(provider: Arc<dyn MarketDataProvider>, cfg: &MarketConfig) -> Self {
        Self {
            provider,
            ticker_suffix: cfg.ticker_suffix.clone(),
            attempts: cfg.retry_attempts.max(1),
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
            reaction_window_days: cfg.reaction_window_days,
            precision: cfg.precision,
            max_concurrent: cfg.max_concurrent.max(1),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Never fails: exhausted retries yield `data_available = false`.
    pub async fn fetch_snapshot(
        &self,
        issuer_code: &str,
        announced_at: Option<DateTime<FixedOffset>>,
    ) -> MarketSnapshot {
        self.fetch_snapshot_at(issuer_code, announced_at, Utc::now()).await
    }

    /// Snapshots for `(issuer_code, announced_at)` pairs, at most
    /// `max_concurrent` in flight. Results come back in input order.
    pub async fn snapshot_batch(
        &self,
        items: &[(String, Option<DateTime<FixedOffset>>)],
    ) -> Vec<MarketSnapshot> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let handles: Vec<_> = items
            .iter()
            .cloned()
            .map(|(code, announced)| {
                let enricher = self.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    enricher.fetch_snapshot(&code, announced).await
                })
            })
            .collect();

        let mut out = Vec::with_capacity(items.len());
        for ((code, _), handle) in items.iter().zip(handles) {
            match handle.await {
                Ok(snapshot) => out.push(snapshot),
                Err(e) => {
                    let mut snapshot =
                        MarketSnapshot::empty(code, &format_ticker(code, &self.ticker_suffix));
                    snapshot.error = Some(format!("snapshot task failed: {e}"));
                    out.push(snapshot);
                }
            }
        }
        tracing::info!(
            target: "market",
            requested = items.len(),
            available = out.iter().filter(|s| s.data_available).count(),
            "batch snapshots fetched"
        );
        out
    }

    pub async fn fetch_snapshot_at(
        &self,
        issuer_code: &str,
        announced_at: Option<DateTime<FixedOffset>>,
        now: DateTime<Utc>,
    ) -> MarketSnapshot {
        let ticker = format_ticker(issuer_code, &self.ticker_suffix);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.try_snapshot(issuer_code, &ticker, announced_at, now).await {
                Ok(snapshot) => {
                    counter!(MARKET_SNAPSHOTS, "available" => "true").increment(1);
                    tracing::info!(
                        target: "market",
                        ticker = %ticker,
                        price = ?snapshot.current_price,
                        market_cap = ?snapshot.market_cap,
                        "snapshot fetched"
                    );
                    return snapshot;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "market",
                        ticker = %ticker,
                        attempt,
                        max = self.attempts,
                        "snapshot attempt failed: {e}"
                    );
                    last_error = e.to_string();
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        counter!(MARKET_SNAPSHOTS, "available" => "false").increment(1);
        let mut snapshot = MarketSnapshot::empty(issuer_code, &ticker);
        snapshot.fetched_at = now;
        snapshot.error = Some(format!(
            "Failed after {} attempts: {last_error}",
            self.attempts
        ));
        snapshot
    }

    async fn try_snapshot(
        &self,
        issuer_code: &str,
        ticker: &str,
        announced_at: Option<DateTime<FixedOffset>>,
        now: DateTime<Utc>,
    ) -> Result<MarketSnapshot, EnrichmentError> {
        let quote = self.provider.quote(ticker).await?;
        let daily = self
            .provider
            .history(ticker, Interval::Daily, now - chrono::Duration::days(HISTORY_DAYS), now)
            .await?;

        let mut s = MarketSnapshot::empty(issuer_code, ticker);
        s.fetched_at = now;
        s.current_price = quote.price.or(daily.last().map(|p| p.close));
        s.volume = quote.volume.or(daily.last().and_then(|p| p.volume));
        s.market_cap = quote.market_cap;
        s.pe_ratio = quote.pe_ratio;
        s.performance_1m_pct =
            performance::performance_pct(&daily, now, performance::WINDOW_1M_DAYS, self.precision);
        s.performance_3m_pct =
            performance::performance_pct(&daily, now, performance::WINDOW_3M_DAYS, self.precision);
        s.performance_6m_pct =
            performance::performance_pct(&daily, now, performance::WINDOW_6M_DAYS, self.precision);

        if let Some(announced) = announced_at {
            let age = now - announced.with_timezone(&Utc);
            if age <= chrono::Duration::days(self.reaction_window_days) {
                let (at_announcement, change_1d) =
                    performance::daily_reaction(&daily, announced, self.precision);
                s.price_at_announcement = at_announcement;
                s.price_change_1d_pct = change_1d;
                s.price_change_1h_pct = self.hourly_change(ticker, announced, now).await;
            } else {
                tracing::debug!(target: "market", ticker, "announcement outside reaction window");
            }
        }

        s.data_available = true;
        Ok(s)
    }

    /// Best effort; intraday data is often unavailable.
    async fn hourly_change(
        &self,
        ticker: &str,
        announced: DateTime<FixedOffset>,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let start = announced.with_timezone(&Utc) - chrono::Duration::hours(1);
        let end = (announced.with_timezone(&Utc) + chrono::Duration::days(3)).min(now);
        if end <= start {
            return None;
        }
        match self.provider.history(ticker, Interval::Hourly, start, end).await {
            Ok(hourly) => performance::hourly_reaction(&hourly, announced, self.precision),
            Err(e) => {
                tracing::debug!(target: "market", ticker, "hourly series unavailable: {e}");
                None
            }
        }
    }
}
