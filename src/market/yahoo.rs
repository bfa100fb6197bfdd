//! Yahoo Finance market data.
//!
//! Quote fields come from the v8 chart `meta` block, price series from the v8
//! chart API, and market cap / P/E from the v7 quote endpoint when enabled.
//! Yahoo has no official API, so every field is treated as optional.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{Interval, MarketDataProvider, PricePoint, Quote};
use crate::config::MarketConfig;
use crate::error::EnrichmentError;

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    regular_market_price: Option<f64>,
    regular_market_volume: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

/// v7 quote endpoint response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    quote_response: QuoteResult,
}

#[derive(Debug, Deserialize)]
struct QuoteResult {
    #[serde(default)]
    result: Vec<QuoteFields>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteFields {
    market_cap: Option<f64>,
    #[serde(rename = "trailingPE")]
    trailing_pe: Option<f64>,
    regular_market_price: Option<f64>,
    regular_market_volume: Option<u64>,
}

pub struct YahooChartProvider {
    client: reqwest::Client,
    base_url: String,
    fetch_fundamentals: bool,
}

impl YahooChartProvider {
    pub fn new(cfg: &MarketConfig, user_agent: &str) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(user_agent.to_string())
            .build()
            .map_err(|e| EnrichmentError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            fetch_fundamentals: cfg.fetch_fundamentals,
        })
    }

    async fn chart(&self, ticker: &str, query: &[(&str, String)]) -> Result<ChartData, EnrichmentError> {
        let url = format!("{}/v8/finance/chart/{ticker}", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| EnrichmentError::Request(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(EnrichmentError::SymbolNotFound(ticker.to_string()));
        }
        if !status.is_success() {
            return Err(EnrichmentError::Status(status.as_u16()));
        }
        let body: ChartResponse = resp
            .json()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        parse_chart(ticker, body)
    }

    async fn fundamentals(&self, ticker: &str) -> Result<QuoteFields, EnrichmentError> {
        let url = format!("{}/v7/finance/quote", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(&[("symbols", ticker)])
            .send()
            .await
            .map_err(|e| EnrichmentError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EnrichmentError::Status(resp.status().as_u16()));
        }
        let body: QuoteResponse = resp
            .json()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        body.quote_response
            .result
            .into_iter()
            .next()
            .ok_or_else(|| EnrichmentError::SymbolNotFound(ticker.to_string()))
    }
}

fn parse_chart(ticker: &str, resp: ChartResponse) -> Result<ChartData, EnrichmentError> {
    let result = resp.chart.result.ok_or_else(|| match resp.chart.error {
        Some(err) if err.code == "Not Found" => EnrichmentError::SymbolNotFound(ticker.to_string()),
        Some(err) => EnrichmentError::Malformed(format!("{}: {}", err.code, err.description)),
        None => EnrichmentError::Malformed("empty result with no error".into()),
    })?;
    result
        .into_iter()
        .next()
        .ok_or_else(|| EnrichmentError::Malformed("result array is empty".into()))
}

/// Samples with a close; nulls (halts, holidays) are dropped.
fn series(data: &ChartData) -> Vec<PricePoint> {
    let Some(timestamps) = &data.timestamp else {
        return Vec::new();
    };
    let Some(quote) = data.indicators.quote.first() else {
        return Vec::new();
    };
    timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let close = quote.close.get(i).copied().flatten()?;
            let at = DateTime::from_timestamp(ts, 0)?;
            Some(PricePoint {
                at,
                close,
                volume: quote.volume.get(i).copied().flatten(),
            })
        })
        .collect()
}

#[async_trait]
impl MarketDataProvider for YahooChartProvider {
    async fn quote(&self, ticker: &str) -> Result<Quote, EnrichmentError> {
        let data = self
            .chart(ticker, &[("range", "5d".into()), ("interval", "1d".into())])
            .await?;
        let meta = data.meta.as_ref();
        let last = series(&data).pop();
        let mut quote = Quote {
            price: meta
                .and_then(|m| m.regular_market_price)
                .or(last.as_ref().map(|p| p.close)),
            volume: meta
                .and_then(|m| m.regular_market_volume)
                .or(last.and_then(|p| p.volume)),
            market_cap: None,
            pe_ratio: None,
        };

        if self.fetch_fundamentals {
            match self.fundamentals(ticker).await {
                Ok(f) => {
                    quote.market_cap = f.market_cap;
                    quote.pe_ratio = f.trailing_pe;
                    quote.price = quote.price.or(f.regular_market_price);
                    quote.volume = quote.volume.or(f.regular_market_volume);
                }
                Err(e) => {
                    tracing::debug!(target: "market", ticker, "fundamentals unavailable: {e}");
                }
            }
        }
        Ok(quote)
    }

    async fn history(
        &self,
        ticker: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, EnrichmentError> {
        let interval = match interval {
            Interval::Daily => "1d",
            Interval::Hourly => "1h",
        };
        let data = self
            .chart(
                ticker,
                &[
                    ("period1", from.timestamp().to_string()),
                    ("period2", to.timestamp().to_string()),
                    ("interval", interval.to_string()),
                    ("includePrePost", "false".into()),
                ],
            )
            .await?;
        let mut points = series(&data);
        points.sort_by_key(|p| p.at);
        Ok(points)
    }

    fn name(&self) -> &'static str {
        "yahoo"
    }
}
