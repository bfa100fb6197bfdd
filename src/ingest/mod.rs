// src/ingest/mod.rs
//! Discovery and download: the listing scanner, the document fetcher and the
//! consent-page heuristics the fetcher falls back on.

pub mod consent;
pub mod fetcher;
pub mod scanner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::model::Disclosure;

pub use fetcher::{BatchFetchStats, ContentFetcher, DocumentSource, FetchOutcome, HttpDocumentSource};
pub use scanner::ExchangeScanner;

/// A listing row accepted with a guessed value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanAnomaly {
    pub issuer_code: String,
    pub raw_value: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Disclosures after the price-sensitivity filter.
    pub disclosures: Vec<Disclosure>,
    /// Rows parsed before filtering.
    pub total_count: usize,
    pub price_sensitive_count: usize,
    pub anomalies: Vec<ScanAnomaly>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    /// Keep only price-sensitive disclosures; counts are left untouched.
    pub fn retain_price_sensitive(&mut self) {
        self.disclosures.retain(|d| d.price_sensitive);
    }
}

#[async_trait::async_trait]
pub trait ListingSource: Send + Sync {
    async fn scan(&self, price_sensitive_only: bool) -> Result<ScanReport, ScanError>;
    fn name(&self) -> &'static str;
}

/// Strip tags, decode entities, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(s, " ");

    let decoded = html_escape::decode_html_entities(&stripped).replace('\u{a0}', " ");

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&decoded, " ").trim().to_string()
}
