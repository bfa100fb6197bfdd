//! Records that flow through the pipeline, from scanned disclosure to the
//! enriched record handed to the sink.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One exchange announcement as listed on the exchange page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disclosure {
    pub issuer_code: String,
    pub issuer_name: String,
    pub title: String,
    /// Exchange wall-clock time with its UTC offset.
    pub announced_at: DateTime<FixedOffset>,
    pub document_url: String,
    pub price_sensitive: bool,
    pub page_count: Option<u32>,
    pub file_size: Option<String>,
    /// Set when the listing date could not be parsed and the scan time was used.
    #[serde(default)]
    pub timestamp_estimated: bool,
}

impl Disclosure {
    /// Stable identity: hex SHA-256 of the source document URL.
    pub fn dedup_key(&self) -> String {
        url_digest(&self.document_url)
    }

    /// First 8 hex chars of the dedup key, used in storage paths.
    pub fn short_hash(&self) -> String {
        self.dedup_key()[..8].to_string()
    }

    pub fn announced_at_utc(&self) -> DateTime<Utc> {
        self.announced_at.with_timezone(&Utc)
    }
}

pub(crate) fn url_digest(url: &str) -> String {
    hex(&Sha256::digest(url.as_bytes()))
}

/// Lowercase hex encoding.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Metadata pulled out of a converted document. Missing fields stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub num_pages: usize,
    pub file_size: usize,
    pub title: String,
    pub author: String,
    pub subject: String,
    pub creation_date: String,
    pub producer: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    /// Case-insensitive match against the fixed enumeration.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bullish" => Some(Sentiment::Bullish),
            "bearish" => Some(Sentiment::Bearish),
            "neutral" => Some(Sentiment::Neutral),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Bullish => "bullish",
            Sentiment::Bearish => "bearish",
            Sentiment::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub summary: String,
    pub sentiment: Sentiment,
    pub key_insights: Vec<String>,
    pub financial_impact: Option<String>,
    /// Always within `0.0..=1.0`.
    pub confidence_score: f64,
    pub llm_model: String,
    pub processing_time_ms: u64,
}

/// Market context for one issuer. Every metric is independently optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub issuer_code: String,
    pub ticker: String,
    pub current_price: Option<f64>,
    pub price_at_announcement: Option<f64>,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub volume: Option<u64>,
    pub performance_1m_pct: Option<f64>,
    pub performance_3m_pct: Option<f64>,
    pub performance_6m_pct: Option<f64>,
    pub price_change_1h_pct: Option<f64>,
    pub price_change_1d_pct: Option<f64>,
    pub fetched_at: DateTime<Utc>,
    pub data_available: bool,
    pub error: Option<String>,
}

impl MarketSnapshot {
    pub fn empty(issuer_code: &str, ticker: &str) -> Self {
        Self {
            issuer_code: issuer_code.to_ascii_uppercase(),
            ticker: ticker.to_string(),
            current_price: None,
            price_at_announcement: None,
            market_cap: None,
            pe_ratio: None,
            volume: None,
            performance_1m_pct: None,
            performance_3m_pct: None,
            performance_6m_pct: None,
            price_change_1h_pct: None,
            price_change_1d_pct: None,
            fetched_at: Utc::now(),
            data_available: false,
            error: None,
        }
    }
}

/// The record handed to the persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedDisclosure {
    pub disclosure: Disclosure,
    pub document_path: String,
    pub text_path: String,
    pub metadata: DocumentMetadata,
    pub text: String,
    pub analysis: Option<AnalysisResult>,
    pub market: Option<MarketSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(url: &str) -> Disclosure {
        Disclosure {
            issuer_code: "BHP".into(),
            issuer_name: "BHP".into(),
            title: "Quarterly Activities Report".into(),
            announced_at: FixedOffset::east_opt(11 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 11, 7, 9, 30, 0)
                .unwrap(),
            document_url: url.into(),
            price_sensitive: true,
            page_count: Some(7),
            file_size: Some("58.5KB".into()),
            timestamp_estimated: false,
        }
    }

    #[test]
    fn dedup_key_depends_only_on_url() {
        let a = sample("https://www.asx.com.au/asxpdf/20251107/pdf/06abc.pdf");
        let mut b = a.clone();
        b.title = "Different title".into();
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.short_hash().len(), 8);

        let c = sample("https://www.asx.com.au/asxpdf/20251107/pdf/06abd.pdf");
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn sentiment_parse_is_case_insensitive() {
        assert_eq!(Sentiment::parse(" Bullish "), Some(Sentiment::Bullish));
        assert_eq!(Sentiment::parse("BEARISH"), Some(Sentiment::Bearish));
        assert_eq!(Sentiment::parse("mixed"), None);
    }
}
