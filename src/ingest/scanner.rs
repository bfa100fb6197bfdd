//! Exchange listing page scanner.
//!
//! The page is a single table; each announcement row has exactly four cells:
//! issuer code, date with a `dates-time` span, a price-sensitivity marker, and
//! the document anchor with `page`/`filesize` spans.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;

use super::{normalize_text, ListingSource, ScanAnomaly, ScanReport};
use crate::config::ExchangeConfig;
use crate::error::ScanError;
use crate::metrics::{ensure_metrics_described, DISCLOSURES_SCANNED};
use crate::model::Disclosure;

/// Accepted listing date layouts, tried in order after whitespace collapse.
const DATE_FORMATS: &[&str] = &[
    "%d/%m/%Y %I:%M %p",
    "%d/%m/%Y %I:%M:%S %p",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const MAX_CODE_LEN: usize = 10;

pub struct ExchangeScanner {
    http: reqwest::Client,
    listing_url: String,
    origin: String,
    tz: Tz,
    timeout_secs: u64,
}

impl ExchangeScanner {
    pub fn new(cfg: &ExchangeConfig) -> Result<Self, ScanError> {
        let tz: Tz = cfg
            .timezone
            .parse()
            .map_err(|_| ScanError::Config(format!("unknown timezone {}", cfg.timezone)))?;
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ScanError::Config(e.to_string()))?;
        Ok(Self {
            http,
            listing_url: cfg.listing_url.clone(),
            origin: cfg.origin.trim_end_matches('/').to_string(),
            tz,
            timeout_secs: cfg.timeout_secs,
        })
    }

    async fn fetch_page(&self) -> Result<String, ScanError> {
        let resp = self
            .http
            .get(&self.listing_url)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ScanError::Status(status.as_u16()));
        }
        resp.text().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> ScanError {
        if e.is_timeout() {
            ScanError::Timeout(self.timeout_secs)
        } else {
            ScanError::Transport(e.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ListingSource for ExchangeScanner {
    async fn scan(&self, price_sensitive_only: bool) -> Result<ScanReport, ScanError> {
        ensure_metrics_described();
        let started = std::time::Instant::now();
        let html = self.fetch_page().await?;
        let mut report = parse_listing(&html, &self.origin, self.tz, Utc::now());
        counter!(DISCLOSURES_SCANNED).increment(report.total_count as u64);

        for a in &report.anomalies {
            tracing::warn!(
                target: "scanner",
                issuer = %a.issuer_code,
                raw = %a.raw_value,
                "{}; using scan time",
                a.reason
            );
        }
        if price_sensitive_only {
            report.retain_price_sensitive();
        }
        tracing::info!(
            target: "scanner",
            total = report.total_count,
            price_sensitive = report.price_sensitive_count,
            kept = report.disclosures.len(),
            anomalies = report.anomalies.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "listing scanned"
        );
        Ok(report)
    }

    fn name(&self) -> &'static str {
        "exchange"
    }
}

fn re(cell: &'static OnceCell<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

fn row_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r"(?is)<tr\b[^>]*>(.*?)</tr>")
}

fn cell_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r"(?is)<td\b[^>]*>(.*?)</td>")
}

fn span_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r"(?is)<span\b([^>]*)>(.*?)</span>")
}

fn anchor_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r#"(?is)<a\b([^>]*\bhref\s*=\s*["']([^"']*)["'][^>]*)>(.*?)</a>"#)
}

fn class_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r#"(?is)\bclass\s*=\s*["']([^"']*)["']"#)
}

fn br_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r"(?i)<br\s*/?>")
}

fn digits_re() -> &'static Regex {
    static R: OnceCell<Regex> = OnceCell::new();
    re(&R, r"(\d+)")
}

fn has_class(attrs: &str, class: &str) -> bool {
    class_re()
        .captures(attrs)
        .and_then(|c| c.get(1))
        .is_some_and(|v| v.as_str().split_whitespace().any(|c| c == class))
}

/// Inner HTML of the first `<span>` carrying `class`.
fn find_span<'a>(html: &'a str, class: &str) -> Option<(std::ops::Range<usize>, &'a str)> {
    span_re().captures_iter(html).find_map(|c| {
        let attrs = c.get(1)?.as_str();
        if has_class(attrs, class) {
            let whole = c.get(0)?;
            Some((whole.range(), c.get(2)?.as_str()))
        } else {
            None
        }
    })
}

/// Parse the listing page. Disclosures are returned unfiltered; the report's
/// counts describe every accepted row.
pub fn parse_listing(html: &str, origin: &str, tz: Tz, scanned_at: DateTime<Utc>) -> ScanReport {
    let mut disclosures = Vec::new();
    let mut anomalies = Vec::new();

    for row in row_re().captures_iter(html) {
        let Some(inner) = row.get(1) else { continue };
        let cells: Vec<&str> = cell_re()
            .captures_iter(inner.as_str())
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if cells.len() != 4 {
            continue;
        }
        if let Some((d, anomaly)) = parse_row(&cells, origin, tz, scanned_at) {
            disclosures.push(d);
            anomalies.extend(anomaly);
        }
    }

    let price_sensitive_count = disclosures.iter().filter(|d| d.price_sensitive).count();
    ScanReport {
        total_count: disclosures.len(),
        price_sensitive_count,
        disclosures,
        anomalies,
        scanned_at,
    }
}

fn parse_row(
    cells: &[&str],
    origin: &str,
    tz: Tz,
    scanned_at: DateTime<Utc>,
) -> Option<(Disclosure, Option<ScanAnomaly>)> {
    let code = normalize_text(cells[0]);
    if code.is_empty() || code.chars().count() > MAX_CODE_LEN {
        return None;
    }

    let raw_date = date_text(cells[1]);
    if raw_date.is_empty() {
        tracing::debug!(target: "scanner", issuer = %code, "row without date");
        return None;
    }

    let price_sensitive = is_price_sensitive(cells[2]);

    let details = cells[3];
    let anchor = anchor_re().captures(details)?;
    let href = html_escape::decode_html_entities(anchor.get(2)?.as_str()).trim().to_string();
    let document_url = resolve_url(&href, origin)?;
    let anchor_body = anchor.get(3)?.as_str();
    let title_html = br_re()
        .split(anchor_body)
        .next()
        .unwrap_or(anchor_body);
    // nested spans before the break carry metadata, not title text
    let title_html = span_re().replace_all(title_html, "");
    let title = normalize_text(&title_html);
    if title.is_empty() {
        tracing::debug!(target: "scanner", issuer = %code, "row without title");
        return None;
    }

    let page_count = find_span(details, "page").and_then(|(_, inner)| {
        let text = normalize_text(inner);
        digits_re()
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
    });
    let file_size = find_span(details, "filesize")
        .map(|(_, inner)| normalize_text(inner))
        .filter(|s| !s.is_empty());

    let (announced_at, anomaly) = match parse_listing_date(&raw_date, tz) {
        Some(ts) => (ts, None),
        None => (
            scanned_at.with_timezone(&tz).fixed_offset(),
            Some(ScanAnomaly {
                issuer_code: code.clone(),
                raw_value: raw_date.clone(),
                reason: "unparseable listing date".into(),
            }),
        ),
    };

    let disclosure = Disclosure {
        issuer_name: code.clone(),
        issuer_code: code,
        title,
        announced_at,
        document_url,
        price_sensitive,
        page_count,
        file_size,
        timestamp_estimated: anomaly.is_some(),
    };
    Some((disclosure, anomaly))
}

/// First text line of the date cell joined with the `dates-time` span.
fn date_text(cell: &str) -> String {
    let (date_part, time) = match find_span(cell, "dates-time") {
        Some((range, inner)) => {
            let mut without = String::with_capacity(cell.len());
            without.push_str(&cell[..range.start]);
            without.push('\n');
            without.push_str(&cell[range.end..]);
            (without, normalize_text(inner))
        }
        None => (cell.to_string(), String::new()),
    };
    let with_breaks = br_re().replace_all(&date_part, "\n");
    let date = with_breaks
        .lines()
        .map(normalize_text)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    format!("{date} {time}").trim().to_string()
}

fn is_price_sensitive(cell: &str) -> bool {
    if !normalize_text(cell).is_empty() {
        return true;
    }
    static IMG: OnceCell<Regex> = OnceCell::new();
    re(&IMG, r"(?i)<img\b").is_match(cell) || cell.contains('$')
}

fn resolve_url(href: &str, origin: &str) -> Option<String> {
    if href.starts_with('/') {
        Some(format!("{origin}{href}"))
    } else if href.starts_with("http") {
        Some(href.to_string())
    } else {
        None
    }
}

/// Parse a listing date in the exchange timezone. Ambiguous local times take
/// the earlier instant; nonexistent ones are read as UTC.
pub fn parse_listing_date(raw: &str, tz: Tz) -> Option<DateTime<FixedOffset>> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&collapsed, f).ok())?;
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive));
    Some(local.fixed_offset())
}
