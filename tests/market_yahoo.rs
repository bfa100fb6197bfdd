// tests/market_yahoo.rs
//
// Market snapshots from Yahoo-shaped chart and quote responses served by a
// mock server. `now` is pinned so the performance windows are exact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use disclosure_pipeline::config::MarketConfig;
use disclosure_pipeline::market::{MarketEnricher, YahooChartProvider};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 20, 6, 0, 0).unwrap()
}

fn announced() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(11 * 3600)
        .unwrap()
        .with_ymd_and_hms(2025, 11, 10, 9, 15, 0)
        .unwrap()
}

fn chart(points: &[(DateTime<Utc>, f64)], price: Option<f64>) -> serde_json::Value {
    let timestamps: Vec<i64> = points.iter().map(|(at, _)| at.timestamp()).collect();
    let closes: Vec<f64> = points.iter().map(|(_, c)| *c).collect();
    let volumes: Vec<u64> = points.iter().map(|_| 1_000_000).collect();
    json!({
        "chart": {
            "result": [{
                "meta": {
                    "currency": "AUD",
                    "symbol": "BHP.AX",
                    "regularMarketPrice": price,
                    "regularMarketVolume": 4_200_000u64
                },
                "timestamp": timestamps,
                "indicators": { "quote": [{ "close": closes, "volume": volumes }] }
            }],
            "error": null
        }
    })
}

/// One close per day for 200 days ending at `now`, falling by one per day
/// into the past: 300 today, 270 thirty days ago.
fn daily_series() -> Vec<(DateTime<Utc>, f64)> {
    (0..200i64)
        .rev()
        .map(|d| (now() - chrono::Duration::days(d), 300.0 - d as f64))
        .collect()
}

fn market_config(server: &MockServer) -> MarketConfig {
    MarketConfig {
        base_url: server.uri(),
        retry_attempts: 2,
        timeout_secs: 5,
        ..MarketConfig::default()
    }
}

async fn mount_bhp(server: &MockServer) {
    let hourly = vec![
        (Utc.with_ymd_and_hms(2025, 11, 9, 22, 0, 0).unwrap(), 289.0),
        (Utc.with_ymd_and_hms(2025, 11, 9, 23, 0, 0).unwrap(), 290.0),
        (Utc.with_ymd_and_hms(2025, 11, 10, 0, 0, 0).unwrap(), 292.9),
    ];
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/BHP.AX"))
        .and(query_param("interval", "1h"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chart(&hourly, None)))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/BHP.AX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chart(&daily_series(), Some(301.5))))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v7/finance/quote"))
        .and(query_param("symbols", "BHP.AX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "quoteResponse": {
                "result": [{
                    "symbol": "BHP.AX",
                    "marketCap": 1.5e11,
                    "trailingPE": 11.2,
                    "regularMarketPrice": 301.5
                }],
                "error": null
            }
        })))
        .mount(server)
        .await;
}

fn enricher(cfg: &MarketConfig) -> MarketEnricher {
    let provider = YahooChartProvider::new(cfg, "disclosure-pipeline-tests/1.0").expect("provider");
    MarketEnricher::new(Arc::new(provider), cfg).with_retry_delay(Duration::from_millis(0))
}

#[tokio::test]
async fn snapshot_combines_quote_history_and_reaction() {
    let server = MockServer::start().await;
    mount_bhp(&server).await;
    let enricher = enricher(&market_config(&server));

    let s = enricher.fetch_snapshot_at("bhp", Some(announced()), now()).await;
    assert!(s.data_available, "error: {:?}", s.error);
    assert_eq!(s.issuer_code, "BHP");
    assert_eq!(s.ticker, "BHP.AX");
    assert_eq!(s.current_price, Some(301.5));
    assert_eq!(s.volume, Some(4_200_000));
    assert_eq!(s.market_cap, Some(1.5e11));
    assert_eq!(s.pe_ratio, Some(11.2));

    // 270 -> 300, 210 -> 300, 120 -> 300
    assert_eq!(s.performance_1m_pct, Some(11.11));
    assert_eq!(s.performance_3m_pct, Some(42.86));
    assert_eq!(s.performance_6m_pct, Some(150.0));

    // first daily bar on the announcement date closes at 290, the next at 291
    assert_eq!(s.price_at_announcement, Some(290.0));
    assert_eq!(s.price_change_1d_pct, Some(0.34));
    // 23:00Z at 290 to 00:00Z at 292.9
    assert_eq!(s.price_change_1h_pct, Some(1.0));
    assert_eq!(s.fetched_at, now());
    assert!(s.error.is_none());
}

#[tokio::test]
async fn old_announcement_has_no_reaction_fields() {
    let server = MockServer::start().await;
    mount_bhp(&server).await;
    let enricher = enricher(&market_config(&server));

    let long_ago = FixedOffset::east_opt(11 * 3600)
        .unwrap()
        .with_ymd_and_hms(2025, 6, 2, 10, 0, 0)
        .unwrap();
    let s = enricher.fetch_snapshot_at("BHP", Some(long_ago), now()).await;
    assert!(s.data_available);
    assert_eq!(s.performance_1m_pct, Some(11.11));
    assert_eq!(s.price_at_announcement, None);
    assert_eq!(s.price_change_1d_pct, None);
    assert_eq!(s.price_change_1h_pct, None);
}

#[tokio::test]
async fn unknown_symbol_yields_unavailable_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/ZZZ.AX"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "chart": {
                "result": null,
                "error": { "code": "Not Found", "description": "No data found, symbol may be delisted" }
            }
        })))
        .expect(2)
        .mount(&server)
        .await;
    let enricher = enricher(&market_config(&server));

    let s = enricher.fetch_snapshot_at("ZZZ", None, now()).await;
    assert!(!s.data_available);
    assert_eq!(s.ticker, "ZZZ.AX");
    assert_eq!(s.current_price, None);
    assert_eq!(s.performance_1m_pct, None);
    let err = s.error.expect("error recorded");
    assert!(err.starts_with("Failed after 2 attempts:"), "{err}");
    assert!(err.contains("ZZZ.AX"), "{err}");
}

#[tokio::test]
async fn fundamentals_failure_keeps_chart_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/CBA.AX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chart(&daily_series(), None)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v7/finance/quote"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let enricher = enricher(&market_config(&server));

    let s = enricher.fetch_snapshot_at("CBA", None, now()).await;
    assert!(s.data_available);
    // no meta price, so the last close stands in
    assert_eq!(s.current_price, Some(300.0));
    assert_eq!(s.market_cap, None);
    assert_eq!(s.pe_ratio, None);
    assert_eq!(s.performance_6m_pct, Some(150.0));
}
