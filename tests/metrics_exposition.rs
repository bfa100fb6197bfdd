// tests/metrics_exposition.rs
//
// One test per process: the Prometheus recorder can only be installed once.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use chrono_tz::Australia::Sydney;
use tower::ServiceExt;

use disclosure_pipeline::config::FetchConfig;
use disclosure_pipeline::convert::DocumentConverter;
use disclosure_pipeline::error::ScanError;
use disclosure_pipeline::ingest::{ContentFetcher, HttpDocumentSource, ListingSource, ScanReport};
use disclosure_pipeline::metrics::Metrics;
use disclosure_pipeline::pipeline::{MemorySink, Pipeline, RunOptions};
use disclosure_pipeline::scheduler::{ScheduledPipeline, Scheduler, Trigger};
use disclosure_pipeline::storage::MemoryBlobStore;

struct DownListing;

#[async_trait]
impl ListingSource for DownListing {
    async fn scan(&self, _price_sensitive_only: bool) -> Result<ScanReport, ScanError> {
        Err(ScanError::Timeout(30))
    }

    fn name(&self) -> &'static str {
        "down"
    }
}

#[tokio::test]
async fn metrics_endpoint_contains_pipeline_series() {
    let metrics = Metrics::init().expect("install recorder");

    let store = Arc::new(MemoryBlobStore::default());
    let source = HttpDocumentSource::new(&FetchConfig::default(), "disclosure-pipeline-tests/1.0").unwrap();
    let fetcher = ContentFetcher::new(store.clone(), Arc::new(source), &FetchConfig::default());
    let pipeline = Pipeline::new(
        Arc::new(DownListing),
        fetcher,
        DocumentConverter::pdf(store, true),
        Arc::new(MemorySink::default()),
    );
    let job = Arc::new(ScheduledPipeline::new(Arc::new(pipeline), RunOptions::default()));
    let scheduler = Scheduler::new(job, Trigger::every_minutes(60), Sydney);

    let summary = scheduler.run_now().await.expect("run");
    assert!(summary.aborted);

    let app = disclosure_pipeline::router(scheduler, Some(&metrics));
    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(
        text.contains(r#"pipeline_runs_total{outcome="aborted"} 1"#),
        "missing aborted run counter:\n{text}"
    );
    assert!(text.contains("pipeline_run_duration_ms"), "missing run duration:\n{text}");
}
