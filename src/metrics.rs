use axum::{routing::get, Router};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const PIPELINE_RUNS: &str = "pipeline_runs_total";
pub const DISCLOSURES_SCANNED: &str = "disclosures_scanned_total";
pub const DOCUMENTS_DOWNLOADED: &str = "documents_downloaded_total";
pub const DOCUMENTS_SKIPPED: &str = "documents_skipped_total";
pub const FETCH_FAILURES: &str = "fetch_failures_total";
pub const DOCUMENTS_CONVERTED: &str = "documents_converted_total";
pub const ANALYSES_COMPLETED: &str = "analyses_completed_total";
pub const ANALYSIS_FAILURES: &str = "analysis_failures_total";
pub const MARKET_SNAPSHOTS: &str = "market_snapshots_total";
pub const RUN_DURATION_MS: &str = "pipeline_run_duration_ms";
pub const SCHEDULER_OVERLAPS: &str = "scheduler_overlaps_total";

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(PIPELINE_RUNS, "Pipeline runs, labelled by outcome.");
        describe_counter!(DISCLOSURES_SCANNED, "Disclosures parsed from the listing page.");
        describe_counter!(DOCUMENTS_DOWNLOADED, "Documents downloaded and stored.");
        describe_counter!(DOCUMENTS_SKIPPED, "Downloads skipped because the blob already existed.");
        describe_counter!(FETCH_FAILURES, "Documents that failed to download.");
        describe_counter!(DOCUMENTS_CONVERTED, "Documents converted to text.");
        describe_counter!(ANALYSES_COMPLETED, "Successful LLM analyses.");
        describe_counter!(ANALYSIS_FAILURES, "Failed LLM analyses.");
        describe_counter!(MARKET_SNAPSHOTS, "Market snapshots fetched, labelled by availability.");
        describe_histogram!(RUN_DURATION_MS, "Pipeline run wall time in milliseconds.");
        describe_counter!(SCHEDULER_OVERLAPS, "Scheduled triggers skipped because a run was active.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe every pipeline series.
    pub fn init() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
