// src/pipeline/mod.rs
//! Run orchestration: scan, fetch, convert, analyze, enrich, persist.
//!
//! Only a scan failure aborts a run. Every later stage catches its own error
//! and records it against the disclosure, so one bad document never takes the
//! rest of the batch down with it.

pub mod run;
pub mod sink;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use metrics::{counter, histogram};

use crate::analyze::{build_client_from_config, SentimentAnalyzer};
use crate::config::{PipelineConfig, RunConfig};
use crate::convert::DocumentConverter;
use crate::error::AnalysisError;
use crate::ingest::{ContentFetcher, ExchangeScanner, FetchOutcome, HttpDocumentSource, ListingSource};
use crate::market::{MarketEnricher, YahooChartProvider};
use crate::metrics::{ensure_metrics_described, PIPELINE_RUNS, RUN_DURATION_MS};
use crate::model::{Disclosure, ProcessedDisclosure};
use crate::storage::build_store;

pub use run::{PipelineRun, RunError, Stage};
pub use sink::{build_sink, JsonlSink, MemorySink, PersistenceSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub price_sensitive_only: bool,
    /// `None` or `Some(0)` processes everything.
    pub limit: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            price_sensitive_only: true,
            limit: None,
        }
    }
}

impl From<&RunConfig> for RunOptions {
    fn from(cfg: &RunConfig) -> Self {
        Self {
            price_sensitive_only: cfg.price_sensitive_only,
            limit: cfg.limit,
        }
    }
}

pub struct Pipeline {
    scanner: Arc<dyn ListingSource>,
    fetcher: ContentFetcher,
    converter: DocumentConverter,
    analyzer: Option<SentimentAnalyzer>,
    enricher: Option<MarketEnricher>,
    sink: Arc<dyn PersistenceSink>,
}

impl Pipeline {
    pub fn new(
        scanner: Arc<dyn ListingSource>,
        fetcher: ContentFetcher,
        converter: DocumentConverter,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            scanner,
            fetcher,
            converter,
            analyzer: None,
            enricher: None,
            sink,
        }
    }

    pub fn with_analyzer(mut self, analyzer: SentimentAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_enricher(mut self, enricher: MarketEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Wire the production components described by `cfg`.
    pub fn from_config(cfg: &PipelineConfig, sink: Arc<dyn PersistenceSink>) -> anyhow::Result<Self> {
        let store = build_store(&cfg.storage).context("building blob store")?;
        let scanner = ExchangeScanner::new(&cfg.exchange).context("building listing scanner")?;
        let source = HttpDocumentSource::new(&cfg.fetch, &cfg.exchange.user_agent)
            .context("building document client")?;
        let fetcher = ContentFetcher::new(store.clone(), Arc::new(source), &cfg.fetch);
        let converter =
            DocumentConverter::pdf(store, cfg.convert.page_markers).with_concurrency(cfg.convert.max_concurrent);

        let analyzer = SentimentAnalyzer::new(
            build_client_from_config(&cfg.analysis),
            cfg.analysis.max_input_chars,
        );
        let mut pipeline = Self::new(Arc::new(scanner), fetcher, converter, sink).with_analyzer(analyzer);

        if cfg.market.enabled {
            let provider = YahooChartProvider::new(&cfg.market, &cfg.exchange.user_agent)
                .context("building market data client")?;
            pipeline = pipeline.with_enricher(MarketEnricher::new(Arc::new(provider), &cfg.market));
        }
        Ok(pipeline)
    }

    pub async fn run(&self, opts: &RunOptions) -> PipelineRun {
        ensure_metrics_described();
        let started = Instant::now();
        let mut run = PipelineRun::start();
        tracing::info!(
            target: "pipeline",
            scanner = self.scanner.name(),
            price_sensitive_only = opts.price_sensitive_only,
            limit = ?opts.limit,
            "run started"
        );

        let mut report = match self.scanner.scan(opts.price_sensitive_only).await {
            Ok(report) => report,
            Err(e) => {
                run.record_error(Stage::Scan, None, e.to_string());
                run.aborted = true;
                return finish(run, started);
            }
        };
        if opts.price_sensitive_only {
            report.retain_price_sensitive();
        }
        for anomaly in std::mem::take(&mut report.anomalies) {
            run.record_anomaly(anomaly);
        }
        let mut disclosures = report.disclosures;
        if let Some(limit) = opts.limit.filter(|n| *n > 0) {
            disclosures.truncate(limit);
        }
        run.scraped = disclosures.len();
        tracing::info!(
            target: "pipeline",
            listed = report.total_count,
            price_sensitive = report.price_sensitive_count,
            selected = run.scraped,
            "disclosures selected"
        );

        self.process(&mut run, disclosures).await;
        finish(run, started)
    }

    /// Process one known disclosure without scanning.
    pub async fn run_single(&self, disclosure: Disclosure) -> PipelineRun {
        let started = Instant::now();
        let mut run = PipelineRun::start();
        run.scraped = 1;
        self.process(&mut run, vec![disclosure]).await;
        finish(run, started)
    }

    async fn process(&self, run: &mut PipelineRun, disclosures: Vec<Disclosure>) {
        let (fetched, stats) = self.fetcher.fetch_batch(&disclosures).await;
        run.pdfs_downloaded += stats.downloaded;
        run.pdfs_skipped += stats.skipped;

        let total = disclosures.len();
        for (i, (disclosure, outcome)) in disclosures.into_iter().zip(fetched).enumerate() {
            let code = disclosure.issuer_code.clone();
            tracing::info!(
                target: "pipeline",
                issuer = %code,
                n = i + 1,
                total,
                title = %disclosure.title,
                "processing disclosure"
            );

            let document_path = match outcome {
                Ok(outcome) => {
                    if let FetchOutcome::Skipped { path } = &outcome {
                        run.record_skip(format!("{code}: document already stored at {path}"));
                    }
                    outcome.path().to_string()
                }
                Err(e) => {
                    run.record_error(Stage::Fetch, Some(&code), e.to_string());
                    continue;
                }
            };

            let conversion = match self.converter.convert(&document_path).await {
                Ok(c) => c,
                Err(e) => {
                    run.record_error(Stage::Convert, Some(&code), e.to_string());
                    continue;
                }
            };
            run.documents_converted += 1;

            let analysis = match &self.analyzer {
                Some(analyzer) => match analyzer.analyze(&conversion.text, Some(&disclosure.title)).await {
                    Ok(result) => {
                        run.analyses_completed += 1;
                        Some(result)
                    }
                    Err(AnalysisError::Disabled) => {
                        run.record_skip(format!("{code}: analysis disabled"));
                        None
                    }
                    Err(e) => {
                        run.record_error(Stage::Analyze, Some(&code), e.to_string());
                        None
                    }
                },
                None => None,
            };

            let market = match &self.enricher {
                Some(enricher) => {
                    // an estimated timestamp would give a meaningless reaction
                    let announced = (!disclosure.timestamp_estimated).then_some(disclosure.announced_at);
                    let snapshot = enricher.fetch_snapshot(&code, announced).await;
                    if snapshot.data_available {
                        run.market_fetches_completed += 1;
                    } else {
                        run.record_skip(format!(
                            "{code}: market data unavailable ({})",
                            snapshot.error.as_deref().unwrap_or("no data")
                        ));
                    }
                    Some(snapshot)
                }
                None => None,
            };

            let record = ProcessedDisclosure {
                disclosure,
                document_path,
                text_path: conversion.text_path,
                metadata: conversion.metadata,
                text: conversion.text,
                analysis,
                market,
            };
            if let Err(e) = self.sink.persist(&record).await {
                run.record_error(Stage::Persist, Some(&code), e.to_string());
            }
            run.processed += 1;
            tracing::info!(target: "pipeline", issuer = %code, "disclosure processed");
        }
    }
}

fn finish(mut run: PipelineRun, started: Instant) -> PipelineRun {
    run.finalize();
    let outcome = if run.aborted { "aborted" } else { "completed" };
    counter!(PIPELINE_RUNS, "outcome" => outcome).increment(1);
    histogram!(RUN_DURATION_MS).record(started.elapsed().as_millis() as f64);
    tracing::info!(
        target: "pipeline",
        outcome,
        scraped = run.scraped,
        processed = run.processed,
        errors = run.errors.len(),
        success_rate = run.success_rate(),
        "run finished\n{run}"
    );
    run
}
