//! Single pipeline run from the configured sources; prints the run summary.
//!
//! `RUN_LIMIT=N` caps the number of disclosures, `RUN_ALL_DISCLOSURES=1`
//! disables the price-sensitive filter.

use anyhow::Context;
use disclosure_pipeline::{
    logging::init_tracing,
    pipeline::{build_sink, Pipeline, RunOptions},
    PipelineConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    init_tracing(&cfg.logging);

    let mut opts = RunOptions::from(&cfg.run);
    if let Ok(raw) = std::env::var("RUN_LIMIT") {
        let limit: usize = raw
            .trim()
            .parse()
            .with_context(|| format!("RUN_LIMIT must be a number, got '{raw}'"))?;
        opts.limit = Some(limit);
    }
    if std::env::var("RUN_ALL_DISCLOSURES").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
        opts.price_sensitive_only = false;
    }

    let sink = build_sink(&cfg.sink).context("building persistence sink")?;
    let pipeline = Pipeline::from_config(&cfg, sink)?;
    let run = pipeline.run(&opts).await;

    println!("{run}");
    for e in &run.errors {
        println!("  - {e}");
    }
    if run.aborted {
        anyhow::bail!("run aborted");
    }
    Ok(())
}
