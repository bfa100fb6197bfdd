//! Disclosure pipeline service: loads config, wires the pipeline, starts the
//! scheduler and serves the status surface.

use std::sync::Arc;

use anyhow::Context;
use disclosure_pipeline::{
    logging::init_tracing,
    metrics::Metrics,
    pipeline::{build_sink, Pipeline, RunOptions},
    router,
    scheduler::{ScheduledPipeline, Scheduler},
    PipelineConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    init_tracing(&cfg.logging);

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!("prometheus recorder not installed: {e}");
            None
        }
    };

    let sink = build_sink(&cfg.sink).context("building persistence sink")?;
    let pipeline = Arc::new(Pipeline::from_config(&cfg, sink)?);
    let job = Arc::new(ScheduledPipeline::new(pipeline, RunOptions::from(&cfg.run)));
    let scheduler = Scheduler::from_config(job, &cfg.scheduler).context("configuring scheduler")?;
    scheduler.start().context("starting scheduler")?;

    let app = router(scheduler.clone(), metrics.as_ref());
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    tracing::info!(bind = %cfg.server.bind, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving status surface")?;

    scheduler.stop();
    Ok(())
}
