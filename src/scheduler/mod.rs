// src/scheduler/mod.rs
//! Triggers pipeline runs on an interval, a cron expression or the market-hours
//! preset, with at most one run active at a time.

pub mod cron;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::SchedulingError;
use crate::metrics::SCHEDULER_OVERLAPS;
use crate::pipeline::{Pipeline, PipelineRun, RunOptions};

pub use cron::{parse_timezone, CronSchedule, MARKET_HOURS};

/// Outcome of one run, as kept in the scheduler status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scraped: usize,
    pub processed: usize,
    pub errors: usize,
    pub aborted: bool,
    pub success_rate: f64,
}

impl RunSummary {
    /// A run counts as successful only when it recorded no errors at all.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.errors == 0
    }

    /// Stand-in for a run whose task panicked before reporting.
    fn panicked(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: Some(Utc::now()),
            scraped: 0,
            processed: 0,
            errors: 1,
            aborted: true,
            success_rate: 0.0,
        }
    }
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            started_at: run.started_at,
            finished_at: run.finished_at,
            scraped: run.scraped,
            processed: run.processed,
            errors: run.errors.len(),
            aborted: run.aborted,
            success_rate: run.success_rate(),
        }
    }
}

#[async_trait]
pub trait PipelineJob: Send + Sync + 'static {
    async fn execute(&self) -> RunSummary;
}

/// A pipeline plus the options every scheduled run uses.
pub struct ScheduledPipeline {
    pipeline: Arc<Pipeline>,
    options: RunOptions,
}

impl ScheduledPipeline {
    pub fn new(pipeline: Arc<Pipeline>, options: RunOptions) -> Self {
        Self { pipeline, options }
    }
}

#[async_trait]
impl PipelineJob for ScheduledPipeline {
    async fn execute(&self) -> RunSummary {
        let run = self.pipeline.run(&self.options).await;
        RunSummary::from(&run)
    }
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron(CronSchedule),
    MarketHours(CronSchedule),
}

impl Trigger {
    pub fn every_minutes(minutes: u64) -> Self {
        Trigger::Interval(Duration::from_secs(minutes.max(1) * 60))
    }

    pub fn cron(expr: &str) -> Result<Self, SchedulingError> {
        Ok(Trigger::Cron(CronSchedule::parse(expr)?))
    }

    pub fn market_hours() -> Self {
        Trigger::MarketHours(CronSchedule::market_hours())
    }

    pub fn from_config(cfg: &SchedulerConfig) -> Result<Self, SchedulingError> {
        match cfg.mode.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(Self::every_minutes(cfg.interval_minutes)),
            "cron" => match cfg.cron.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                Some(expr) => Self::cron(expr),
                None => {
                    tracing::warn!(target: "scheduler", "cron mode without an expression, using market hours");
                    Ok(Self::market_hours())
                }
            },
            "market_hours" | "market-hours" => Ok(Self::market_hours()),
            other => Err(SchedulingError::InvalidMode(other.to_string())),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "interval",
            Trigger::Cron(_) => "cron",
            Trigger::MarketHours(_) => "market_hours",
        }
    }

    pub fn job_id(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "scan_interval",
            Trigger::Cron(_) => "scan_cron",
            Trigger::MarketHours(_) => "scan_market_hours",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval(every) if every.as_secs() % 60 == 0 => {
                format!("Scan disclosures every {} minutes", every.as_secs() / 60)
            }
            Trigger::Interval(every) => format!("Scan disclosures every {every:?}"),
            Trigger::Cron(c) => format!("Scan disclosures (cron: {c})"),
            Trigger::MarketHours(_) => "Scan disclosures hourly during market hours".to_string(),
        }
    }

    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(every) => chrono::Duration::from_std(*every).ok().map(|d| after + d),
            Trigger::Cron(c) | Trigger::MarketHours(c) => c.next_after(after, tz),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDescriptor {
    pub id: String,
    pub name: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// The trigger loop is started.
    pub is_running: bool,
    /// A pipeline run is in progress right now.
    pub run_active: bool,
    pub mode: String,
    pub timezone: String,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_success: bool,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub skipped_overlaps: u64,
    pub success_rate: f64,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
    /// Panic message of the last run, cleared by the next completed run.
    pub last_error: Option<String>,
    pub scheduled_jobs: Vec<JobDescriptor>,
}

#[derive(Default)]
struct Counters {
    total_runs: u64,
    successful_runs: u64,
    skipped_overlaps: u64,
    last_run_time: Option<DateTime<Utc>>,
    last_run_success: bool,
    last_run: Option<RunSummary>,
    last_error: Option<String>,
    next_fire: Option<DateTime<Utc>>,
}

struct Inner {
    job: Arc<dyn PipelineJob>,
    trigger: Trigger,
    tz: Tz,
    run_on_start: bool,
    active: Arc<AtomicBool>,
    counters: Mutex<Counters>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the active flag when the run ends, including by panic.
struct ActiveRun(Arc<AtomicBool>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn PipelineJob>, trigger: Trigger, tz: Tz) -> Self {
        Self::build(job, trigger, tz, false)
    }

    fn build(job: Arc<dyn PipelineJob>, trigger: Trigger, tz: Tz, run_on_start: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                job,
                trigger,
                tz,
                run_on_start,
                active: Arc::new(AtomicBool::new(false)),
                counters: Mutex::new(Counters::default()),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(job: Arc<dyn PipelineJob>, cfg: &SchedulerConfig) -> Result<Self, SchedulingError> {
        let tz = parse_timezone(&cfg.timezone)?;
        let trigger = Trigger::from_config(cfg)?;
        Ok(Self::build(job, trigger, tz, cfg.run_on_start))
    }

    pub fn trigger(&self) -> &Trigger {
        &self.inner.trigger
    }

    pub fn is_started(&self) -> bool {
        self.inner.loop_handle.lock().is_some()
    }

    pub fn is_run_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Spawn the trigger loop.
    pub fn start(&self) -> Result<(), SchedulingError> {
        let mut handle = self.inner.loop_handle.lock();
        if handle.is_some() {
            return Err(SchedulingError::AlreadyStarted);
        }
        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(trigger_loop(inner)));
        tracing::info!(
            target: "scheduler",
            mode = self.inner.trigger.mode(),
            job = %self.inner.trigger.describe(),
            tz = %self.inner.tz,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop firing. A run already in progress finishes on its own task.
    pub fn stop(&self) {
        match self.inner.loop_handle.lock().take() {
            Some(handle) => {
                handle.abort();
                self.inner.counters.lock().next_fire = None;
                tracing::info!(target: "scheduler", "scheduler stopped");
            }
            None => tracing::warn!(target: "scheduler", "scheduler is not running"),
        }
    }

    /// Run now and wait for the outcome.
    pub async fn run_now(&self) -> Result<RunSummary, SchedulingError> {
        let guard = begin(&self.inner).ok_or(SchedulingError::AlreadyRunning)?;
        execute(self.inner.clone(), guard, "manual").await
    }

    /// Start a run in the background; fails if one is already active.
    pub fn trigger_now(&self) -> Result<(), SchedulingError> {
        let guard = begin(&self.inner).ok_or(SchedulingError::AlreadyRunning)?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = execute(inner, guard, "manual").await;
        });
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let started = self.is_started();
        let c = self.inner.counters.lock();
        let next_run_time = if started { c.next_fire } else { None };
        let scheduled_jobs = if started {
            vec![JobDescriptor {
                id: self.inner.trigger.job_id().to_string(),
                name: self.inner.trigger.describe(),
                next_run: next_run_time,
            }]
        } else {
            Vec::new()
        };
        SchedulerStatus {
            is_running: started,
            run_active: self.is_run_active(),
            mode: self.inner.trigger.mode().to_string(),
            timezone: self.inner.tz.to_string(),
            last_run_time: c.last_run_time,
            last_run_success: c.last_run_success,
            total_runs: c.total_runs,
            successful_runs: c.successful_runs,
            skipped_overlaps: c.skipped_overlaps,
            success_rate: if c.total_runs == 0 {
                0.0
            } else {
                c.successful_runs as f64 / c.total_runs as f64 * 100.0
            },
            next_run_time,
            last_run: c.last_run.clone(),
            last_error: c.last_error.clone(),
            scheduled_jobs,
        }
    }
}

/// Claim the single run slot, or count the overlap.
fn begin(inner: &Inner) -> Option<ActiveRun> {
    if inner
        .active
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        return Some(ActiveRun(inner.active.clone()));
    }
    inner.counters.lock().skipped_overlaps += 1;
    counter!(SCHEDULER_OVERLAPS).increment(1);
    tracing::warn!(target: "scheduler", "run already in progress, trigger skipped");
    None
}

async fn execute(inner: Arc<Inner>, guard: ActiveRun, reason: &'static str) -> Result<RunSummary, SchedulingError> {
    let started_at = Utc::now();
    let run_no = {
        let mut c = inner.counters.lock();
        c.total_runs += 1;
        c.last_run_time = Some(started_at);
        c.total_runs
    };
    tracing::info!(target: "scheduler", run = run_no, reason, "run triggered");

    // own task so a panic inside the pipeline is contained
    let job = inner.job.clone();
    let joined = tokio::spawn(async move { job.execute().await }).await;
    drop(guard);

    let mut c = inner.counters.lock();
    match joined {
        Ok(summary) => {
            let ok = summary.is_success();
            c.last_run_success = ok;
            if ok {
                c.successful_runs += 1;
                tracing::info!(target: "scheduler", run = run_no, processed = summary.processed, scraped = summary.scraped, "run succeeded");
            } else {
                tracing::warn!(target: "scheduler", run = run_no, errors = summary.errors, aborted = summary.aborted, "run finished with errors");
            }
            c.last_run = Some(summary.clone());
            c.last_error = None;
            Ok(summary)
        }
        Err(e) => {
            let message = panic_message(e);
            c.last_run_success = false;
            c.last_run = Some(RunSummary::panicked(started_at));
            c.last_error = Some(message.clone());
            tracing::error!(target: "scheduler", run = run_no, "run task failed: {message}");
            Err(SchedulingError::RunPanicked(message))
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("run panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("run panicked: {s}")
    } else {
        "run panicked".to_string()
    }
}

async fn trigger_loop(inner: Arc<Inner>) {
    if inner.run_on_start {
        fire(&inner);
    }
    loop {
        let now = Utc::now();
        let Some(next) = inner.trigger.next_after(now, inner.tz) else {
            tracing::warn!(target: "scheduler", "trigger has no future fire time");
            inner.counters.lock().next_fire = None;
            return;
        };
        inner.counters.lock().next_fire = Some(next);
        tracing::debug!(target: "scheduler", next = %next, "next run scheduled");
        tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;
        fire(&inner);
    }
}

fn fire(inner: &Arc<Inner>) {
    if let Some(guard) = begin(inner) {
        let inner = inner.clone();
        tokio::spawn(async move {
            let _ = execute(inner, guard, "scheduled").await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_from_config() {
        let mut cfg = SchedulerConfig::default();
        assert!(matches!(Trigger::from_config(&cfg).unwrap(), Trigger::Interval(d) if d == Duration::from_secs(3600)));

        cfg.mode = "cron".into();
        cfg.cron = Some("*/30 * * * *".into());
        assert_eq!(Trigger::from_config(&cfg).unwrap().mode(), "cron");

        cfg.cron = None;
        assert_eq!(Trigger::from_config(&cfg).unwrap().mode(), "market_hours");

        cfg.mode = "Market_Hours".into();
        assert_eq!(Trigger::from_config(&cfg).unwrap().job_id(), "scan_market_hours");

        cfg.mode = "hourly".into();
        assert!(matches!(Trigger::from_config(&cfg), Err(SchedulingError::InvalidMode(_))));

        cfg.mode = "cron".into();
        cfg.cron = Some("not a cron".into());
        assert!(matches!(Trigger::from_config(&cfg), Err(SchedulingError::InvalidCron { .. })));
    }

    #[test]
    fn interval_next_fire_and_description() {
        let t = Trigger::every_minutes(15);
        let now = Utc::now();
        assert_eq!(t.next_after(now, chrono_tz::UTC), Some(now + chrono::Duration::minutes(15)));
        assert_eq!(t.describe(), "Scan disclosures every 15 minutes");
    }

    #[test]
    fn run_summary_success_requires_no_errors() {
        let mut run = PipelineRun::start();
        run.scraped = 2;
        run.processed = 2;
        assert!(RunSummary::from(&run).is_success());
        run.record_error(crate::pipeline::Stage::Analyze, Some("BHP"), "timeout");
        let s = RunSummary::from(&run);
        assert!(!s.is_success());
        assert_eq!(s.success_rate, 100.0);
    }
}
