//! Per-run statistics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::ScanAnomaly;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Fetch,
    Convert,
    Analyze,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Fetch => "fetch",
            Stage::Convert => "convert",
            Stage::Analyze => "analyze",
            Stage::Persist => "persist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub stage: Stage,
    pub issuer_code: Option<String>,
    pub message: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issuer_code {
            Some(code) => write!(f, "{} failed for {code}: {}", self.stage.as_str(), self.message),
            None => write!(f, "{} failed: {}", self.stage.as_str(), self.message),
        }
    }
}

/// Statistics for one pipeline run. Counters only ever go up.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scraped: usize,
    pub processed: usize,
    pub pdfs_downloaded: usize,
    pub pdfs_skipped: usize,
    pub documents_converted: usize,
    pub analyses_completed: usize,
    pub market_fetches_completed: usize,
    pub errors: Vec<RunError>,
    pub skipped: Vec<String>,
    /// Listing rows accepted with a guessed value.
    pub anomalies: Vec<ScanAnomaly>,
    /// The run stopped before processing disclosures (scan failure).
    pub aborted: bool,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::start()
    }
}

impl PipelineRun {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            scraped: 0,
            processed: 0,
            pdfs_downloaded: 0,
            pdfs_skipped: 0,
            documents_converted: 0,
            analyses_completed: 0,
            market_fetches_completed: 0,
            errors: Vec::new(),
            skipped: Vec::new(),
            anomalies: Vec::new(),
            aborted: false,
        }
    }

    pub fn record_error(&mut self, stage: Stage, issuer_code: Option<&str>, message: impl Into<String>) {
        let err = RunError {
            stage,
            issuer_code: issuer_code.map(str::to_string),
            message: message.into(),
        };
        tracing::error!(target: "pipeline", stage = stage.as_str(), "{err}");
        self.errors.push(err);
    }

    pub fn record_skip(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(target: "pipeline", "skipped: {reason}");
        self.skipped.push(reason);
    }

    pub fn record_anomaly(&mut self, anomaly: ScanAnomaly) {
        tracing::warn!(
            target: "pipeline",
            issuer = %anomaly.issuer_code,
            raw = %anomaly.raw_value,
            "scan anomaly: {}",
            anomaly.reason
        );
        self.anomalies.push(anomaly);
    }

    /// Stamp the end time; later calls keep the first stamp.
    pub fn finalize(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Elapsed time so far, or total once finalized.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }

    /// `processed / scraped * 100`, 0 when nothing was scraped.
    pub fn success_rate(&self) -> f64 {
        if self.scraped == 0 {
            return 0.0;
        }
        self.processed as f64 / self.scraped as f64 * 100.0
    }

    /// Completed without aborting. Per-disclosure errors do not count against it.
    pub fn succeeded(&self) -> bool {
        !self.aborted
    }
}

impl fmt::Display for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.duration().num_milliseconds() as f64 / 1000.0;
        writeln!(f, "Pipeline run")?;
        writeln!(f, "  duration:            {secs:.2}s")?;
        writeln!(f, "  scraped:             {}", self.scraped)?;
        writeln!(f, "  processed:           {}", self.processed)?;
        writeln!(f, "  pdfs downloaded:     {}", self.pdfs_downloaded)?;
        writeln!(f, "  pdfs skipped:        {}", self.pdfs_skipped)?;
        writeln!(f, "  documents converted: {}", self.documents_converted)?;
        writeln!(f, "  analyses completed:  {}", self.analyses_completed)?;
        writeln!(f, "  market fetches:      {}", self.market_fetches_completed)?;
        writeln!(f, "  success rate:        {:.1}%", self.success_rate())?;
        writeln!(f, "  errors:              {}", self.errors.len())?;
        writeln!(f, "  skipped:             {}", self.skipped.len())?;
        write!(f, "  anomalies:           {}", self.anomalies.len())?;
        if self.aborted {
            write!(f, "\n  aborted")?;
        }
        Ok(())
    }
}
