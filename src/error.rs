//! Error taxonomy for every pipeline stage.
//!
//! Only a [`ScanError`] aborts a run. Fetch and conversion errors are fatal for
//! the affected disclosure, analysis and enrichment errors are never fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid storage path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("storage io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage request failed for {path}: {message}")]
    Remote { path: String, message: String },

    #[error("unsupported storage backend: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("listing request failed: {0}")]
    Transport(String),

    #[error("listing request timed out after {0}s")]
    Timeout(u64),

    #[error("listing returned HTTP {0}")]
    Status(u16),

    #[error("scanner misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("not a valid document: {0}")]
    InvalidDocument(String),

    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("fetch worker failed: {0}")]
    Worker(String),
}

impl FetchError {
    /// Transient failures worth another attempt. Validation and storage
    /// failures will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("cannot open document {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("conversion worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis disabled")]
    Disabled,

    #[error("daily analysis limit of {0} reached")]
    DailyLimit(u32),

    #[error("llm request failed: {0}")]
    Request(String),

    #[error("llm returned HTTP {0}")]
    Status(u16),

    #[error("llm returned an empty reply")]
    EmptyReply,

    #[error("invalid analysis JSON: {0}")]
    InvalidReply(String),
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("market data request failed: {0}")]
    Request(String),

    #[error("market data returned HTTP {0}")]
    Status(u16),

    #[error("market data response malformed: {0}")]
    Malformed(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink rejected record: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid scheduler mode '{0}' (expected interval, cron or market_hours)")]
    InvalidMode(String),

    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("scheduler is already started")]
    AlreadyStarted,

    #[error("run task failed: {0}")]
    RunPanicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FetchError::Timeout(30).is_retryable());
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(FetchError::Status { status: 503, url: "u".into() }.is_retryable());
        assert!(FetchError::Status { status: 429, url: "u".into() }.is_retryable());
        assert!(!FetchError::Status { status: 404, url: "u".into() }.is_retryable());
        assert!(!FetchError::InvalidDocument("html".into()).is_retryable());
    }

    #[test]
    fn error_display_carries_context() {
        let e = FetchError::RetriesExhausted {
            attempts: 3,
            last: "timed out after 30s".into(),
        };
        assert_eq!(e.to_string(), "failed after 3 attempts: timed out after 30s");
    }
}
