//! Where fully processed disclosures go.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::model::ProcessedDisclosure;

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist(&self, record: &ProcessedDisclosure) -> Result<(), SinkError>;
    fn name(&self) -> &'static str;
}

pub fn build_sink(cfg: &SinkConfig) -> Result<Arc<dyn PersistenceSink>, SinkError> {
    match cfg.kind.trim().to_ascii_lowercase().as_str() {
        "jsonl" => Ok(Arc::new(JsonlSink::new(&cfg.dir))),
        "memory" => Ok(Arc::new(MemorySink::default())),
        other => Err(SinkError::Rejected(format!("unknown sink kind '{other}'"))),
    }
}

/// Appends one JSON line per record to `{dir}/{YYYY-MM-DD}.jsonl`, keyed by
/// the announcement's exchange-local date.
pub struct JsonlSink {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn file_for(&self, record: &ProcessedDisclosure) -> PathBuf {
        let day = record.disclosure.announced_at.format("%Y-%m-%d");
        self.dir.join(format!("{day}.jsonl"))
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn persist(&self, record: &ProcessedDisclosure) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let path = self.file_for(record);

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        tracing::debug!(
            target: "pipeline",
            issuer = %record.disclosure.issuer_code,
            file = %path.display(),
            "record persisted"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

/// Keeps records in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ProcessedDisclosure>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<ProcessedDisclosure> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist(&self, record: &ProcessedDisclosure) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Disclosure, DocumentMetadata};
    use chrono::{FixedOffset, TimeZone};

    fn record(code: &str, day: u32) -> ProcessedDisclosure {
        let tz = FixedOffset::east_opt(11 * 3600).unwrap();
        ProcessedDisclosure {
            disclosure: Disclosure {
                issuer_code: code.into(),
                issuer_name: String::new(),
                title: "Half Year Report".into(),
                announced_at: tz.with_ymd_and_hms(2025, 11, day, 8, 30, 0).unwrap(),
                document_url: format!("https://example.test/{code}.pdf"),
                price_sensitive: true,
                page_count: Some(3),
                file_size: None,
                timestamp_estimated: false,
            },
            document_path: format!("pdfs/2025/11/{code}.pdf"),
            text_path: format!("markdown/2025/11/{code}.md"),
            metadata: DocumentMetadata::default(),
            text: "body".into(),
            analysis: None,
            market: None,
        }
    }

    #[tokio::test]
    async fn jsonl_appends_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path());
        sink.persist(&record("BHP", 10)).await.unwrap();
        sink.persist(&record("RIO", 10)).await.unwrap();
        sink.persist(&record("CBA", 11)).await.unwrap();

        let day10 = std::fs::read_to_string(dir.path().join("2025-11-10.jsonl")).unwrap();
        let lines: Vec<&str> = day10.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["disclosure"]["issuer_code"], "BHP");
        assert!(dir.path().join("2025-11-11.jsonl").exists());
    }

    #[tokio::test]
    async fn memory_sink_and_factory() {
        let sink = MemorySink::default();
        assert!(sink.is_empty());
        sink.persist(&record("BHP", 10)).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].disclosure.issuer_code, "BHP");

        let cfg = SinkConfig {
            kind: "Memory".into(),
            dir: String::new(),
        };
        assert_eq!(build_sink(&cfg).unwrap().name(), "memory");
        let bad = SinkConfig {
            kind: "postgres".into(),
            dir: String::new(),
        };
        assert!(matches!(build_sink(&bad), Err(SinkError::Rejected(_))));
    }
}
