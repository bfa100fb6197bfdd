//! Stored document to normalized markdown-ish text.

pub mod pdf;

use std::path::Path;
use std::sync::Arc;

use metrics::counter;
use once_cell::sync::OnceCell;
use tokio::sync::Semaphore;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, StorageError};
use crate::metrics::DOCUMENTS_CONVERTED;
use crate::model::DocumentMetadata;
use crate::storage::{text_path_for, BlobStore};

pub use pdf::PdfTextExtractor;

/// Raw per-page text plus metadata, before normalization.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub pages: Vec<String>,
    pub metadata: DocumentMetadata,
}

/// Synchronous extraction; the converter runs it on the blocking pool.
pub trait TextExtractor: Send + Sync + 'static {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub text_path: String,
    pub text: String,
    pub metadata: DocumentMetadata,
    /// The derived text already existed and was loaded instead of rebuilt.
    pub skipped: bool,
}

#[derive(Clone)]
pub struct DocumentConverter {
    store: Arc<dyn BlobStore>,
    extractor: Arc<dyn TextExtractor>,
    page_markers: bool,
    max_concurrent: usize,
}

/// Metadata sidecar stored next to the derived text.
fn metadata_path_for(text_path: &str) -> String {
    match text_path.strip_suffix(".md") {
        Some(stem) => format!("{stem}.meta.json"),
        None => format!("{text_path}.meta.json"),
    }
}

impl DocumentConverter {
    pub fn new(store: Arc<dyn BlobStore>, extractor: Arc<dyn TextExtractor>, page_markers: bool) -> Self {
        Self {
            store,
            extractor,
            page_markers,
            max_concurrent: 2,
        }
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn pdf(store: Arc<dyn BlobStore>, page_markers: bool) -> Self {
        Self::new(store, Arc::new(PdfTextExtractor), page_markers)
    }

    pub async fn convert(&self, storage_path: &str) -> Result<Conversion, ConversionError> {
        let text_path = text_path_for(storage_path);

        if self.store.exists(&text_path).await? {
            let text = String::from_utf8_lossy(&self.store.get(&text_path).await?).into_owned();
            let metadata = self.load_metadata(&text_path).await;
            tracing::debug!(target: "converter", path = %text_path, "derived text already present");
            return Ok(Conversion {
                text_path,
                text,
                metadata,
                skipped: true,
            });
        }

        let bytes = self.load_document(storage_path).await?;
        let extractor = self.extractor.clone();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&bytes))
            .await
            .map_err(|e| ConversionError::Worker(e.to_string()))?
            .map_err(|reason| ConversionError::Unreadable {
                path: storage_path.to_string(),
                reason,
            })?;

        let text = format_document(&extracted, self.page_markers);
        self.store.put(&text_path, text.as_bytes()).await?;
        match serde_json::to_vec(&extracted.metadata) {
            Ok(json) => {
                if let Err(e) = self.store.put(&metadata_path_for(&text_path), &json).await {
                    tracing::warn!(target: "converter", path = %text_path, "metadata sidecar not stored: {e}");
                }
            }
            Err(e) => tracing::warn!(target: "converter", "metadata not serializable: {e}"),
        }

        counter!(DOCUMENTS_CONVERTED).increment(1);
        tracing::info!(
            target: "converter",
            path = %text_path,
            pages = extracted.metadata.num_pages,
            chars = text.chars().count(),
            "document converted"
        );
        Ok(Conversion {
            text_path,
            text,
            metadata: extracted.metadata,
            skipped: false,
        })
    }

    /// Convert several stored documents, at most `max_concurrent` at once.
    /// Results come back in input order; one failure does not stop the rest.
    pub async fn convert_batch(&self, storage_paths: &[String]) -> Vec<Result<Conversion, ConversionError>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let handles: Vec<_> = storage_paths
            .iter()
            .cloned()
            .map(|path| {
                let converter = self.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| ConversionError::Worker(e.to_string()))?;
                    converter.convert(&path).await
                })
            })
            .collect();

        let mut out = Vec::with_capacity(storage_paths.len());
        for handle in handles {
            out.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(ConversionError::Worker(e.to_string())),
            });
        }
        let failed = out.iter().filter(|r| r.is_err()).count();
        tracing::info!(
            target: "converter",
            requested = storage_paths.len(),
            converted = out.len() - failed,
            failed,
            "batch converted"
        );
        out
    }

    /// Blob store first; absolute paths fall back to the local filesystem.
    async fn load_document(&self, storage_path: &str) -> Result<Vec<u8>, ConversionError> {
        if Path::new(storage_path).is_absolute() {
            return tokio::fs::read(storage_path).await.map_err(|e| {
                ConversionError::Storage(StorageError::Io {
                    path: storage_path.to_string(),
                    source: e,
                })
            });
        }
        Ok(self.store.get(storage_path).await?)
    }

    async fn load_metadata(&self, text_path: &str) -> DocumentMetadata {
        match self.store.get(&metadata_path_for(text_path)).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => DocumentMetadata::default(),
        }
    }
}

/// Right-trim lines and drop empty ones.
pub fn clean_page(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Title header, optional page markers, cleaned page text; no runs of more
/// than one blank line and exactly one trailing newline.
pub fn format_document(doc: &ExtractedDocument, page_markers: bool) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(doc.pages.len() * 2 + 1);
    if !doc.metadata.title.is_empty() {
        parts.push(format!("# {}\n", doc.metadata.title));
    }
    for (idx, page) in doc.pages.iter().enumerate() {
        if page_markers {
            parts.push(format!("\n---\n**Page {}**\n---\n", idx + 1));
        }
        let cleaned = clean_page(page);
        if !cleaned.trim().is_empty() {
            parts.push(cleaned);
        }
    }

    static RE_BLANKS: OnceCell<Regex> = OnceCell::new();
    let re = RE_BLANKS.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    let joined = parts.join("\n\n");
    let collapsed = re.replace_all(&joined, "\n\n");
    let mut out = collapsed.trim_start_matches('\n').trim_end().to_string();
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeExtractor {
        calls: Arc<AtomicUsize>,
    }

    impl TextExtractor for FakeExtractor {
        fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !bytes.starts_with(b"%PDF") {
                return Err("missing header".into());
            }
            Ok(ExtractedDocument {
                pages: vec!["Line one   \n\n\nLine two".into(), "   \n".into(), "Last".into()],
                metadata: DocumentMetadata {
                    num_pages: 3,
                    file_size: bytes.len(),
                    title: "Results".into(),
                    ..Default::default()
                },
            })
        }
    }

    #[test]
    fn format_with_markers() {
        let doc = ExtractedDocument {
            pages: vec!["Alpha  \n\n  \nBeta".into(), "Gamma".into()],
            metadata: DocumentMetadata {
                title: "Report".into(),
                ..Default::default()
            },
        };
        let out = format_document(&doc, true);
        assert_eq!(
            out,
            "# Report\n\n---\n**Page 1**\n---\n\nAlpha\nBeta\n\n---\n**Page 2**\n---\n\nGamma\n"
        );
        assert!(!out.contains("\n\n\n"));
    }

    #[test]
    fn format_without_markers_or_title() {
        let doc = ExtractedDocument {
            pages: vec!["a".into(), "".into(), "b  ".into()],
            metadata: DocumentMetadata::default(),
        };
        assert_eq!(format_document(&doc, false), "a\n\nb\n");
    }

    #[tokio::test]
    async fn existing_text_is_loaded_not_rebuilt() {
        let store = MemoryBlobStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let conv = DocumentConverter::new(
            Arc::new(store.clone()),
            Arc::new(FakeExtractor { calls: calls.clone() }),
            false,
        );
        let path = "pdfs/2025/11/BHP_20251107_100000_abcdef12.pdf";
        store.put(path, b"%PDF-1.4").await.unwrap();

        let first = conv.convert(path).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.text_path, "markdown/2025/11/BHP_20251107_100000_abcdef12.md");
        assert_eq!(first.text, "# Results\n\nLine one\nLine two\n\nLast\n");
        assert_eq!(first.metadata.num_pages, 3);

        let second = conv.convert(path).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.text, first.text);
        assert_eq!(second.metadata, first.metadata);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Sleeps on the blocking pool and records peak overlap.
    #[derive(Default)]
    struct SlowExtractor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TextExtractor for SlowExtractor {
        fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if bytes.is_empty() {
                return Err("empty file".into());
            }
            Ok(ExtractedDocument {
                pages: vec![String::from_utf8_lossy(bytes).into_owned()],
                metadata: DocumentMetadata {
                    num_pages: 1,
                    file_size: bytes.len(),
                    ..Default::default()
                },
            })
        }
    }

    #[tokio::test]
    async fn batch_keeps_order_and_bounds_extraction() {
        let store = MemoryBlobStore::default();
        let extractor = Arc::new(SlowExtractor::default());
        let conv = DocumentConverter::new(Arc::new(store.clone()), extractor.clone(), false).with_concurrency(2);

        let mut paths = Vec::new();
        for (i, body) in ["alpha", "", "gamma", "delta", "epsilon"].iter().enumerate() {
            let path = format!("pdfs/2025/11/DOC{i}_20251110_090000_0000000{i}.pdf");
            store.put(&path, body.as_bytes()).await.unwrap();
            paths.push(path);
        }
        paths.push("pdfs/2025/11/gone.pdf".to_string());

        let results = conv.convert_batch(&paths).await;
        assert_eq!(results.len(), 6);
        assert_eq!(results[0].as_ref().unwrap().text, "alpha\n");
        assert!(matches!(results[1], Err(ConversionError::Unreadable { .. })));
        assert_eq!(results[4].as_ref().unwrap().text, "epsilon\n");
        assert!(matches!(results[5], Err(ConversionError::Storage(StorageError::NotFound(_)))));
        assert!(extractor.peak.load(Ordering::SeqCst) <= 2);
        assert!(store.exists("markdown/2025/11/DOC3_20251110_090000_00000003.md").await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_document_is_an_error() {
        let store = MemoryBlobStore::default();
        let conv = DocumentConverter::new(
            Arc::new(store.clone()),
            Arc::new(FakeExtractor {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            true,
        );
        store.put("pdfs/x.pdf", b"garbage").await.unwrap();
        let err = conv.convert("pdfs/x.pdf").await.unwrap_err();
        assert!(matches!(err, ConversionError::Unreadable { .. }));
        assert!(!store.exists("markdown/x.md").await.unwrap());

        let missing = conv.convert("pdfs/none.pdf").await.unwrap_err();
        assert!(matches!(missing, ConversionError::Storage(StorageError::NotFound(_))));
    }
}
