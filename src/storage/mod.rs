//! Byte storage for raw documents and their derived text.
//!
//! Paths are relative, `/`-separated keys such as
//! `pdfs/2025/11/BHP_20251107_093000_1a2b3c4d.pdf`. Every backend maps the same
//! key space, so the fetcher and converter never know which one is in use.

pub mod local;
pub mod memory;
pub mod object;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::model::Disclosure;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use object::HttpObjectStore;

pub const DOCUMENT_ROOT: &str = "pdfs";
pub const TEXT_ROOT: &str = "markdown";

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    /// Returns whether something was removed.
    async fn delete(&self, path: &str) -> Result<bool, StorageError>;
    /// Keys starting with `prefix`, sorted. An empty prefix lists everything.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    /// Size in bytes, `None` when the key is absent.
    async fn size(&self, path: &str) -> Result<Option<u64>, StorageError>;
    /// Human-facing location (filesystem path or URL) for logs and records.
    fn locate(&self, path: &str) -> String;
    fn name(&self) -> &'static str;
}

/// Which backend the factory builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Memory,
    /// S3/R2-style HTTP object storage.
    Object,
}

impl StorageKind {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageKind::Local),
            "memory" => Ok(StorageKind::Memory),
            "s3" | "r2" | "object" => Ok(StorageKind::Object),
            other => Err(StorageError::Unsupported(other.to_string())),
        }
    }
}

pub fn build_store(cfg: &StorageConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    match StorageKind::parse(&cfg.storage_type)? {
        StorageKind::Local => Ok(Arc::new(LocalBlobStore::new(&cfg.local_path))),
        StorageKind::Memory => Ok(Arc::new(MemoryBlobStore::default())),
        StorageKind::Object => {
            let base = cfg.object_base_url.as_deref().unwrap_or("").trim();
            if base.is_empty() {
                return Err(StorageError::Unsupported(format!(
                    "{} storage requires object_base_url",
                    cfg.storage_type
                )));
            }
            Ok(Arc::new(HttpObjectStore::new(
                base,
                cfg.object_token.clone(),
                cfg.timeout_secs,
            )?))
        }
    }
}

/// Keep only ASCII alphanumerics of an issuer code.
pub fn sanitize_issuer(code: &str) -> String {
    code.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// `{root}/{YYYY}/{MM}/{ISSUER}_{YYYYMMDD_HHMMSS}_{hash8}.{ext}`, a pure function
/// of issuer code, announcement time and document URL.
pub fn blob_path(root: &str, disclosure: &Disclosure, ext: &str) -> String {
    let local = disclosure.announced_at.naive_local();
    format!(
        "{root}/{}/{}_{}_{}.{ext}",
        local.format("%Y/%m"),
        sanitize_issuer(&disclosure.issuer_code),
        local.format("%Y%m%d_%H%M%S"),
        disclosure.short_hash(),
    )
}

pub fn document_path(disclosure: &Disclosure) -> String {
    blob_path(DOCUMENT_ROOT, disclosure, "pdf")
}

/// Mirror a document path under the text root with a `.md` extension.
pub fn text_path_for(document_path: &str) -> String {
    let trimmed = document_path.trim_start_matches('/');
    let rest = trimmed
        .strip_prefix(DOCUMENT_ROOT)
        .and_then(|r| r.strip_prefix('/'))
        .map(|r| format!("{TEXT_ROOT}/{r}"))
        .unwrap_or_else(|| format!("{TEXT_ROOT}/{trimmed}"));
    match rest.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains('/') => format!("{stem}.md"),
        _ => format!("{rest}.md"),
    }
}

/// Reject absolute keys and parent traversal.
pub(crate) fn validate_key(path: &str) -> Result<&str, StorageError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(StorageError::InvalidPath {
            path: path.to_string(),
            reason: "empty key".into(),
        });
    }
    if trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(StorageError::InvalidPath {
            path: path.to_string(),
            reason: "key must be relative".into(),
        });
    }
    if trimmed.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return Err(StorageError::InvalidPath {
            path: path.to_string(),
            reason: "key contains an empty or parent segment".into(),
        });
    }
    Ok(trimmed)
}

/// Like [`validate_key`], but empty and `/`-terminated prefixes are fine.
pub(crate) fn validate_prefix(prefix: &str) -> Result<&str, StorageError> {
    let trimmed = prefix.trim();
    if trimmed.is_empty() {
        return Ok("");
    }
    let bare = trimmed.strip_suffix('/').unwrap_or(trimmed);
    validate_key(bare).map_err(|_| StorageError::InvalidPath {
        path: prefix.to_string(),
        reason: "prefix must be a relative key path".into(),
    })?;
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn disclosure(code: &str, url: &str) -> Disclosure {
        Disclosure {
            issuer_code: code.into(),
            issuer_name: code.into(),
            title: "Half Year Report".into(),
            announced_at: FixedOffset::east_opt(11 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 3, 4, 16, 5, 9)
                .unwrap(),
            document_url: url.into(),
            price_sensitive: false,
            page_count: None,
            file_size: None,
            timestamp_estimated: false,
        }
    }

    #[test]
    fn document_path_layout() {
        let d = disclosure("B.H-P", "https://www.asx.com.au/asxpdf/x.pdf");
        let p = document_path(&d);
        let expected = format!("pdfs/2025/03/BHP_20250304_160509_{}.pdf", d.short_hash());
        assert_eq!(p, expected);
        // pure function of inputs
        assert_eq!(p, document_path(&d.clone()));
    }

    #[test]
    fn text_path_mirrors_document_path() {
        assert_eq!(
            text_path_for("pdfs/2025/03/BHP_20250304_160509_abcd1234.pdf"),
            "markdown/2025/03/BHP_20250304_160509_abcd1234.md"
        );
        assert_eq!(text_path_for("other/a.pdf"), "markdown/other/a.md");
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("pdfs/2025/a.pdf").is_ok());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("pdfs/../../x").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn prefix_validation() {
        assert_eq!(validate_prefix("").unwrap(), "");
        assert_eq!(validate_prefix("pdfs/2025/").unwrap(), "pdfs/2025/");
        assert_eq!(validate_prefix("markdown/2025/11/BHP_").unwrap(), "markdown/2025/11/BHP_");
        assert!(validate_prefix("../pdfs").is_err());
        assert!(validate_prefix("/pdfs").is_err());
    }

    #[tokio::test]
    async fn memory_store_lists_and_sizes() {
        let store = MemoryBlobStore::default();
        store.put("pdfs/2025/11/b.pdf", b"12345").await.unwrap();
        store.put("pdfs/2025/10/a.pdf", b"1").await.unwrap();
        store.put("markdown/2025/11/b.md", b"text").await.unwrap();

        assert_eq!(
            store.list("pdfs/").await.unwrap(),
            vec!["pdfs/2025/10/a.pdf", "pdfs/2025/11/b.pdf"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
        assert!(store.list("pdfs/2024/").await.unwrap().is_empty());
        assert_eq!(store.size("pdfs/2025/11/b.pdf").await.unwrap(), Some(5));
        assert_eq!(store.size("pdfs/none.pdf").await.unwrap(), None);
    }

    #[test]
    fn storage_kind_aliases() {
        assert_eq!(StorageKind::parse("S3").unwrap(), StorageKind::Object);
        assert_eq!(StorageKind::parse("r2").unwrap(), StorageKind::Object);
        assert_eq!(StorageKind::parse("local").unwrap(), StorageKind::Local);
        assert!(StorageKind::parse("ftp").is_err());
    }
}
