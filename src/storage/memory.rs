use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{validate_key, validate_prefix, BlobStore};
use crate::error::StorageError;

/// In-process store, used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut k: Vec<String> = self.blobs.lock().keys().cloned().collect();
        k.sort();
        k
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let key = validate_key(path)?;
        Ok(self.blobs.lock().contains_key(key))
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let key = validate_key(path)?;
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let key = validate_key(path)?;
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let key = validate_key(path)?;
        Ok(self.blobs.lock().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = validate_prefix(prefix)?;
        let mut keys: Vec<String> = self
            .blobs
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn size(&self, path: &str) -> Result<Option<u64>, StorageError> {
        let key = validate_key(path)?;
        Ok(self.blobs.lock().get(key).map(|b| b.len() as u64))
    }

    fn locate(&self, path: &str) -> String {
        format!("memory://{path}")
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
