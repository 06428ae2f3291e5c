//! In-memory object store.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::{ObjectMeta, ObjectStore};
use crate::error::{StorageError, StorageResult};

/// Stored object with metadata.
#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    modified: DateTime<Utc>,
}

/// Object store kept in process memory.
///
/// Suitable for tests and single-process hosts. Every trait call is counted
/// so tests can assert that a code path issued no requests at all.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    requests: AtomicU64,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of object store calls served so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Insert an object with an explicit modification time.
    ///
    /// Does not count as a request.
    pub fn insert_with_modified(
        &self,
        key: impl Into<String>,
        body: impl Into<Bytes>,
        modified: DateTime<Utc>,
    ) {
        self.objects.insert(
            key.into(),
            StoredObject {
                body: body.into(),
                modified,
            },
        );
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.count();
        trace!(key = %key, "memory get");
        self.objects
            .get(key)
            .map(|entry| entry.body.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        self.count();
        trace!(key = %key, size = body.len(), "memory put");
        self.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.count();
        trace!(key = %key, "memory delete");
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        self.count();
        let mut objects: Vec<ObjectMeta> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectMeta {
                key: entry.key().clone(),
                size: entry.value().body.len() as u64,
                modified: entry.value().modified,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.count();
        self.objects
            .get(key)
            .map(|entry| ObjectMeta {
                key: key.to_string(),
                size: entry.body.len() as u64,
                modified: entry.modified,
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
