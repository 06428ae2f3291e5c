//! Object store backends.
//!
//! The lock manager and the storage facade only need a handful of blob
//! operations. [`ObjectStore`] captures them; absent objects must surface as
//! [`StorageError::NotFound`](crate::StorageError::NotFound) from `get` and
//! `stat` so callers can tell them apart from real failures.

mod memory;
mod s3;
mod sigv4;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object key, prefix included.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Key-addressed blob storage without locking or compare-and-swap.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Create or replace an object.
    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()>;

    /// Remove an object. Removing an absent object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>>;

    /// Metadata of one object.
    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta>;
}
