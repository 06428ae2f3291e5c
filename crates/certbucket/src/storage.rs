//! Host-facing certificate storage.
//!
//! [`ObjectStorage`] implements [`CertificateStorage`] on top of any
//! [`ObjectStore`]: payloads go through the configured [`PayloadCipher`],
//! locks go through the [`LockManager`], and everything else is a prefixed
//! pass-through.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LockConfig, StorageConfig};
use crate::crypto::PayloadCipher;
use crate::error::{StorageError, StorageResult};
use crate::lock::LockManager;
use crate::naming::KeyNamer;
use crate::object::{ObjectStore, S3ObjectStore};

/// How long construction waits for the bucket check.
const BUCKET_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata about a stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Logical key, without the storage prefix.
    pub key: String,
    /// Size of the stored object in bytes (ciphertext size when encrypted).
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Whether the key is a leaf. Always true for stored objects.
    pub is_terminal: bool,
}

/// Storage contract used by the certificate-management host.
///
/// Every operation takes a cancellation token. `lock` keeps polling until it
/// fires; the other operations abort their in-flight request and return
/// [`StorageError::Cancelled`].
#[async_trait]
pub trait CertificateStorage: Send + Sync {
    /// Block until the lock for `key` is held.
    async fn lock(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()>;

    /// Release the lock for `key`.
    async fn unlock(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()>;

    /// Store `value` under `key`.
    async fn store(&self, key: &str, value: &[u8], cancel: &CancellationToken) -> StorageResult<()>;

    /// Load the value stored under `key`.
    async fn load(&self, key: &str, cancel: &CancellationToken) -> StorageResult<Vec<u8>>;

    /// Delete `key`.
    async fn delete(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StorageResult<bool>;

    /// Keys starting with `prefix`.
    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<String>>;

    /// Metadata for `key`.
    async fn stat(&self, key: &str, cancel: &CancellationToken) -> StorageResult<KeyInfo>;
}

/// Options for wrapping an existing object store.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Prefix prepended to every object key.
    pub prefix: String,
    /// Raw encryption key. `None` or empty selects clear text storage.
    pub encryption_key: Option<Vec<u8>>,
    /// Lock timing.
    pub lock: LockConfig,
}

/// Certificate storage on an object store.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    namer: KeyNamer,
    cipher: PayloadCipher,
    locks: LockManager,
}

impl ObjectStorage {
    /// Connect to the S3-compatible backend described by `config`.
    ///
    /// The encryption key is validated before anything touches the network.
    /// Then the bucket is checked to exist; a missing bucket is a
    /// configuration error.
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let key = config.encryption_key_bytes()?;
        let cipher = PayloadCipher::from_key(key.as_deref())?;
        config.lock.validate()?;

        let s3 = S3ObjectStore::new(config)?;
        match s3.bucket_exists(BUCKET_CHECK_TIMEOUT).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(StorageError::Config(format!(
                    "bucket '{}' does not exist",
                    s3.bucket()
                )));
            }
            Err(e) => {
                return Err(StorageError::Config(format!(
                    "checking if bucket '{}' exists: {}",
                    s3.bucket(),
                    e
                )));
            }
        }

        let namer = KeyNamer::new(config.prefix.clone());
        info!(
            bucket = %s3.bucket(),
            prefix = %namer.prefix(),
            encrypted = cipher.is_encrypted(),
            "Connected certificate storage"
        );

        Ok(Self::from_parts(Arc::new(s3), namer, cipher, config.lock))
    }

    /// Wrap an existing object store. Sends no requests.
    pub fn with_store(store: Arc<dyn ObjectStore>, options: StorageOptions) -> StorageResult<Self> {
        let cipher = PayloadCipher::from_key(options.encryption_key.as_deref())?;
        options.lock.validate()?;
        Ok(Self::from_parts(
            store,
            KeyNamer::new(options.prefix),
            cipher,
            options.lock,
        ))
    }

    fn from_parts(
        store: Arc<dyn ObjectStore>,
        namer: KeyNamer,
        cipher: PayloadCipher,
        lock: LockConfig,
    ) -> Self {
        let locks = LockManager::new(store.clone(), namer.clone(), lock);
        Self {
            store,
            namer,
            cipher,
            locks,
        }
    }

    /// The lock manager, for inspection.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Key mapping in use.
    pub fn namer(&self) -> &KeyNamer {
        &self.namer
    }

    /// Whether payloads are encrypted at rest.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_encrypted()
    }

    async fn list_keys(&self, prefix: &str, recursive: bool) -> StorageResult<Vec<String>> {
        let objects = self.store.list(&self.namer.object_key(prefix)).await?;
        let logical = objects
            .iter()
            .filter_map(|meta| self.namer.logical_key(&meta.key));

        if recursive {
            return Ok(logical.map(str::to_string).collect());
        }

        let mut keys = BTreeSet::new();
        for key in logical {
            keys.insert(collapse_to_child(key, prefix).to_string());
        }
        Ok(keys.into_iter().collect())
    }
}

#[async_trait]
impl CertificateStorage for ObjectStorage {
    async fn lock(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.locks.acquire(key, cancel).await
    }

    async fn unlock(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()> {
        cancellable(cancel, self.locks.release(key)).await
    }

    async fn store(&self, key: &str, value: &[u8], cancel: &CancellationToken) -> StorageResult<()> {
        let sealed = self.cipher.seal(value)?;
        let object_key = self.namer.object_key(key);
        cancellable(cancel, self.store.put(&object_key, Bytes::from(sealed))).await?;
        debug!(key = %key, size = value.len(), "Stored value");
        Ok(())
    }

    async fn load(&self, key: &str, cancel: &CancellationToken) -> StorageResult<Vec<u8>> {
        let object_key = self.namer.object_key(key);
        let stored = match cancellable(cancel, self.store.get(&object_key)).await {
            Ok(stored) => stored,
            Err(e) if e.is_not_found() => return Err(StorageError::NotFound(key.to_string())),
            Err(e) => return Err(e),
        };
        let value = self.cipher.open(&stored)?;
        debug!(key = %key, size = value.len(), "Loaded value");
        Ok(value)
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let object_key = self.namer.object_key(key);
        // S3 deletes succeed for absent keys, so check first
        match cancellable(cancel, self.store.stat(&object_key)).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Err(StorageError::NotFound(key.to_string())),
            Err(e) => return Err(e),
        }
        cancellable(cancel, self.store.delete(&object_key)).await?;
        debug!(key = %key, "Deleted value");
        Ok(())
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        match cancellable(cancel, self.store.stat(&self.namer.object_key(key))).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<String>> {
        cancellable(cancel, self.list_keys(prefix, recursive)).await
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> StorageResult<KeyInfo> {
        let meta = match cancellable(cancel, self.store.stat(&self.namer.object_key(key))).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Err(StorageError::NotFound(key.to_string())),
            Err(e) => return Err(e),
        };
        Ok(KeyInfo {
            key: key.to_string(),
            size: meta.size,
            modified: meta.modified,
            is_terminal: true,
        })
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

/// The entry directly below `prefix` that contains `key`.
///
/// `collapse_to_child("certs/a.com/cert.pem", "certs")` is `"certs/a.com"`.
fn collapse_to_child<'a>(key: &'a str, prefix: &str) -> &'a str {
    let Some(rest) = key.strip_prefix(prefix) else {
        return key;
    };
    let skipped = rest.len() - rest.trim_start_matches('/').len();
    let start = prefix.len() + skipped;
    match key[start..].find('/') {
        Some(end) => &key[..start + end],
        None => key,
    }
}
