//! Configuration schema for certificate storage.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::KEY_LEN;
use crate::error::{StorageError, StorageResult};

/// Storage backend and encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object store endpoint, `host[:port]` or a full URL.
    pub endpoint: String,

    /// Bucket holding certificates, keys and lock records.
    pub bucket: String,

    /// Signing region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Access key id.
    #[serde(default)]
    pub access_key_id: String,

    /// Secret access key.
    #[serde(default)]
    pub secret_access_key: String,

    /// Prefix prepended to every object key.
    #[serde(default)]
    pub prefix: String,

    /// Use plain HTTP when the endpoint has no scheme.
    #[serde(default)]
    pub insecure: bool,

    /// Encryption key as 64 hex characters. Leave unset for clear text storage.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Environment variable holding the hex key when `encryption_key` is unset.
    #[serde(default)]
    pub encryption_key_env: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Lock timing.
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            prefix: String::new(),
            insecure: false,
            encryption_key: None,
            encryption_key_env: None,
            request_timeout_secs: default_request_timeout_secs(),
            lock: LockConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolve the raw encryption key.
    ///
    /// The inline key wins over the environment variable. Returns `None` when
    /// neither is set (or the value is empty). Length is not checked here.
    pub fn encryption_key_bytes(&self) -> StorageResult<Option<Vec<u8>>> {
        let hex_key = match (&self.encryption_key, &self.encryption_key_env) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(var)) => std::env::var(var).ok(),
            (None, None) => None,
        };

        match hex_key.map(|k| k.trim().to_string()) {
            None => Ok(None),
            Some(k) if k.is_empty() => Ok(None),
            Some(k) => hex::decode(&k).map(Some).map_err(|e| {
                StorageError::Config(format!(
                    "encryption key must be {} hex characters: {}",
                    KEY_LEN * 2,
                    e
                ))
            }),
        }
    }
}

/// Lock timing thresholds.
///
/// A lock record older than `freshness_secs` is expired and taken over; one
/// older than `abandonment_secs` is considered dead and deleted before being
/// taken over. A held lock is re-read every `poll_interval_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age in seconds after which a lock is expired.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,

    /// Age in seconds after which a lock is abandoned.
    #[serde(default = "default_abandonment_secs")]
    pub abandonment_secs: u64,

    /// Delay between reads of a held lock, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_freshness_secs() -> u64 {
    15
}
fn default_abandonment_secs() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
            abandonment_secs: default_abandonment_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LockConfig {
    /// Age after which a lock is expired.
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    /// Age after which a lock is abandoned.
    pub fn abandonment(&self) -> Duration {
        Duration::from_secs(self.abandonment_secs)
    }

    /// Delay between reads of a held lock.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the polling loop cannot work with.
    pub fn validate(&self) -> StorageResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(StorageError::Config(
                "lock poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
