//! Polling locks on top of a plain object store.
//!
//! A lock for key `k` is an object named `<prefix>/k.lock` whose only content
//! is the RFC 3339 time it was taken. Presence means "possibly held",
//! absence means "free".
//!
//! # Acquisition
//!
//! 1. Read the lock record. Absent: write a fresh one, done.
//! 2. Unparseable: overwrite it, done.
//! 3. Older than the abandonment threshold: delete it (a missing object is
//!    fine), log a warning, write a fresh one, done.
//! 4. Older than the freshness threshold: overwrite it, done.
//! 5. Otherwise wait one poll interval and start over.
//!
//! Every store request and every wait is raced against the caller's
//! cancellation, which ends acquisition with
//! [`StorageError::LockNotAcquired`] as soon as it fires.
//!
//! # Limitations
//!
//! The object store has no create-if-absent primitive, so the read in step 1
//! and the write that follows are not atomic: two callers racing on a free
//! lock can both succeed. Records carry no owner, so any caller can release
//! any lock. Ages are computed from wall clocks, which must be roughly in sync
//! across nodes. A holder that stalls past the freshness threshold loses its
//! lock; protected operations have to be safe to repeat. A write abandoned
//! by cancellation may still have reached the store; such a record is never
//! refreshed and expires after the freshness threshold.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::LockConfig;
use crate::error::{StorageError, StorageResult};
use crate::naming::KeyNamer;
use crate::object::ObjectStore;

/// Contents of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    /// When the lock was taken.
    pub locked_at: DateTime<Utc>,
}

impl LockRecord {
    /// A record stamped with the current time.
    pub fn now() -> Self {
        Self {
            locked_at: Utc::now(),
        }
    }

    /// Serialized form written to the store.
    pub fn encode(&self) -> String {
        self.locked_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parse a stored record. `None` if it is not a valid timestamp.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?;
        let locked_at = DateTime::parse_from_rfc3339(text.trim()).ok()?;
        Some(Self {
            locked_at: locked_at.with_timezone(&Utc),
        })
    }
}

/// What a lock record says about a lock at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No record.
    Free,
    /// Recent record; the lock is taken.
    Held { locked_at: DateTime<Utc>, age: Duration },
    /// Older than the freshness threshold; will be taken over.
    Expired { locked_at: DateTime<Utc>, age: Duration },
    /// Older than the abandonment threshold; will be deleted and taken over.
    Abandoned { locked_at: DateTime<Utc>, age: Duration },
    /// Record content is not a timestamp; will be overwritten.
    Corrupt,
}

impl LockState {
    /// Classify a record read at `now`.
    ///
    /// A timestamp in the future (clock skew) counts as held.
    pub fn classify(record: LockRecord, now: DateTime<Utc>, config: &LockConfig) -> Self {
        let locked_at = record.locked_at;
        match now.signed_duration_since(locked_at).to_std() {
            Err(_) => Self::Held {
                locked_at,
                age: Duration::ZERO,
            },
            Ok(age) if age > config.abandonment() => Self::Abandoned { locked_at, age },
            Ok(age) if age > config.freshness() => Self::Expired { locked_at, age },
            Ok(age) => Self::Held { locked_at, age },
        }
    }

    /// Whether a new acquisition would have to wait.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Held { locked_at, age } => {
                write!(f, "held since {} ({}s ago)", locked_at, age.as_secs())
            }
            Self::Expired { locked_at, age } => {
                write!(f, "expired, taken {} ({}s ago)", locked_at, age.as_secs())
            }
            Self::Abandoned { locked_at, age } => {
                write!(f, "abandoned, taken {} ({}s ago)", locked_at, age.as_secs())
            }
            Self::Corrupt => write!(f, "corrupt lock record"),
        }
    }
}

/// Acquires and releases named locks through an [`ObjectStore`].
///
/// Holds no in-process state about which locks are taken; every decision is
/// made from what the store returns.
pub struct LockManager {
    store: Arc<dyn ObjectStore>,
    namer: KeyNamer,
    config: LockConfig,
}

impl LockManager {
    /// Create a lock manager.
    pub fn new(store: Arc<dyn ObjectStore>, namer: KeyNamer, config: LockConfig) -> Self {
        Self {
            store,
            namer,
            config,
        }
    }

    /// Wait until the lock for `key` is obtained or `cancel` fires.
    ///
    /// Returns [`StorageError::LockNotAcquired`] on cancellation, including
    /// a token that is already cancelled. Storage errors abort the wait and
    /// are returned unchanged.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.acquire_until(key, cancel.cancelled()).await
    }

    /// Wait at most `timeout` for the lock for `key`.
    pub async fn acquire_timeout(&self, key: &str, timeout: Duration) -> StorageResult<()> {
        self.acquire_until(key, tokio::time::sleep(timeout)).await
    }

    async fn acquire_until<F>(&self, key: &str, stop: F) -> StorageResult<()>
    where
        F: Future<Output = ()>,
    {
        let result = self.poll_until(key, stop).await;
        if let Err(e) = &result {
            if e.is_transient() {
                warn!(key = %key, error = %e, "Lock acquisition aborted by storage error");
            }
        }
        result
    }

    async fn poll_until<F>(&self, key: &str, stop: F) -> StorageResult<()>
    where
        F: Future<Output = ()>,
    {
        let lock_key = self.namer.lock_key(key);
        tokio::pin!(stop);

        loop {
            match unless_stopped(key, stop.as_mut(), self.read_state(&lock_key)).await? {
                LockState::Free => {
                    trace!(key = %key, "Lock is free");
                }
                LockState::Corrupt => {
                    debug!(key = %key, lock = %lock_key, "Overwriting unreadable lock record");
                }
                LockState::Expired { locked_at, age } => {
                    debug!(
                        key = %key,
                        locked_at = %locked_at,
                        age_ms = age.as_millis() as u64,
                        "Taking over expired lock"
                    );
                }
                LockState::Abandoned { locked_at, age } => {
                    warn!(
                        key = %key,
                        lock = %lock_key,
                        locked_at = %locked_at,
                        age_secs = age.as_secs(),
                        "Lock is stale; removing then retrying"
                    );
                    match unless_stopped(key, stop.as_mut(), self.store.delete(&lock_key)).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                LockState::Held { locked_at, age } => {
                    trace!(
                        key = %key,
                        locked_at = %locked_at,
                        age_ms = age.as_millis() as u64,
                        "Lock is held, waiting"
                    );
                    let poll = async {
                        tokio::time::sleep(self.config.poll_interval()).await;
                        StorageResult::Ok(())
                    };
                    unless_stopped(key, stop.as_mut(), poll).await?;
                    continue;
                }
            }

            unless_stopped(key, stop.as_mut(), self.write_record(&lock_key)).await?;
            debug!(key = %key, "Acquired lock");
            return Ok(());
        }
    }

    /// Delete the lock record for `key`.
    ///
    /// Succeeds when the record is already gone.
    pub async fn release(&self, key: &str) -> StorageResult<()> {
        let lock_key = self.namer.lock_key(key);
        match self.store.delete(&lock_key).await {
            Ok(()) => {
                debug!(key = %key, "Released lock");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Report the current state of the lock for `key` without changing it.
    pub async fn inspect(&self, key: &str) -> StorageResult<LockState> {
        self.read_state(&self.namer.lock_key(key)).await
    }

    async fn read_state(&self, lock_key: &str) -> StorageResult<LockState> {
        let body = match self.store.get(lock_key).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(LockState::Free),
            Err(e) => return Err(e),
        };

        Ok(match LockRecord::parse(&body) {
            Some(record) => LockState::classify(record, Utc::now(), &self.config),
            None => LockState::Corrupt,
        })
    }

    async fn write_record(&self, lock_key: &str) -> StorageResult<()> {
        let record = LockRecord::now();
        self.store
            .put(lock_key, Bytes::from(record.encode()))
            .await
    }
}

/// Run `fut` unless `stop` completes first, in which case the lock is not
/// acquired.
async fn unless_stopped<S, T, F>(key: &str, stop: Pin<&mut S>, fut: F) -> StorageResult<T>
where
    S: Future<Output = ()>,
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = stop => {
            debug!(key = %key, "Gave up waiting for lock");
            Err(StorageError::LockNotAcquired {
                key: key.to_string(),
            })
        }
        result = fut => result,
    }
}
