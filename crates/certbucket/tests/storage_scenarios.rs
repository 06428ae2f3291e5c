//! End-to-end behavior of the storage facade over the in-memory object store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use certbucket::{
    CancellationToken, CertificateStorage, LockConfig, LockRecord, LockState, MemoryObjectStore,
    ObjectMeta, ObjectStorage, ObjectStore, StorageError, StorageOptions, StorageResult,
};

const PEM: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

fn storage_with(key: Option<Vec<u8>>) -> (Arc<MemoryObjectStore>, ObjectStorage) {
    let store = Arc::new(MemoryObjectStore::new());
    let storage = ObjectStorage::with_store(
        store.clone(),
        StorageOptions {
            prefix: "acme".to_string(),
            encryption_key: key,
            lock: LockConfig::default(),
        },
    )
    .expect("valid options");
    (store, storage)
}

#[tokio::test]
async fn cleartext_round_trip_stores_plaintext() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    assert!(!storage.is_encrypted());

    storage
        .store("certificates/a.com/a.com.crt", PEM, &cancel)
        .await
        .unwrap();

    let loaded = storage
        .load("certificates/a.com/a.com.crt", &cancel)
        .await
        .unwrap();
    assert_eq!(loaded, PEM);

    let raw = store.get("acme/certificates/a.com/a.com.crt").await.unwrap();
    assert_eq!(&raw[..], PEM);
}

#[tokio::test]
async fn encrypted_round_trip_hides_plaintext() {
    let (store, storage) = storage_with(Some(vec![0u8; 32]));
    let cancel = CancellationToken::new();
    assert!(storage.is_encrypted());

    storage.store("accounts/me.json", PEM, &cancel).await.unwrap();
    assert_eq!(storage.load("accounts/me.json", &cancel).await.unwrap(), PEM);

    let raw = store.get("acme/accounts/me.json").await.unwrap();
    assert_ne!(&raw[..], PEM);
    assert_eq!(raw.len(), PEM.len() + 24 + 16);

    let info = storage.stat("accounts/me.json", &cancel).await.unwrap();
    assert_eq!(info.size, raw.len() as u64);
}

#[tokio::test]
async fn tampered_payload_fails_authentication() {
    let (store, storage) = storage_with(Some(vec![7u8; 32]));
    let cancel = CancellationToken::new();
    storage.store("k", PEM, &cancel).await.unwrap();

    let mut raw = store.get("acme/k").await.unwrap().to_vec();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    store.put("acme/k", Bytes::from(raw)).await.unwrap();

    assert!(matches!(
        storage.load("k", &cancel).await,
        Err(StorageError::Authentication)
    ));
}

#[tokio::test]
async fn wrong_key_fails_authentication() {
    let store = Arc::new(MemoryObjectStore::new());
    let cancel = CancellationToken::new();
    let writer = ObjectStorage::with_store(
        store.clone(),
        StorageOptions {
            encryption_key: Some(vec![1u8; 32]),
            ..Default::default()
        },
    )
    .unwrap();
    let reader = ObjectStorage::with_store(
        store.clone(),
        StorageOptions {
            encryption_key: Some(vec![2u8; 32]),
            ..Default::default()
        },
    )
    .unwrap();

    writer.store("k", PEM, &cancel).await.unwrap();
    assert!(matches!(
        reader.load("k", &cancel).await,
        Err(StorageError::Authentication)
    ));
}

#[tokio::test]
async fn short_key_is_rejected_before_any_request() {
    let store = Arc::new(MemoryObjectStore::new());
    let result = ObjectStorage::with_store(
        store.clone(),
        StorageOptions {
            encryption_key: Some(vec![0u8; 16]),
            ..Default::default()
        },
    );

    assert!(matches!(result, Err(StorageError::Config(_))));
    assert_eq!(store.request_count(), 0);
}

#[tokio::test]
async fn free_lock_is_acquired_immediately() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    let before = Utc::now();

    storage.lock("certA", &cancel).await.unwrap();

    let body = store.get("acme/certA.lock").await.unwrap();
    let record = LockRecord::parse(&body).expect("timestamp record");
    assert!(record.locked_at >= before - chrono::Duration::milliseconds(1));
    assert!(record.locked_at <= Utc::now());
    assert!(storage.locks().inspect("certA").await.unwrap().is_held());
}

#[tokio::test(start_paused = true)]
async fn held_lock_times_out_at_deadline() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    storage.lock("certA", &cancel).await.unwrap();
    let record = store.get("acme/certA.lock").await.unwrap();

    let deadline = CancellationToken::new();
    let trigger = deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let err = storage.lock("certA", &deadline).await.unwrap_err();
    assert!(matches!(err, StorageError::LockNotAcquired { ref key } if key == "certA"));
    assert_eq!(store.get("acme/certA.lock").await.unwrap(), record);
}

#[tokio::test(start_paused = true)]
async fn unlock_lets_waiter_through() {
    let (_store, storage) = storage_with(None);
    let storage = Arc::new(storage);
    let cancel = CancellationToken::new();
    storage.lock("certA", &cancel).await.unwrap();

    let waiter = {
        let storage = storage.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { storage.lock("certA", &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!waiter.is_finished());

    storage.unlock("certA", &cancel).await.unwrap();
    waiter.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn abandoned_lock_is_reclaimed() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    let stale = LockRecord {
        locked_at: Utc::now() - chrono::Duration::seconds(150),
    };
    store
        .put("acme/certA.lock", Bytes::from(stale.encode()))
        .await
        .unwrap();
    assert!(matches!(
        storage.locks().inspect("certA").await.unwrap(),
        LockState::Abandoned { .. }
    ));

    tokio::time::timeout(Duration::from_secs(1), storage.lock("certA", &cancel))
        .await
        .expect("reclaimed within one poll interval")
        .unwrap();

    let body = store.get("acme/certA.lock").await.unwrap();
    let record = LockRecord::parse(&body).unwrap();
    assert!(record.locked_at > stale.locked_at);
}

#[tokio::test]
async fn missing_keys_are_distinguishable() {
    let (_store, storage) = storage_with(Some(vec![3u8; 32]));
    let cancel = CancellationToken::new();

    assert!(storage.load("gone", &cancel).await.unwrap_err().is_not_found());
    assert!(storage.delete("gone", &cancel).await.unwrap_err().is_not_found());
    assert!(storage.stat("gone", &cancel).await.unwrap_err().is_not_found());
    assert!(!storage.exists("gone", &cancel).await.unwrap());

    storage.store("here", b"x", &cancel).await.unwrap();
    assert!(storage.exists("here", &cancel).await.unwrap());
    storage.delete("here", &cancel).await.unwrap();
    assert!(!storage.exists("here", &cancel).await.unwrap());
}

#[tokio::test]
async fn listing_includes_lock_records() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    storage
        .store("certificates/a.com/a.com.crt", b"c", &cancel)
        .await
        .unwrap();
    storage.lock("certificates/a.com", &cancel).await.unwrap();
    assert_eq!(store.len(), 2);

    let keys = storage.list("", true, &cancel).await.unwrap();
    assert_eq!(
        keys,
        vec!["certificates/a.com.lock", "certificates/a.com/a.com.crt"]
    );

    let top = storage.list("", false, &cancel).await.unwrap();
    assert_eq!(top, vec!["certificates"]);
}

#[tokio::test]
async fn stat_reports_recorded_modification_time() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    let modified = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    store.insert_with_modified(
        "acme/certificates/a.com/a.com.key",
        Bytes::from_static(b"key"),
        modified,
    );

    let info = storage
        .stat("certificates/a.com/a.com.key", &cancel)
        .await
        .unwrap();
    assert_eq!(info.modified, modified);
    assert_eq!(info.size, 3);
}

#[tokio::test]
async fn cancelled_lock_leaves_no_record() {
    let (store, storage) = storage_with(None);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        storage.store("certA/cert.pem", PEM, &cancel).await,
        Err(StorageError::Cancelled)
    ));
    assert!(matches!(
        storage.lock("certA", &cancel).await,
        Err(StorageError::LockNotAcquired { .. })
    ));
    assert_eq!(store.len(), 0);
}

/// Object store whose reads never finish in time.
struct StalledStore {
    inner: MemoryObjectStore,
}

#[async_trait]
impl ObjectStore for StalledStore {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        self.inner.put(key, body).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        self.inner.list(prefix).await
    }

    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.stat(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn lock_honours_cancellation_during_slow_read() {
    let store = Arc::new(StalledStore {
        inner: MemoryObjectStore::new(),
    });
    let storage = ObjectStorage::with_store(store.clone(), StorageOptions::default()).unwrap();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
    }

    let started = tokio::time::Instant::now();
    let result = storage.lock("certA", &cancel).await;
    assert!(matches!(result, Err(StorageError::LockNotAcquired { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(store.inner.is_empty());
}
