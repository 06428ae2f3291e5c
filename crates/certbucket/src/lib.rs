//! # certbucket
//!
//! Certificate storage for ACME clients on S3-compatible object stores.
//!
//! Certificates, private keys and account data are stored as objects under a
//! configurable prefix, optionally encrypted with a shared 32-byte key.
//! Cluster members coordinate issuance through polling lock records kept in
//! the same bucket; locks left behind by crashed holders expire on their own.
//!
//! ```no_run
//! use certbucket::{CancellationToken, CertificateStorage, ObjectStorage, StorageConfig};
//!
//! # async fn run(config: StorageConfig) -> certbucket::StorageResult<()> {
//! let storage = ObjectStorage::connect(&config).await?;
//! let cancel = CancellationToken::new();
//!
//! storage.lock("certificates/example.com", &cancel).await?;
//! storage
//!     .store("certificates/example.com/example.com.crt", b"-----BEGIN", &cancel)
//!     .await?;
//! storage.unlock("certificates/example.com", &cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod naming;
pub mod object;
pub mod storage;

pub use config::{LockConfig, StorageConfig};
pub use crypto::{generate_key, PayloadCipher};
pub use error::{StorageError, StorageResult};
pub use lock::{LockManager, LockRecord, LockState};
pub use naming::KeyNamer;
pub use object::{MemoryObjectStore, ObjectMeta, ObjectStore, S3ObjectStore};
pub use storage::{CertificateStorage, KeyInfo, ObjectStorage, StorageOptions};

pub use tokio_util::sync::CancellationToken;
