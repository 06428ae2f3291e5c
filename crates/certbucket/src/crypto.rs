//! Encryption at rest for stored payloads.
//!
//! A [`PayloadCipher`] is chosen once when the storage is built:
//!
//! - **Cleartext**: payloads are written as-is.
//! - **SecretBox**: payloads are sealed with XChaCha20-Poly1305 under a fixed
//!   32-byte key. Each write draws a fresh 24-byte nonce from the OS RNG and
//!   the stored object is `nonce || ciphertext || tag`.
//!
//! The key never leaves the process and is never written next to the data.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

use crate::error::{StorageError, StorageResult};

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length prepended to every sealed payload.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Transform applied to payloads on the store/load path.
pub enum PayloadCipher {
    /// Identity transform.
    Cleartext,
    /// Authenticated symmetric encryption.
    SecretBox(Box<XChaCha20Poly1305>),
}

impl PayloadCipher {
    /// Select the cipher from an optional key.
    ///
    /// No key (or an empty one) selects cleartext storage, exactly
    /// [`KEY_LEN`] bytes selects the secret box, anything else is a
    /// configuration error. This never touches the network.
    pub fn from_key(key: Option<&[u8]>) -> StorageResult<Self> {
        match key {
            None | Some([]) => {
                info!("Clear text certificate storage active");
                Ok(Self::Cleartext)
            }
            Some(key) if key.len() != KEY_LEN => Err(StorageError::Config(format!(
                "encryption key must have exactly {} bytes, got {}",
                KEY_LEN,
                key.len()
            ))),
            Some(key) => {
                info!("Encrypted certificate storage active");
                let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
                Ok(Self::SecretBox(Box::new(cipher)))
            }
        }
    }

    /// Whether payloads are encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::SecretBox(_))
    }

    /// Turn plaintext into the bytes written to the object store.
    pub fn seal(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        match self {
            Self::Cleartext => Ok(plaintext.to_vec()),
            Self::SecretBox(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);

                let ciphertext = cipher
                    .encrypt(XNonce::from_slice(&nonce), plaintext)
                    .map_err(|err| StorageError::Crypto(err.to_string()))?;

                let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Turn stored bytes back into plaintext.
    ///
    /// For the secret box this fails with [`StorageError::Authentication`]
    /// when the key is wrong or any byte was altered; it never returns
    /// partially decrypted data.
    pub fn open(&self, stored: &[u8]) -> StorageResult<Vec<u8>> {
        match self {
            Self::Cleartext => Ok(stored.to_vec()),
            Self::SecretBox(cipher) => {
                if stored.len() < NONCE_LEN + TAG_LEN {
                    return Err(StorageError::Authentication);
                }
                let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
                cipher
                    .decrypt(XNonce::from_slice(nonce), ciphertext)
                    .map_err(|_| StorageError::Authentication)
            }
        }
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleartext => f.write_str("PayloadCipher::Cleartext"),
            Self::SecretBox(_) => f.write_str("PayloadCipher::SecretBox(..)"),
        }
    }
}

/// Generate a fresh random encryption key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}
