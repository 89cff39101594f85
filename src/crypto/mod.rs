//! Symmetric encryption of searchable content under a per-user key.
use crate::errors::{EngineError, EngineResult};
use crate::types::{DecryptedMessageContent, EncryptedPayload};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use tracing::{debug, info};

mod storage;

pub use storage::{KeyringStorage, MemoryStorage, SecureStorage};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// 256-bit search key. Never logged, never exported.
#[derive(Clone, PartialEq, Eq)]
pub struct SearchKey([u8; KEY_LEN]);

impl SearchKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            EngineError::SecureStorage(format!(
                "stored search key has {} bytes, expected {KEY_LEN}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SearchKey(<redacted>)")
    }
}

pub struct SearchCipher {
    inner: Aes256Gcm,
}

impl SearchCipher {
    pub fn new(key: &SearchKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            inner: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, content: &DecryptedMessageContent) -> EngineResult<EncryptedPayload> {
        let plaintext = serde_json::to_vec(content)
            .map_err(|e| EngineError::Unexpected(format!("serializing content: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .inner
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| EngineError::Unexpected("encrypting content failed".into()))?;

        Ok(EncryptedPayload {
            size: ciphertext.len() as i64,
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(nonce),
        })
    }

    pub fn decrypt(&self, ciphertext: &str, iv: &str) -> EngineResult<DecryptedMessageContent> {
        let nonce = STANDARD
            .decode(iv)
            .map_err(|e| EngineError::Decryption(format!("malformed iv: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(EngineError::Decryption(format!(
                "iv has {} bytes, expected {NONCE_LEN}",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|e| EngineError::Decryption(format!("malformed ciphertext: {e}")))?;

        let plaintext = self
            .inner
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| EngineError::Decryption("authentication failed (wrong key or corrupt row)".into()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| EngineError::Decryption(format!("decoding content: {e}")))
    }
}

fn key_name(user_id: &str) -> String {
    format!("search-index-key:{user_id}")
}

/// Reads the user's key from secure storage, creating and persisting a
/// fresh one on first use.
pub fn get_or_create_key(storage: &dyn SecureStorage, user_id: &str) -> EngineResult<SearchKey> {
    if let Some(key) = load_key(storage, user_id)? {
        return Ok(key);
    }

    let key = SearchKey::generate();
    storage.set(&key_name(user_id), key.as_bytes())?;
    info!(user = %user_id, "Created search index key");
    Ok(key)
}

pub fn load_key(storage: &dyn SecureStorage, user_id: &str) -> EngineResult<Option<SearchKey>> {
    match storage.get(&key_name(user_id))? {
        Some(bytes) => SearchKey::from_bytes(&bytes).map(Some),
        None => Ok(None),
    }
}

pub fn destroy_key(storage: &dyn SecureStorage, user_id: &str) -> EngineResult<()> {
    storage.delete(&key_name(user_id))?;
    debug!(user = %user_id, "Destroyed search index key");
    Ok(())
}
