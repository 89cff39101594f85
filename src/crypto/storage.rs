use crate::errors::{EngineError, EngineResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Mutex;

const SERVICE_NAME: &str = "sealsearch-index-key";

/// Secret store for the per-user search key.
pub trait SecureStorage: Send + Sync {
    fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> EngineResult<()>;
    /// Removing an absent entry is not an error.
    fn delete(&self, key: &str) -> EngineResult<()>;
}

/// OS keychain backed storage.
#[derive(Clone, Debug, Default)]
pub struct KeyringStorage;

impl KeyringStorage {
    fn entry(key: &str) -> EngineResult<keyring::Entry> {
        keyring::Entry::new(SERVICE_NAME, key)
            .map_err(|e| EngineError::SecureStorage(format!("keyring entry error: {e}")))
    }
}

impl SecureStorage for KeyringStorage {
    fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match Self::entry(key)?.get_password() {
            Ok(encoded) => STANDARD
                .decode(encoded.trim())
                .map(Some)
                .map_err(|e| EngineError::SecureStorage(format!("keyring value decode: {e}"))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(EngineError::SecureStorage(format!("keyring read: {e}"))),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> EngineResult<()> {
        Self::entry(key)?
            .set_password(&STANDARD.encode(value))
            .map_err(|e| EngineError::SecureStorage(format!("keyring write: {e}")))
    }

    fn delete(&self, key: &str) -> EngineResult<()> {
        match Self::entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(EngineError::SecureStorage(format!("keyring delete: {e}"))),
        }
    }
}

/// Process-local storage for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| EngineError::SecureStorage("memory storage lock poisoned".into()))
    }
}

impl SecureStorage for MemoryStorage {
    fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> EngineResult<()> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> EngineResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
