use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::error::StoreError;

/// Device-local secret storage. Nothing written here leaves the device.
pub trait SecureLocalVault: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;
    fn set(&self, key: &str, secret: &[u8]) -> Result<(), StoreError>;
    /// Deleting an absent key is not an error.
    fn clear(&self, key: &str) -> Result<(), StoreError>;

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

/// OS keyring (Keychain, Credential Manager, Secret Service). Secrets are
/// stored base64 encoded since keyring entries hold strings.
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key).map_err(|e| StoreError::Keyring(format!("keyring init: {e}")))
    }
}

impl SecureLocalVault for KeyringVault {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let encoded = match self.entry(key)?.get_password() {
            Ok(s) => Zeroizing::new(s),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(StoreError::Keyring(format!("load secret: {e}"))),
        };
        let decoded = general_purpose::STANDARD.decode(encoded.as_bytes())?;
        Ok(Some(Zeroizing::new(decoded)))
    }

    fn set(&self, key: &str, secret: &[u8]) -> Result<(), StoreError> {
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(secret));
        self.entry(key)?
            .set_password(&encoded)
            .map_err(|e| StoreError::Keyring(format!("store secret: {e}")))
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(format!("delete secret: {e}"))),
        }
    }
}

/// Process-local vault for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureLocalVault for MemoryVault {
    fn get(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, secret: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(key.to_owned(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
