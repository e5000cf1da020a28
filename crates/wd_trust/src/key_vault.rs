//! Device-local custody of account private keys.

use std::sync::Arc;

use tracing::{debug, warn};
use wd_crypto::{KeyPair, PrivateKey};
use wd_store::SecureLocalVault;

use crate::error::Result;

const KEY_PREFIX: &str = "wd.private_key.";

/// Single owning handle over the secure local vault. Private keys never
/// leave the device through this type.
#[derive(Clone)]
pub struct KeyVault {
    vault: Arc<dyn SecureLocalVault>,
}

impl KeyVault {
    pub fn new(vault: Arc<dyn SecureLocalVault>) -> Self {
        Self { vault }
    }

    fn slot(user_id: &str) -> String {
        format!("{KEY_PREFIX}{user_id}")
    }

    pub fn generate_key_pair() -> KeyPair {
        KeyPair::generate()
    }

    pub fn store_private_key(&self, user_id: &str, key: &PrivateKey) -> Result<()> {
        self.vault.set(&Self::slot(user_id), key.as_bytes())?;
        debug!(user_id = %user_id, "private key stored in local vault");
        Ok(())
    }

    /// `None` when the slot is empty. A slot holding garbage is treated as
    /// empty so the caller falls back to escrow.
    pub fn get_private_key(&self, user_id: &str) -> Result<Option<PrivateKey>> {
        let Some(bytes) = self.vault.get(&Self::slot(user_id))? else {
            return Ok(None);
        };
        match PrivateKey::from_bytes(&bytes) {
            Ok(key) => Ok(Some(key)),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "local private key is corrupt; ignoring");
                Ok(None)
            }
        }
    }

    pub fn has_keys(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_private_key(user_id)?.is_some())
    }

    pub fn clear(&self, user_id: &str) -> Result<()> {
        self.vault.clear(&Self::slot(user_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wd_store::MemoryVault;

    #[test]
    fn keys_are_scoped_per_user() {
        let backing = Arc::new(MemoryVault::new());
        let vault = KeyVault::new(backing.clone());
        let kp = KeyVault::generate_key_pair();
        vault.store_private_key("u1", &kp.private).unwrap();

        assert!(vault.has_keys("u1").unwrap());
        assert!(!vault.has_keys("u2").unwrap());
        let loaded = vault.get_private_key("u1").unwrap().unwrap();
        assert_eq!(loaded.public_key(), kp.public);

        vault.clear("u1").unwrap();
        assert!(vault.get_private_key("u1").unwrap().is_none());
    }

    #[test]
    fn corrupt_slot_reads_as_missing() {
        let backing = Arc::new(MemoryVault::new());
        backing.set("wd.private_key.u1", b"short").unwrap();
        let vault = KeyVault::new(backing);
        assert!(!vault.has_keys("u1").unwrap());
    }
}
