use std::sync::Arc;

use tracing::{info, warn};
use wd_proto::{paths, DeviceRequest, EncryptedMessage, PasscodeState, UserSecurityProfile};
use wd_store::RecordStore;

use crate::clock::Clock;
use crate::error::Result;
use crate::key_vault::KeyVault;

/// Drop every secret-bearing field from a profile. The record itself stays
/// as a tombstone so the account id can never be silently reused.
pub fn scrub_profile(profile: &mut UserSecurityProfile) {
    profile.public_key = None;
    profile.encrypted_private_key_backup = None;
    profile.passcode = PasscodeState::NotSet;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErasureReport {
    pub messages: usize,
    pub chats: usize,
    pub requests: usize,
    pub local_key: bool,
}

/// Irreversible removal of an account's data from the record store and
/// this device's vault.
#[derive(Clone)]
pub struct AccountEraser {
    store: Arc<dyn RecordStore>,
    keys: KeyVault,
    clock: Arc<dyn Clock>,
}

impl AccountEraser {
    pub fn new(store: Arc<dyn RecordStore>, keys: KeyVault, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    pub async fn erase(&self, user_id: &str) -> Result<ErasureReport> {
        let mut report = ErasureReport::default();

        for (path, raw) in self.store.list(paths::MESSAGES).await? {
            let involved = match serde_json::from_value::<EncryptedMessage>(raw) {
                Ok(msg) => msg.involves(user_id),
                Err(err) => {
                    warn!(path = %path, error = %err, "skipping malformed message during erasure");
                    false
                }
            };
            if involved && self.store.remove(&path).await? {
                report.messages += 1;
            }
        }

        report.chats = self.store.remove_prefix(&paths::chats_prefix(user_id)).await?;

        let now = self.clock.now();
        for (path, raw) in self.store.list(paths::DEVICE_REQUESTS).await? {
            let Ok(mut request) = serde_json::from_value::<DeviceRequest>(raw.clone()) else {
                continue;
            };
            if request.user_id != user_id || !request.is_pending() {
                continue;
            }
            request.expire(now)?;
            if self
                .store
                .compare_and_swap(&path, Some(&raw), Some(serde_json::to_value(&request)?))
                .await?
            {
                report.requests += 1;
            }
        }

        report.local_key = self.keys.has_keys(user_id)?;
        self.keys.clear(user_id)?;

        info!(
            user_id = %user_id,
            messages = report.messages,
            chats = report.chats,
            requests = report.requests,
            local_key = report.local_key,
            "account data erased"
        );
        Ok(report)
    }
}
