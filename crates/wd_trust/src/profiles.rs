use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use wd_proto::{paths, DeviceClaim, UserSecurityProfile};
use wd_store::RecordStore;

use crate::error::{Result, TrustError};

/// Typed access to `users/{id}/security` with optimistic concurrency.
#[derive(Clone)]
pub struct Profiles {
    store: Arc<dyn RecordStore>,
    max_retries: u32,
}

impl Profiles {
    pub fn new(store: Arc<dyn RecordStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn find(&self, user_id: &str) -> Result<Option<UserSecurityProfile>> {
        paths::check_id(user_id)?;
        match self.store.get(&paths::profile(user_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<UserSecurityProfile> {
        self.find(user_id)
            .await?
            .ok_or_else(|| TrustError::ProfileNotFound(user_id.to_owned()))
    }

    /// Create only if no profile exists yet.
    pub async fn create(&self, profile: &UserSecurityProfile) -> Result<()> {
        paths::check_id(&profile.user_id)?;
        let created = self
            .store
            .compare_and_swap(
                &paths::profile(&profile.user_id),
                None,
                Some(serde_json::to_value(profile)?),
            )
            .await?;
        if !created {
            return Err(TrustError::AccountExists(profile.user_id.clone()));
        }
        Ok(())
    }

    /// Read-modify-write with whole-record compare-and-swap. `apply` may run
    /// more than once and must be a pure function of the profile it gets.
    /// Returning `Err` aborts without writing.
    pub async fn mutate<T, F>(&self, user_id: &str, mut apply: F) -> Result<(UserSecurityProfile, T)>
    where
        T: Send,
        F: FnMut(&mut UserSecurityProfile) -> Result<T> + Send,
    {
        paths::check_id(user_id)?;
        let path = paths::profile(user_id);
        for attempt in 0..self.max_retries {
            let raw: Value = self
                .store
                .get(&path)
                .await?
                .ok_or_else(|| TrustError::ProfileNotFound(user_id.to_owned()))?;
            let mut profile: UserSecurityProfile = serde_json::from_value(raw.clone())?;
            let out = apply(&mut profile)?;
            let next = serde_json::to_value(&profile)?;
            if next == raw {
                return Ok((profile, out));
            }
            if self.store.compare_and_swap(&path, Some(&raw), Some(next)).await? {
                return Ok((profile, out));
            }
            debug!(user_id = %user_id, attempt, "profile update raced; retrying");
        }
        Err(TrustError::Conflict(path))
    }

    /// Field-level conditional swap of the device claim. Leaves the rest of
    /// the profile untouched so it never races counter updates.
    pub async fn swap_device(
        &self,
        user_id: &str,
        expected: &DeviceClaim,
        new: &DeviceClaim,
    ) -> Result<bool> {
        paths::check_id(user_id)?;
        Ok(self
            .store
            .swap_field(
                &paths::profile(user_id),
                "/device",
                &serde_json::to_value(expected)?,
                serde_json::to_value(new)?,
            )
            .await?)
    }

    pub async fn list(&self) -> Result<Vec<UserSecurityProfile>> {
        let mut out = Vec::new();
        for (path, raw) in self.store.list(paths::USERS).await? {
            let is_profile = path
                .strip_prefix(paths::USERS)
                .and_then(|rest| rest.split_once('/'))
                .is_some_and(|(_, tail)| tail == "security");
            if !is_profile {
                continue;
            }
            out.push(serde_json::from_value(raw)?);
        }
        Ok(out)
    }
}
