use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};
use wd_crypto::PublicKey;
use wd_proto::{paths, Role, RoleGrant};
use wd_store::{RecordStore, RecordStoreExt};

use crate::clock::Clock;
use crate::error::{Result, TrustError};
use crate::profiles::Profiles;

/// Who may approve devices and who reads oversight branches.
#[derive(Clone)]
pub struct RoleTable {
    store: Arc<dyn RecordStore>,
    profiles: Profiles,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl RoleTable {
    pub fn new(store: Arc<dyn RecordStore>, profiles: Profiles, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            profiles,
            clock,
            max_retries,
        }
    }

    pub async fn roles_of(&self, user_id: &str) -> Result<BTreeSet<Role>> {
        paths::check_id(user_id)?;
        Ok(self
            .store
            .get_json::<RoleGrant>(&paths::role(user_id))
            .await?
            .map(|g| g.roles)
            .unwrap_or_default())
    }

    pub async fn has_role(&self, user_id: &str, role: Role) -> Result<bool> {
        Ok(self.roles_of(user_id).await?.contains(&role))
    }

    pub async fn require(&self, user_id: &str, role: Role) -> Result<()> {
        if self.has_role(user_id, role).await? {
            Ok(())
        } else {
            Err(TrustError::NotAuthorized(user_id.to_owned()))
        }
    }

    pub async fn grant(&self, user_id: &str, role: Role, granted_by: Option<&str>) -> Result<RoleGrant> {
        self.edit(user_id, granted_by, |roles| {
            roles.insert(role);
        })
        .await
    }

    pub async fn revoke(&self, user_id: &str, role: Role, revoked_by: Option<&str>) -> Result<RoleGrant> {
        self.edit(user_id, revoked_by, |roles| {
            roles.remove(&role);
        })
        .await
    }

    async fn edit<F>(&self, user_id: &str, by: Option<&str>, change: F) -> Result<RoleGrant>
    where
        F: Fn(&mut BTreeSet<Role>) + Send + Sync,
    {
        paths::check_id(user_id)?;
        let path = paths::role(user_id);
        for attempt in 0..self.max_retries {
            let current = self.store.get(&path).await?;
            let mut roles = match &current {
                Some(raw) => serde_json::from_value::<RoleGrant>(raw.clone())?.roles,
                None => BTreeSet::new(),
            };
            change(&mut roles);
            let grant = RoleGrant {
                user_id: user_id.to_owned(),
                roles,
                updated_at: self.clock.now(),
                granted_by: by.map(str::to_owned),
            };
            let next = serde_json::to_value(&grant)?;
            if self
                .store
                .compare_and_swap(&path, current.as_ref(), Some(next))
                .await?
            {
                info!(user_id = %user_id, roles = ?grant.roles, "roles updated");
                return Ok(grant);
            }
            debug!(user_id = %user_id, attempt, "role update raced; retrying");
        }
        Err(TrustError::Conflict(path))
    }

    pub async fn members(&self, role: Role) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_json::<RoleGrant>(paths::ROLES)
            .await?
            .into_iter()
            .filter(|(_, g)| g.has(role))
            .map(|(_, g)| g.user_id)
            .collect())
    }

    /// Public keys of every live oversight reader.
    pub async fn oversight_keys(&self) -> Result<Vec<PublicKey>> {
        let mut keys = Vec::new();
        for user_id in self.members(Role::Oversight).await? {
            if let Some(profile) = self.profiles.find(&user_id).await? {
                if let Some(pk) = profile.public_key {
                    keys.push(pk);
                }
            }
        }
        Ok(keys)
    }
}
