//! One authorized device per account.
//!
//! The claim lives in the profile's `device` field and only ever changes
//! through a field-level conditional swap, so two devices racing for an
//! unclaimed account cannot both win and an approval never clobbers a
//! concurrent counter update. Requests are independent records; each
//! reaches exactly one terminal state through a whole-record swap. The open
//! request of each (account, device) pair is named by a slot record created
//! with a conditional write, so concurrent logins from one device share it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use wd_proto::{paths, DeviceClaim, DeviceRequest, IdentityCheck, RequestStatus, Role};
use wd_store::{RecordEvent, RecordStore};

use crate::clock::Clock;
use crate::error::{Result, TrustError};
use crate::notify::{AdminAlert, AdminNotifier};
use crate::profiles::Profiles;
use crate::roles::RoleTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAccess {
    /// `claimed` is true when this login claimed an unclaimed account.
    Granted { claimed: bool },
    Blocked { request: DeviceRequest },
}

#[derive(Clone)]
pub struct DeviceTrustManager {
    profiles: Profiles,
    roles: RoleTable,
    notifier: Arc<dyn AdminNotifier>,
    clock: Arc<dyn Clock>,
    request_ttl: Option<Duration>,
    max_retries: u32,
}

impl DeviceTrustManager {
    pub fn new(
        profiles: Profiles,
        roles: RoleTable,
        notifier: Arc<dyn AdminNotifier>,
        clock: Arc<dyn Clock>,
        request_ttl: Option<Duration>,
        max_retries: u32,
    ) -> Self {
        Self {
            profiles,
            roles,
            notifier,
            clock,
            request_ttl,
            max_retries,
        }
    }

    fn store(&self) -> &Arc<dyn RecordStore> {
        self.profiles.store()
    }

    /// Compare the presenting device with the account's authorized one.
    /// An unclaimed account is claimed by the first device to get here; a
    /// mismatch files (or reuses) a pending request.
    pub async fn check_device(&self, user_id: &str, device_id: &str) -> Result<DeviceAccess> {
        paths::check_id(device_id)?;
        for _ in 0..self.max_retries {
            let profile = self.profiles.get(user_id).await?;
            if profile.is_destroyed() {
                return Err(TrustError::AccountDestroyed);
            }
            match &profile.device {
                DeviceClaim::Claimed { device_id: authorized, .. } if authorized == device_id => {
                    return Ok(DeviceAccess::Granted { claimed: false });
                }
                DeviceClaim::Claimed { device_id: authorized, .. } => {
                    warn!(user_id = %user_id, device_id = %device_id, authorized = %authorized, "login from unauthorized device");
                    let request = self.request_device_access(user_id, device_id).await?;
                    return Ok(DeviceAccess::Blocked { request });
                }
                DeviceClaim::Unclaimed => {
                    let claim = DeviceClaim::Claimed {
                        device_id: device_id.to_owned(),
                        claimed_at: self.clock.now(),
                    };
                    if self.profiles.swap_device(user_id, &DeviceClaim::Unclaimed, &claim).await? {
                        info!(user_id = %user_id, device_id = %device_id, "device claimed account");
                        return Ok(DeviceAccess::Granted { claimed: true });
                    }
                    debug!(user_id = %user_id, "lost claim race; re-reading");
                }
            }
        }
        Err(TrustError::Conflict(paths::profile(user_id)))
    }

    /// `requestDeviceAccess(accountId, newDeviceId)`. A live pending request
    /// from the same device is returned instead of filing a duplicate.
    pub async fn request_device_access(&self, user_id: &str, new_device_id: &str) -> Result<DeviceRequest> {
        paths::check_id(new_device_id)?;
        let profile = self.profiles.get(user_id).await?;
        if profile.is_destroyed() {
            return Err(TrustError::AccountDestroyed);
        }
        let slot = paths::pending_device(user_id, new_device_id);
        for _ in 0..self.max_retries {
            let now = self.clock.now();
            if let Some(held) = self.store().get(&slot).await? {
                if let Some(existing) = self.live_request(&held, now).await? {
                    debug!(request_id = %existing.request_id, "reusing pending device request");
                    return Ok(existing);
                }
                // The slot outlived its request.
                self.store().compare_and_swap(&slot, Some(&held), None).await?;
                continue;
            }

            let request = DeviceRequest::new(user_id, &profile.username, new_device_id, now);
            let path = paths::device_request(&request.request_id);
            if !self
                .store()
                .compare_and_swap(&path, None, Some(serde_json::to_value(&request)?))
                .await?
            {
                return Err(TrustError::Conflict(path));
            }
            let held = Value::String(request.request_id.clone());
            if !self.store().compare_and_swap(&slot, None, Some(held)).await? {
                debug!(user_id = %user_id, new_device_id = %new_device_id, "another login filed first; dropping duplicate");
                self.store().remove(&path).await?;
                continue;
            }

            info!(request_id = %request.request_id, user_id = %user_id, new_device_id = %new_device_id, "device access requested");
            self.notifier
                .notify(AdminAlert::DeviceAccessRequested {
                    request_id: request.request_id.clone(),
                    user_id: user_id.to_owned(),
                    username: request.username.clone(),
                    new_device_id: new_device_id.to_owned(),
                })
                .await;
            return Ok(request);
        }
        Err(TrustError::Conflict(slot))
    }

    /// The request a slot points at, if it is still pending and fresh.
    async fn live_request(&self, held: &Value, now: DateTime<Utc>) -> Result<Option<DeviceRequest>> {
        let Some(request_id) = held.as_str() else {
            return Ok(None);
        };
        let Some(raw) = self.store().get(&paths::device_request(request_id)).await? else {
            return Ok(None);
        };
        let request: DeviceRequest = serde_json::from_value(raw)?;
        Ok((request.is_pending() && !self.is_stale(&request, now)).then_some(request))
    }

    /// Free the (account, device) slot once its request is decided.
    async fn clear_slot(&self, request: &DeviceRequest) -> Result<()> {
        let slot = paths::pending_device(&request.user_id, &request.new_device_id);
        let held = Value::String(request.request_id.clone());
        self.store().compare_and_swap(&slot, Some(&held), None).await?;
        Ok(())
    }

    async fn load_request(&self, request_id: &str) -> Result<(Value, DeviceRequest)> {
        paths::check_id(request_id)?;
        let raw = self
            .store()
            .get(&paths::device_request(request_id))
            .await?
            .ok_or_else(|| TrustError::RequestNotFound(request_id.to_owned()))?;
        let request = serde_json::from_value(raw.clone())?;
        Ok((raw, request))
    }

    pub async fn get_request(&self, request_id: &str) -> Result<DeviceRequest> {
        Ok(self.load_request(request_id).await?.1)
    }

    fn is_stale(&self, request: &DeviceRequest, now: DateTime<Utc>) -> bool {
        self.request_ttl
            .is_some_and(|ttl| request.is_pending() && request.requested_at + ttl <= now)
    }

    /// Apply `transition` to the request with compare-and-swap. A pending
    /// request past its TTL is expired instead and reported as such.
    async fn resolve<F>(&self, request_id: &str, transition: F) -> Result<DeviceRequest>
    where
        F: Fn(&mut DeviceRequest) -> Result<()> + Send + Sync,
    {
        let path = paths::device_request(request_id);
        for _ in 0..self.max_retries {
            let (raw, mut request) = self.load_request(request_id).await?;
            let now = self.clock.now();
            let expired = self.is_stale(&request, now);
            if expired {
                request.expire(now)?;
            } else {
                transition(&mut request)?;
            }
            if self
                .store()
                .compare_and_swap(&path, Some(&raw), Some(serde_json::to_value(&request)?))
                .await?
            {
                if !request.is_pending() {
                    self.clear_slot(&request).await?;
                }
                if expired {
                    info!(request_id = %request_id, "device request expired before decision");
                    return Err(TrustError::RequestAlreadyResolved(request.status.label()));
                }
                return Ok(request);
            }
        }
        Err(TrustError::Conflict(path))
    }

    /// `approveDevice(requestId)`: the request becomes approved, then the
    /// profile's device claim moves to the requesting device. Approving an
    /// already approved request finishes the move if it never landed, so a
    /// failed reassignment is repaired by retrying the approval.
    pub async fn approve(&self, request_id: &str, admin_id: &str) -> Result<DeviceRequest> {
        self.roles.require(admin_id, Role::Admin).await?;
        let current = self.get_request(request_id).await?;
        let profile = self.profiles.get(&current.user_id).await?;
        if profile.is_destroyed() {
            return Err(TrustError::AccountDestroyed);
        }
        let approved_at = match current.status {
            RequestStatus::Approved { decided_at, .. } => Some(decided_at),
            _ => None,
        };
        let request = match approved_at {
            Some(decided_at) => {
                // A claim made after this decision belongs to a later one.
                let superseded = matches!(
                    &profile.device,
                    DeviceClaim::Claimed { device_id, claimed_at }
                        if *device_id != current.new_device_id && *claimed_at > decided_at
                );
                if superseded {
                    return Err(TrustError::RequestAlreadyResolved(current.status.label()));
                }
                if profile.device.device_id() != Some(current.new_device_id.as_str()) {
                    warn!(request_id = %request_id, "completing approval whose device move did not land");
                }
                current
            }
            None => {
                self.resolve(request_id, |r| Ok(r.approve(admin_id, self.clock.now())?))
                    .await?
            }
        };
        self.reassign(&request.user_id, &request.new_device_id).await?;
        info!(request_id = %request_id, user_id = %request.user_id, new_device_id = %request.new_device_id, admin = %admin_id, "device request approved");
        Ok(request)
    }

    /// `denyDevice(requestId)`. The device stays blocked; its next login
    /// files a fresh request.
    pub async fn deny(&self, request_id: &str, admin_id: &str, reason: Option<String>) -> Result<DeviceRequest> {
        self.roles.require(admin_id, Role::Admin).await?;
        let request = self
            .resolve(request_id, |r| Ok(r.deny(admin_id, reason.clone(), self.clock.now())?))
            .await?;
        info!(request_id = %request_id, user_id = %request.user_id, admin = %admin_id, "device request denied");
        Ok(request)
    }

    async fn reassign(&self, user_id: &str, device_id: &str) -> Result<()> {
        for _ in 0..self.max_retries {
            let current = self.profiles.get(user_id).await?.device;
            if current.device_id() == Some(device_id) {
                return Ok(());
            }
            let next = DeviceClaim::Claimed {
                device_id: device_id.to_owned(),
                claimed_at: self.clock.now(),
            };
            if self.profiles.swap_device(user_id, &current, &next).await? {
                return Ok(());
            }
        }
        Err(TrustError::Conflict(paths::profile(user_id)))
    }

    /// Pending requests still inside their TTL, oldest first.
    pub async fn pending_requests(&self) -> Result<Vec<DeviceRequest>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for (path, raw) in self.store().list(paths::DEVICE_REQUESTS).await? {
            match serde_json::from_value::<DeviceRequest>(raw) {
                Ok(r) if r.is_pending() && !self.is_stale(&r, now) => out.push(r),
                Ok(_) => {}
                Err(err) => warn!(path = %path, error = %err, "skipping malformed device request"),
            }
        }
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(out)
    }

    /// Persist `Expired` for pending requests older than the TTL.
    pub async fn expire_stale(&self) -> Result<usize> {
        if self.request_ttl.is_none() {
            return Ok(0);
        }
        let now = self.clock.now();
        let mut expired = 0;
        for (path, raw) in self.store().list(paths::DEVICE_REQUESTS).await? {
            let Ok(mut request) = serde_json::from_value::<DeviceRequest>(raw.clone()) else {
                continue;
            };
            if !self.is_stale(&request, now) {
                continue;
            }
            request.expire(now)?;
            if self
                .store()
                .compare_and_swap(&path, Some(&raw), Some(serde_json::to_value(&request)?))
                .await?
            {
                info!(request_id = %request.request_id, "device request expired");
                self.clear_slot(&request).await?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Wait until the request leaves `Pending`. Subscribes before reading so
    /// a decision landing in between is not missed.
    pub async fn await_decision(&self, request_id: &str) -> Result<DeviceRequest> {
        paths::check_id(request_id)?;
        let path = paths::device_request(request_id);
        let mut watch = self.store().watch(&path);
        let current = self.get_request(request_id).await?;
        if !current.is_pending() {
            return Ok(current);
        }
        while let Some(event) = watch.next().await {
            if event.path() != path {
                continue;
            }
            match event {
                RecordEvent::Set { value, .. } => {
                    let request: DeviceRequest = serde_json::from_value(value)?;
                    if !request.is_pending() {
                        return Ok(request);
                    }
                }
                RecordEvent::Removed { .. } => {
                    return Err(TrustError::RequestNotFound(request_id.to_owned()));
                }
            }
        }
        Err(TrustError::RequestNotFound(request_id.to_owned()))
    }

    /// Record the outcome of the blocked device's passcode cross-check.
    pub async fn record_identity_check(&self, request_id: &str, verified: bool) -> Result<IdentityCheck> {
        let request = self
            .resolve(request_id, |r| Ok(r.record_identity_check(verified, self.clock.now())?))
            .await?;
        self.notifier
            .notify(AdminAlert::IdentityAttested {
                request_id: request.request_id.clone(),
                user_id: request.user_id.clone(),
                verified,
            })
            .await;
        Ok(request.identity_check)
    }
}
