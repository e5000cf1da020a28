use std::collections::HashSet;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::device_trust::DeviceTrustManager;
use crate::error::Result;
use crate::messages::MessageService;
use crate::profiles::Profiles;
use crate::sentinel::AccountSentinel;
use wd_proto::paths;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub messages_removed: usize,
    pub chats_removed: usize,
    pub lockouts_released: usize,
    pub requests_expired: usize,
}

/// Periodic housekeeping: message expiry, lockout reassessment, stale
/// device requests, and leftovers of destroyed accounts.
#[derive(Clone)]
pub struct Sweeper {
    profiles: Profiles,
    sentinel: AccountSentinel,
    devices: DeviceTrustManager,
    messages: MessageService,
}

impl Sweeper {
    pub fn new(
        profiles: Profiles,
        sentinel: AccountSentinel,
        devices: DeviceTrustManager,
        messages: MessageService,
    ) -> Self {
        Self {
            profiles,
            sentinel,
            devices,
            messages,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let destroyed: HashSet<String> = self
            .profiles
            .list()
            .await?
            .into_iter()
            .filter(|p| p.is_destroyed())
            .map(|p| p.user_id)
            .collect();

        let mut chats_removed = 0;
        for user_id in &destroyed {
            chats_removed += self
                .profiles
                .store()
                .remove_prefix(&paths::chats_prefix(user_id))
                .await?;
        }

        let report = SweepReport {
            messages_removed: self.messages.sweep(&destroyed).await?,
            chats_removed,
            lockouts_released: self.sentinel.release_expired().await?,
            requests_expired: self.devices.expire_stale().await?,
        };
        debug!(?report, "sweep complete");
        Ok(report)
    }

    /// Run `run_once` every `interval` until the handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    warn!(error = %err, "sweep failed");
                }
            }
        })
    }
}
