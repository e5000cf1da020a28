//! Out-of-band administrator notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminAlert {
    AccountLockedOut {
        user_id: String,
        until: DateTime<Utc>,
        total_failed_attempts: u32,
    },
    AccountDestroyed {
        user_id: String,
        at: DateTime<Utc>,
    },
    DeviceAccessRequested {
        request_id: String,
        user_id: String,
        username: String,
        new_device_id: String,
    },
    IdentityAttested {
        request_id: String,
        user_id: String,
        verified: bool,
    },
}

/// Delivery is best effort: a failed notification never undoes the
/// security transition that triggered it.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, alert: AdminAlert);
}

/// Writes alerts to the log. Default when no channel is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl AdminNotifier for TracingNotifier {
    async fn notify(&self, alert: AdminAlert) {
        match &alert {
            AdminAlert::AccountLockedOut { user_id, until, total_failed_attempts } => {
                warn!(user_id = %user_id, until = %until, total_failed_attempts, "admin alert: account locked out")
            }
            AdminAlert::AccountDestroyed { user_id, at } => {
                error!(user_id = %user_id, at = %at, "admin alert: account destroyed")
            }
            AdminAlert::DeviceAccessRequested { request_id, user_id, new_device_id, .. } => {
                info!(request_id = %request_id, user_id = %user_id, new_device_id = %new_device_id, "admin alert: device access requested")
            }
            AdminAlert::IdentityAttested { request_id, user_id, verified } => {
                info!(request_id = %request_id, user_id = %user_id, verified, "admin alert: identity attested")
            }
        }
    }
}

/// Forwards alerts into an mpsc channel for an external delivery task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<AdminAlert>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AdminAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AdminNotifier for ChannelNotifier {
    async fn notify(&self, alert: AdminAlert) {
        if self.tx.send(alert).is_err() {
            warn!("admin alert dropped: receiver closed");
        }
    }
}
