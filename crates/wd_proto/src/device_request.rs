use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtoError;

/// `Pending` moves to exactly one terminal state and never back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved {
        decided_at: DateTime<Utc>,
        decided_by: String,
    },
    Denied {
        decided_at: DateTime<Utc>,
        decided_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Expired {
        expired_at: DateTime<Utc>,
    },
}

impl RequestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved { .. } => "approved",
            RequestStatus::Denied { .. } => "denied",
            RequestStatus::Expired { .. } => "expired",
        }
    }
}

/// Outcome of the blocked device proving it knows the account passcode.
/// Only the verdict is stored, never the submitted code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IdentityCheck {
    #[default]
    NotSubmitted,
    Verified {
        at: DateTime<Utc>,
    },
    Rejected {
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub request_id: String,
    pub user_id: String,
    pub username: String,
    pub new_device_id: String,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    #[serde(default)]
    pub identity_check: IdentityCheck,
}

impl DeviceRequest {
    pub fn new(user_id: &str, username: &str, new_device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            username: username.to_owned(),
            new_device_id: new_device_id.to_owned(),
            requested_at: now,
            status: RequestStatus::Pending,
            identity_check: IdentityCheck::NotSubmitted,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, RequestStatus::Pending)
    }

    fn ensure_pending(&self) -> Result<(), ProtoError> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(ProtoError::AlreadyResolved(self.status.label()))
        }
    }

    pub fn approve(&mut self, by: &str, now: DateTime<Utc>) -> Result<(), ProtoError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Approved {
            decided_at: now,
            decided_by: by.to_owned(),
        };
        Ok(())
    }

    pub fn deny(&mut self, by: &str, reason: Option<String>, now: DateTime<Utc>) -> Result<(), ProtoError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Denied {
            decided_at: now,
            decided_by: by.to_owned(),
            reason,
        };
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), ProtoError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Expired { expired_at: now };
        Ok(())
    }

    pub fn record_identity_check(&mut self, verified: bool, now: DateTime<Utc>) -> Result<(), ProtoError> {
        self.ensure_pending()?;
        self.identity_check = if verified {
            IdentityCheck::Verified { at: now }
        } else {
            IdentityCheck::Rejected { at: now }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_reaches_exactly_one_terminal_state() {
        let now = Utc::now();
        let mut req = DeviceRequest::new("u1", "alice", "B", now);
        req.approve("admin", now).unwrap();
        assert_eq!(req.status.label(), "approved");

        assert_eq!(
            req.deny("admin", None, now),
            Err(ProtoError::AlreadyResolved("approved"))
        );
        assert_eq!(req.expire(now), Err(ProtoError::AlreadyResolved("approved")));
        assert_eq!(req.approve("other", now), Err(ProtoError::AlreadyResolved("approved")));
        assert_eq!(req.status.label(), "approved");
    }

    #[test]
    fn denied_is_terminal() {
        let now = Utc::now();
        let mut req = DeviceRequest::new("u1", "alice", "B", now);
        req.deny("admin", Some("unknown device".into()), now).unwrap();
        assert!(req.approve("admin", now).is_err());
        assert!(req.record_identity_check(true, now).is_err());
    }

    #[test]
    fn status_serializes_with_tag() {
        let now = Utc::now();
        let mut req = DeviceRequest::new("u1", "alice", "B", now);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["status"]["status"], "pending");
        assert_eq!(json["newDeviceId"], "B");
        assert_eq!(json["identityCheck"]["result"], "not_submitted");

        req.record_identity_check(true, now).unwrap();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["identityCheck"]["result"], "verified");
        assert!(!json.to_string().contains("passcode"));
    }
}
