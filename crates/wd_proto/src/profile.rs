use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wd_crypto::{EscrowBlob, PasscodeCredential, PublicKey};

/// Passcode hash and salt travel together inside the credential; the
/// `enabled` gate is independent so disabling keeps the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PasscodeState {
    NotSet,
    Set {
        credential: PasscodeCredential,
        enabled: bool,
    },
}

impl PasscodeState {
    pub fn credential(&self) -> Option<&PasscodeCredential> {
        match self {
            PasscodeState::NotSet => None,
            PasscodeState::Set { credential, .. } => Some(credential),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, PasscodeState::Set { enabled: true, .. })
    }
}

/// The single authorized device. `Unclaimed` means first login wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceClaim {
    Unclaimed,
    Claimed {
        device_id: String,
        claimed_at: DateTime<Utc>,
    },
}

impl DeviceClaim {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceClaim::Unclaimed => None,
            DeviceClaim::Claimed { device_id, .. } => Some(device_id),
        }
    }
}

/// Sentinel state. `LockedOut` always carries its expiry; `Destroyed` is
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardState {
    Active { failed_attempts: u32 },
    LockedOut { until: DateTime<Utc> },
    Destroyed { at: DateTime<Utc> },
}

impl Default for GuardState {
    fn default() -> Self {
        GuardState::Active { failed_attempts: 0 }
    }
}

/// Verifications that passed the gate and have not reported back yet.
/// A reservation older than the sentinel's lease is treated as abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlight {
    pub count: u32,
    pub last_reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptLedger {
    pub state: GuardState,
    /// Lifetime counter; whether a success clears it is a sentinel policy.
    pub total_failed_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlight>,
}

impl AttemptLedger {
    /// Failures since the last lockout or success. Zero while locked out.
    pub fn failed_attempt_count(&self) -> u32 {
        match self.state {
            GuardState::Active { failed_attempts } => failed_attempts,
            _ => 0,
        }
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.map_or(0, |f| f.count)
    }

    pub fn lockout_until(&self) -> Option<DateTime<Utc>> {
        match self.state {
            GuardState::LockedOut { until } => Some(until),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSecurityProfile {
    pub user_id: String,
    pub username: String,
    /// `None` only after destruction.
    pub public_key: Option<PublicKey>,
    pub passcode: PasscodeState,
    /// Absent for legacy accounts that predate escrow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_private_key_backup: Option<EscrowBlob>,
    pub device: DeviceClaim,
    #[serde(default)]
    pub attempts: AttemptLedger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSecurityProfile {
    pub fn new(user_id: &str, username: &str, public_key: PublicKey, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_owned(),
            username: username.to_owned(),
            public_key: Some(public_key),
            passcode: PasscodeState::NotSet,
            encrypted_private_key_backup: None,
            device: DeviceClaim::Unclaimed,
            attempts: AttemptLedger::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn passcode_version(&self) -> Option<u32> {
        self.passcode.credential().map(|c| c.version.as_u32())
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.attempts.state, GuardState::Destroyed { .. })
    }

    pub fn authorized_device(&self) -> Option<&str> {
        self.device.device_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wd_crypto::KeyPair;

    #[test]
    fn new_profile_is_unclaimed_without_passcode() {
        let kp = KeyPair::generate();
        let p = UserSecurityProfile::new("u1", "alice", kp.public, Utc::now());
        assert_eq!(p.passcode, PasscodeState::NotSet);
        assert_eq!(p.device, DeviceClaim::Unclaimed);
        assert_eq!(p.attempts.failed_attempt_count(), 0);
        assert!(p.passcode_version().is_none());
        assert!(!p.is_destroyed());
    }

    #[test]
    fn tagged_states_round_trip_through_json() {
        let kp = KeyPair::generate();
        let now = Utc::now();
        let mut p = UserSecurityProfile::new("u1", "alice", kp.public, now);
        p.device = DeviceClaim::Claimed {
            device_id: "A".into(),
            claimed_at: now,
        };
        p.attempts.state = GuardState::LockedOut { until: now };

        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["device"]["state"], "claimed");
        assert_eq!(json["device"]["device_id"], "A");
        assert_eq!(json["attempts"]["state"]["state"], "locked_out");
        assert!(json.get("encryptedPrivateKeyBackup").is_none());

        let back: UserSecurityProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.attempts.lockout_until(), Some(now));
    }

    #[test]
    fn lockout_without_expiry_does_not_parse() {
        let bad = serde_json::json!({"state": "locked_out"});
        assert!(serde_json::from_value::<GuardState>(bad).is_err());
    }
}
