use chrono::{DateTime, Utc};
use thiserror::Error;
use wd_crypto::CryptoError;
use wd_proto::ProtoError;
use wd_store::StoreError;

/// Every user-facing failure has its own variant; callers match on them to
/// pick the recovery path (retry, wait, request access, restore keys).
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Wrong passcode ({remaining_attempts} attempts remaining)")]
    WrongPasscode { remaining_attempts: u32 },

    #[error("Account locked until {until}")]
    LockedOut { until: DateTime<Utc> },

    #[error("Account has been destroyed")]
    AccountDestroyed,

    #[error("No private key available on this device")]
    KeyMaterialMissing,

    #[error("Message could not be decrypted: {0}")]
    DecryptionFailed(String),

    /// `request_id` names the pending access request when one was filed.
    #[error("Device is not authorized for this account")]
    DeviceUnauthorized { request_id: Option<String> },

    #[error("Passcode must be exactly 6 digits")]
    InvalidPasscode,

    /// Every remaining attempt is already being checked; retry shortly.
    #[error("Other passcode attempts are in progress; try again")]
    AttemptsInFlight,

    #[error("This account requires a passcode to unlock")]
    PasscodeRequired,

    #[error("No passcode has been set for this account")]
    PasscodeNotSet,

    #[error("A passcode is already set; use change_passcode")]
    PasscodeAlreadySet,

    #[error("Account not found: {0}")]
    ProfileNotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Device request not found: {0}")]
    RequestNotFound(String),

    #[error("Device request is already {0}")]
    RequestAlreadyResolved(&'static str),

    #[error("{0} is not permitted to perform this action")]
    NotAuthorized(String),

    #[error("Invalid identifier {0:?}")]
    InvalidId(String),

    #[error("Concurrent update to {0} did not settle")]
    Conflict(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl From<ProtoError> for TrustError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::AlreadyResolved(status) => TrustError::RequestAlreadyResolved(status),
            ProtoError::InvalidId(id) => TrustError::InvalidId(id),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrustError>;
