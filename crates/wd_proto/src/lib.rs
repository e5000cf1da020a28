//! wd_proto — records owned by the Warden trust core.
//!
//! Every record here is plain serde data persisted in the remote record
//! store. State that has more than one legal shape is a tagged enum so the
//! illegal combinations (a lockout without an expiry, a hash without its
//! salt, an approved request without an approver) cannot be written.

pub mod device_request;
pub mod message;
pub mod paths;
pub mod profile;
pub mod roles;

pub use device_request::{DeviceRequest, IdentityCheck, RequestStatus};
pub use message::{Destination, EncryptedMessage};
pub use profile::{AttemptLedger, DeviceClaim, GuardState, InFlight, PasscodeState, UserSecurityProfile};
pub use roles::{Role, RoleGrant};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Invalid transition: request is already {0}")]
    AlreadyResolved(&'static str),

    #[error("Invalid record id {0:?}: ids must be non-empty and contain no '/'")]
    InvalidId(String),
}
