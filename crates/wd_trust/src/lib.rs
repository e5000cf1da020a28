//! wd_trust — trust and custody services for the Warden chat client
//!
//! # Module layout
//! - `sentinel`     — failed-attempt accounting, lockout and destruction
//! - `passcode`     — gated verification, setup/change, escrow access
//! - `key_vault`    — device-local private key custody
//! - `device_trust` — single authorized device and the request workflow
//! - `messages`     — sealing, persistence and batch decryption
//! - `roles`        — admin and oversight role table
//! - `eraser`       — irreversible account data removal
//! - `sweeper`      — periodic expiry and cleanup
//! - `notify`       — administrator alert channel
//! - `service`      — `TrustCore`, the facade over all of the above

pub mod clock;
pub mod config;
pub mod device_trust;
pub mod eraser;
pub mod error;
pub mod key_vault;
pub mod messages;
pub mod notify;
pub mod passcode;
pub mod profiles;
pub mod roles;
pub mod sentinel;
pub mod service;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LifetimeFailurePolicy, TrustConfig};
pub use device_trust::{DeviceAccess, DeviceTrustManager};
pub use eraser::{AccountEraser, ErasureReport};
pub use error::{Result, TrustError};
pub use key_vault::KeyVault;
pub use messages::{DecryptedMessage, MessageBody, MessageService, UnreadableReason};
pub use notify::{AdminAlert, AdminNotifier, ChannelNotifier, TracingNotifier};
pub use passcode::{PasscodeService, PasscodeStatus, VerifiedPasscode, VerifyOutcome};
pub use profiles::Profiles;
pub use roles::RoleTable;
pub use sentinel::{AccountSentinel, FailureOutcome, Gate, Reservation, SentinelPolicy};
pub use service::{Session, TrustCore};
pub use sweeper::{SweepReport, Sweeper};
