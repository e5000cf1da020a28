//! wd_store — storage seams for the Warden trust core
//!
//! Two capabilities, both behind traits so the core never assumes a
//! particular backend:
//!
//! - [`RecordStore`]: the remote, path-addressed document store shared by
//!   every device of every account. Supports conditional writes (whole
//!   record or single field) and prefix-scoped change subscriptions.
//! - [`SecureLocalVault`]: the device-scoped secret store holding private
//!   keys. Backed by the OS keyring in production.

pub mod error;
pub mod file;
pub mod memory;
pub mod record;
pub mod secret;

pub use error::StoreError;
pub use file::JsonFileRecordStore;
pub use memory::MemoryRecordStore;
pub use record::{RecordEvent, RecordStore, RecordStoreExt, Watch};
pub use secret::{KeyringVault, MemoryVault, SecureLocalVault};
