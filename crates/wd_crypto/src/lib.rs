//! wd_crypto — Warden trust core cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs take validated newtypes (`Passcode`, `PublicKey`,
//!   `PrivateKey`) so raw strings and byte slices never cross a seam.
//!
//! # Module layout
//! - `passcode` — Argon2id passcode credentials, versioned for migration
//! - `keys`     — X25519 account key pairs + BLAKE3 fingerprints
//! - `escrow`   — passcode-wrapped private key backups
//! - `envelope` — hybrid per-message encryption with oversight branches
//! - `aead`     — XChaCha20-Poly1305 helpers
//! - `kdf`      — Argon2id / HKDF key derivation
//! - `error`    — unified error type

pub mod aead;
pub mod envelope;
pub mod error;
pub mod escrow;
pub mod kdf;
pub mod keys;
pub mod passcode;

pub use envelope::{decrypt_message, encrypt_message, CipherBranch, MessageCipher, SealedMessage};
pub use error::CryptoError;
pub use escrow::{
    decrypt_private_key_with_passcode, encrypt_private_key_with_passcode, EscrowBlob, KeyEscrow,
};
pub use kdf::KdfParams;
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use passcode::{Passcode, PasscodeAuthenticator, PasscodeCredential, PasscodeVersion};
