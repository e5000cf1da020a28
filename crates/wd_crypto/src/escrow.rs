//! Passcode-wrapped private key backup.
//!
//! ```text
//! salt      ← 16 random bytes (independent of the passcode credential salt)
//! wrap_key  ← Argon2id(ESCROW_CONTEXT || passcode, salt, params)
//! iv        ← 24 random bytes
//! cipherText← XChaCha20-Poly1305(wrap_key, iv, private_key, aad = ESCROW_AAD)
//! ```
//!
//! A wrong passcode yields a different wrap key, so the Poly1305 tag check
//! fails and the caller gets `WrongPasscode` instead of a garbage key.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::aead::{self, NONCE_LEN};
use crate::error::CryptoError;
use crate::kdf::{self, KdfParams};
use crate::keys::PrivateKey;
use crate::passcode::Passcode;

const ESCROW_CONTEXT: &[u8] = b"wd-escrow-wrap-v1:";
const ESCROW_AAD: &[u8] = b"wd-escrow-v1";
pub const ESCROW_VERSION: u32 = 1;

fn default_escrow_version() -> u32 {
    ESCROW_VERSION
}

/// `{cipherText, salt, iv}` as persisted on the remote profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowBlob {
    pub cipher_text: String,
    pub salt: String,
    pub iv: String,
    #[serde(default)]
    pub params: KdfParams,
    #[serde(default = "default_escrow_version")]
    pub version: u32,
}

#[derive(Debug, Clone, Default)]
pub struct KeyEscrow {
    params: KdfParams,
}

impl KeyEscrow {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn seal(&self, private_key: &PrivateKey, passcode: &Passcode) -> Result<EscrowBlob, CryptoError> {
        let salt = kdf::generate_salt();
        let wrap_key = wrap_key(passcode, &salt, &self.params)?;
        let iv = aead::generate_nonce();
        let ct = aead::encrypt(&wrap_key, &iv, private_key.as_bytes(), ESCROW_AAD)?;
        Ok(EscrowBlob {
            cipher_text: STANDARD.encode(ct),
            salt: STANDARD.encode(salt),
            iv: STANDARD.encode(iv),
            params: self.params,
            version: ESCROW_VERSION,
        })
    }

    /// Unwrap with the blob's own parameters. Tag mismatch → `WrongPasscode`.
    pub fn open(&self, blob: &EscrowBlob, passcode: &Passcode) -> Result<PrivateKey, CryptoError> {
        if blob.version != ESCROW_VERSION {
            return Err(CryptoError::MalformedEscrow(format!(
                "unsupported escrow version {}",
                blob.version
            )));
        }
        blob.params.check_bounds().map_err(CryptoError::MalformedEscrow)?;
        let salt = STANDARD
            .decode(&blob.salt)
            .map_err(|e| CryptoError::MalformedEscrow(format!("salt: {e}")))?;
        let iv: [u8; NONCE_LEN] = STANDARD
            .decode(&blob.iv)
            .map_err(|e| CryptoError::MalformedEscrow(format!("iv: {e}")))?
            .try_into()
            .map_err(|_| CryptoError::MalformedEscrow("iv must be 24 bytes".into()))?;
        let ct = STANDARD
            .decode(&blob.cipher_text)
            .map_err(|e| CryptoError::MalformedEscrow(format!("cipherText: {e}")))?;

        let wrap_key = wrap_key(passcode, &salt, &blob.params)?;
        let plaintext = aead::decrypt(&wrap_key, &iv, &ct, ESCROW_AAD)
            .map_err(|_| CryptoError::WrongPasscode)?;
        PrivateKey::from_bytes(&plaintext)
    }
}

fn wrap_key(
    passcode: &Passcode,
    salt: &[u8],
    params: &KdfParams,
) -> Result<zeroize::Zeroizing<[u8; kdf::DERIVED_KEY_LEN]>, CryptoError> {
    let mut input = zeroize::Zeroizing::new(Vec::with_capacity(ESCROW_CONTEXT.len() + 6));
    input.extend_from_slice(ESCROW_CONTEXT);
    input.extend_from_slice(passcode.as_bytes());
    kdf::argon2id(&input, salt, params)
}

/// Seal with the interactive KDF profile.
pub fn encrypt_private_key_with_passcode(
    private_key: &PrivateKey,
    passcode: &Passcode,
) -> Result<EscrowBlob, CryptoError> {
    KeyEscrow::default().seal(private_key, passcode)
}

pub fn decrypt_private_key_with_passcode(
    blob: &EscrowBlob,
    passcode: &Passcode,
) -> Result<PrivateKey, CryptoError> {
    KeyEscrow::default().open(blob, passcode)
}
