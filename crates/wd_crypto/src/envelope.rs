//! Hybrid per-message encryption.
//!
//! Every reader gets an independent branch with its own fresh content key:
//!
//! ```text
//! content_key ← 32 random bytes
//! iv          ← 24 random bytes
//! encryptedText ← XChaCha20-Poly1305(content_key, iv, plaintext, aad = BODY_AAD || key_id)
//!
//! eph         ← X25519.generate()
//! shared      ← ECDH(eph, reader_pub)
//! wrap_key    ← HKDF-SHA256(shared, salt = eph_pub, info = WRAP_INFO || reader_pub)
//! encryptedKey← eph_pub || wrap_nonce || XChaCha20-Poly1305(wrap_key, wrap_nonce, content_key)
//! ```
//!
//! The recipient branch sits at the top level of the wire record
//! (`encryptedText`, `encryptedKey`, `iv`); oversight branches follow in
//! `oversight`. A reader only ever opens the branch whose `keyId` matches
//! its own public key.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use crate::aead::{self, KEY_LEN, NONCE_LEN};
use crate::error::CryptoError;
use crate::kdf;
use crate::keys::{PrivateKey, PublicKey};

const BODY_AAD: &[u8] = b"wd-message-body-v1:";
const WRAP_INFO: &[u8] = b"wd-content-key-wrap-v1";
const WRAP_AAD: &[u8] = b"wd-content-key-v1";
const EPH_LEN: usize = 32;

/// One reader's copy of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CipherBranch {
    pub key_id: String,
    pub encrypted_text: String,
    pub encrypted_key: String,
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedMessage {
    #[serde(flatten)]
    pub recipient: CipherBranch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oversight: Vec<CipherBranch>,
}

impl SealedMessage {
    /// Branch addressed to `key_id`, recipient first.
    pub fn branch_for(&self, key_id: &str) -> Option<&CipherBranch> {
        std::iter::once(&self.recipient)
            .chain(self.oversight.iter())
            .find(|b| b.key_id == key_id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCipher;

impl MessageCipher {
    /// Seal `plaintext` for `recipient` plus one branch per oversight key.
    /// An oversight key equal to the recipient's is skipped.
    pub fn seal(
        &self,
        plaintext: &str,
        recipient: &PublicKey,
        oversight: &[PublicKey],
    ) -> Result<SealedMessage, CryptoError> {
        let recipient_branch = seal_branch(plaintext.as_bytes(), recipient)?;
        let mut branches = Vec::with_capacity(oversight.len());
        for reader in oversight {
            if reader == recipient || branches.iter().any(|b: &CipherBranch| b.key_id == reader.key_id()) {
                continue;
            }
            branches.push(seal_branch(plaintext.as_bytes(), reader)?);
        }
        Ok(SealedMessage {
            recipient: recipient_branch,
            oversight: branches,
        })
    }

    /// Open the branch addressed to `private_key`'s public half.
    pub fn open(
        &self,
        sealed: &SealedMessage,
        private_key: &PrivateKey,
    ) -> Result<Zeroizing<String>, CryptoError> {
        let key_id = private_key.public_key().key_id();
        let branch = sealed
            .branch_for(&key_id)
            .ok_or(CryptoError::NoBranchForKey(key_id))?;
        open_branch(branch, private_key)
    }
}

/// `encryptMessage(plaintext, recipientPublicKey, adminPublicKey?)`.
pub fn encrypt_message(
    plaintext: &str,
    recipient: &PublicKey,
    admin: Option<&PublicKey>,
) -> Result<SealedMessage, CryptoError> {
    let oversight: Vec<PublicKey> = admin.into_iter().copied().collect();
    MessageCipher.seal(plaintext, recipient, &oversight)
}

/// `decryptMessage(fields, privateKey)`.
pub fn decrypt_message(
    sealed: &SealedMessage,
    private_key: &PrivateKey,
) -> Result<Zeroizing<String>, CryptoError> {
    MessageCipher.open(sealed, private_key)
}

fn body_aad(key_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(BODY_AAD.len() + key_id.len());
    aad.extend_from_slice(BODY_AAD);
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

fn derive_wrap_key(
    shared: &[u8],
    eph_pub: &[u8; EPH_LEN],
    reader: &[u8; 32],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut info = Vec::with_capacity(WRAP_INFO.len() + reader.len());
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(reader);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    kdf::hkdf_expand(shared, Some(eph_pub), &info, &mut key[..])?;
    Ok(key)
}

fn seal_branch(plaintext: &[u8], reader: &PublicKey) -> Result<CipherBranch, CryptoError> {
    let key_id = reader.key_id();

    let content_key = aead::generate_key();
    let iv = aead::generate_nonce();
    let encrypted_text = aead::encrypt(&content_key, &iv, plaintext, &body_aad(&key_id))?;

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph).to_bytes();
    let shared = eph.diffie_hellman(&reader.to_x25519());
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("recipient key is a low-order point".into()));
    }
    let wrap_key = derive_wrap_key(shared.as_bytes(), &eph_pub, reader.as_bytes())?;
    let wrap_nonce = aead::generate_nonce();
    let wrapped = aead::encrypt(&wrap_key, &wrap_nonce, &content_key[..], WRAP_AAD)?;

    let mut encrypted_key = Vec::with_capacity(EPH_LEN + NONCE_LEN + wrapped.len());
    encrypted_key.extend_from_slice(&eph_pub);
    encrypted_key.extend_from_slice(&wrap_nonce);
    encrypted_key.extend_from_slice(&wrapped);

    Ok(CipherBranch {
        key_id,
        encrypted_text: STANDARD.encode(encrypted_text),
        encrypted_key: STANDARD.encode(encrypted_key),
        iv: STANDARD.encode(iv),
    })
}

fn open_branch(branch: &CipherBranch, private_key: &PrivateKey) -> Result<Zeroizing<String>, CryptoError> {
    let malformed = |what: &str| CryptoError::DecryptionFailed(format!("malformed {what}"));

    let encrypted_key = STANDARD
        .decode(&branch.encrypted_key)
        .map_err(|_| malformed("encryptedKey"))?;
    if encrypted_key.len() <= EPH_LEN + NONCE_LEN {
        return Err(malformed("encryptedKey"));
    }
    let (eph_pub, rest) = encrypted_key.split_at(EPH_LEN);
    let (wrap_nonce, wrapped) = rest.split_at(NONCE_LEN);
    let eph_pub: [u8; EPH_LEN] = eph_pub.try_into().map_err(|_| malformed("encryptedKey"))?;
    let wrap_nonce: [u8; NONCE_LEN] = wrap_nonce.try_into().map_err(|_| malformed("encryptedKey"))?;

    let iv: [u8; NONCE_LEN] = STANDARD
        .decode(&branch.iv)
        .map_err(|_| malformed("iv"))?
        .try_into()
        .map_err(|_| malformed("iv"))?;
    let encrypted_text = STANDARD
        .decode(&branch.encrypted_text)
        .map_err(|_| malformed("encryptedText"))?;

    let reader = private_key.public_key();
    let shared = private_key
        .to_x25519()
        .diffie_hellman(&X25519Public::from(eph_pub));
    if !shared.was_contributory() {
        return Err(malformed("ephemeral key"));
    }
    let wrap_key = derive_wrap_key(shared.as_bytes(), &eph_pub, reader.as_bytes())?;
    let content_key = aead::decrypt(&wrap_key, &wrap_nonce, wrapped, WRAP_AAD)
        .map_err(|_| CryptoError::DecryptionFailed("content key authentication failed".into()))?;
    let content_key: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(
        content_key[..]
            .try_into()
            .map_err(|_| malformed("content key"))?,
    );

    let body = aead::decrypt(&content_key, &iv, &encrypted_text, &body_aad(&branch.key_id))
        .map_err(|_| CryptoError::DecryptionFailed("body authentication failed".into()))?;
    let text = std::str::from_utf8(&body).map_err(|_| malformed("body encoding"))?;
    Ok(Zeroizing::new(text.to_owned()))
}
