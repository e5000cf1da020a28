//! Account key pairs.
//!
//! Each account owns one long-term X25519 key pair. The public half is
//! published on the account profile; the private half lives only in the
//! device-scoped secret store (and, wrapped, in the escrow backup).

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;

fn to_32(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("{what} must be {KEY_LEN} bytes, got {}", bytes.len()))
    })
}

// ── Public key ────────────────────────────────────────────────────────────────

/// X25519 public key, base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(to_32(bytes, "public key")?))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&STANDARD.decode(s)?)
    }

    /// Stable identifier used to address ciphertext branches: hex of the
    /// first 16 bytes of BLAKE3(public key).
    pub fn key_id(&self) -> String {
        hex::encode(&blake3::hash(&self.0).as_bytes()[..16])
    }

    /// Human-readable fingerprint: BLAKE3 truncated to 20 bytes, hex in
    /// groups of 4. Shown to administrators when approving devices.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn to_x25519(self) -> X25519Public {
        X25519Public::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.key_id())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptoError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_b64(&s)
    }
}

impl From<PublicKey> for String {
    fn from(k: PublicKey) -> String {
        k.to_b64()
    }
}

// ── Private key ───────────────────────────────────────────────────────────────

/// X25519 static secret. Drop clears memory via ZeroizeOnDrop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(to_32(bytes, "private key")?))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_b64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0))
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(STANDARD.decode(s)?);
        Self::from_bytes(&bytes)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.to_x25519()).to_bytes())
    }

    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

// ── Key pair ──────────────────────────────────────────────────────────────────

pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self {
            public,
            private: PrivateKey(secret.to_bytes()),
        }
    }

    pub fn from_private(private: PrivateKey) -> Self {
        Self {
            public: private.public_key(),
            private,
        }
    }
}
