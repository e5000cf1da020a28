//! Passcode credentials.
//!
//! A passcode is exactly six ASCII digits. It is never stored; the profile
//! keeps a `PasscodeCredential` holding an Argon2id digest, its salt, the
//! cost parameters that produced it and a scheme version. The version is
//! pinned per credential so a future scheme can be rolled out while old
//! credentials still verify (`needs_rehash` tells the caller when to
//! upgrade after a successful verification).

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::{self, KdfParams, DERIVED_KEY_LEN};

pub const PASSCODE_LEN: usize = 6;

/// Domain separator mixed into the authentication digest so that the
/// digest can never coincide with an escrow wrapping key.
const AUTH_CONTEXT: &[u8] = b"wd-passcode-auth-v1:";

/// A syntactically valid passcode. Zeroized on drop; `Debug` is redacted.
#[derive(Clone)]
pub struct Passcode(Zeroizing<String>);

impl Passcode {
    pub fn parse(code: &str) -> Result<Self, CryptoError> {
        if code.len() != PASSCODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CryptoError::InvalidPasscode(PASSCODE_LEN));
        }
        Ok(Self(Zeroizing::new(code.to_owned())))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Passcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passcode(******)")
    }
}

/// Hashing scheme version, stored as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PasscodeVersion {
    /// Argon2id v0x13 over `AUTH_CONTEXT || code`, 32-byte output.
    V1,
}

impl PasscodeVersion {
    pub const CURRENT: PasscodeVersion = PasscodeVersion::V1;

    pub fn as_u32(self) -> u32 {
        match self {
            PasscodeVersion::V1 => 1,
        }
    }
}

impl TryFrom<u32> for PasscodeVersion {
    type Error = CryptoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PasscodeVersion::V1),
            other => Err(CryptoError::UnsupportedPasscodeVersion(other)),
        }
    }
}

impl From<PasscodeVersion> for u32 {
    fn from(v: PasscodeVersion) -> u32 {
        v.as_u32()
    }
}

/// Digest + salt, always together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasscodeCredential {
    pub version: PasscodeVersion,
    /// Hex-encoded 32-byte digest.
    pub hash: String,
    /// Hex-encoded salt.
    pub salt: String,
    #[serde(default)]
    pub params: KdfParams,
}

/// Pure hashing/verification. Holds only the cost parameters applied to
/// newly enrolled credentials.
#[derive(Debug, Clone)]
pub struct PasscodeAuthenticator {
    params: KdfParams,
}

impl Default for PasscodeAuthenticator {
    fn default() -> Self {
        Self::new(KdfParams::interactive())
    }
}

impl PasscodeAuthenticator {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    pub fn generate_salt() -> [u8; kdf::SALT_LEN] {
        kdf::generate_salt()
    }

    /// Compute the digest of `code` under `salt` with this authenticator's
    /// parameters.
    pub fn hash(
        &self,
        code: &Passcode,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
        digest_v1(code, salt, &self.params)
    }

    /// Hash `code` under a fresh salt.
    pub fn enroll(&self, code: &Passcode) -> Result<PasscodeCredential, CryptoError> {
        let salt = Self::generate_salt();
        let digest = self.hash(code, &salt)?;
        Ok(PasscodeCredential {
            version: PasscodeVersion::CURRENT,
            hash: hex::encode(&digest[..]),
            salt: hex::encode(salt),
            params: self.params,
        })
    }

    /// Recompute the digest with the credential's own version and params and
    /// compare in constant time. `Err` only for a corrupt credential.
    pub fn verify(
        &self,
        code: &Passcode,
        credential: &PasscodeCredential,
    ) -> Result<bool, CryptoError> {
        credential
            .params
            .check_bounds()
            .map_err(CryptoError::MalformedCredential)?;
        let salt = hex::decode(&credential.salt)?;
        let stored = hex::decode(&credential.hash)?;
        if stored.len() != DERIVED_KEY_LEN {
            return Err(CryptoError::MalformedCredential(format!(
                "digest must be {DERIVED_KEY_LEN} bytes, got {}",
                stored.len()
            )));
        }
        let candidate = match credential.version {
            PasscodeVersion::V1 => digest_v1(code, &salt, &credential.params)?,
        };
        Ok(constant_time_eq(&candidate[..], &stored))
    }

    /// True when the credential was produced by an older scheme or with
    /// different cost parameters than this authenticator uses.
    pub fn needs_rehash(&self, credential: &PasscodeCredential) -> bool {
        credential.version != PasscodeVersion::CURRENT || credential.params != self.params
    }
}

fn digest_v1(
    code: &Passcode,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
    let mut input = Zeroizing::new(Vec::with_capacity(AUTH_CONTEXT.len() + PASSCODE_LEN));
    input.extend_from_slice(AUTH_CONTEXT);
    input.extend_from_slice(code.as_bytes());
    kdf::argon2id(&input, salt, params)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> PasscodeAuthenticator {
        PasscodeAuthenticator::new(KdfParams::insecure_fast())
    }

    #[test]
    fn parse_accepts_only_six_digits() {
        assert!(Passcode::parse("123456").is_ok());
        assert!(Passcode::parse("000000").is_ok());
        for bad in ["12345", "1234567", "12345a", "", "12 456", "１２３４５６"] {
            assert!(
                matches!(Passcode::parse(bad), Err(CryptoError::InvalidPasscode(6))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn debug_is_redacted() {
        let code = Passcode::parse("424242").unwrap();
        assert!(!format!("{code:?}").contains("4242"));
    }

    #[test]
    fn verify_accepts_the_enrolled_code() {
        let a = auth();
        let code = Passcode::parse("731902").unwrap();
        let cred = a.enroll(&code).unwrap();
        assert!(a.verify(&code, &cred).unwrap());
    }

    #[test]
    fn verify_rejects_neighbouring_codes() {
        let a = auth();
        let cred = a.enroll(&Passcode::parse("731902").unwrap()).unwrap();
        for other in ["731903", "731901", "000000", "137902"] {
            assert!(!a.verify(&Passcode::parse(other).unwrap(), &cred).unwrap());
        }
    }

    #[test]
    fn same_code_gets_distinct_salts_and_digests() {
        let a = auth();
        let code = Passcode::parse("111111").unwrap();
        let c1 = a.enroll(&code).unwrap();
        let c2 = a.enroll(&code).unwrap();
        assert_ne!(c1.salt, c2.salt);
        assert_ne!(c1.hash, c2.hash);
    }

    #[test]
    fn credential_keeps_its_own_params() {
        let code = Passcode::parse("555000").unwrap();
        let cred = auth().enroll(&code).unwrap();
        let stronger = PasscodeAuthenticator::new(KdfParams {
            memory_kib: 64,
            iterations: 2,
            parallelism: 1,
        });
        assert!(stronger.verify(&code, &cred).unwrap());
        assert!(stronger.needs_rehash(&cred));
        assert!(!auth().needs_rehash(&cred));
    }

    #[test]
    fn version_serializes_as_integer() {
        let cred = auth().enroll(&Passcode::parse("123123").unwrap()).unwrap();
        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json["version"], 1);

        let mut tampered = json.clone();
        tampered["version"] = serde_json::json!(9);
        assert!(serde_json::from_value::<PasscodeCredential>(tampered).is_err());
    }

    #[test]
    fn oversized_stored_cost_is_refused_before_hashing() {
        let code = Passcode::parse("246810").unwrap();
        let mut cred = auth().enroll(&code).unwrap();
        cred.params.memory_kib = u32::MAX;
        assert!(matches!(
            auth().verify(&code, &cred),
            Err(CryptoError::MalformedCredential(_))
        ));
        cred.params = KdfParams {
            iterations: 100_000,
            ..KdfParams::insecure_fast()
        };
        assert!(matches!(
            auth().verify(&code, &cred),
            Err(CryptoError::MalformedCredential(_))
        ));
    }

    #[test]
    fn truncated_digest_is_reported_not_matched() {
        let a = auth();
        let code = Passcode::parse("123123").unwrap();
        let mut cred = a.enroll(&code).unwrap();
        cred.hash.truncate(10);
        assert!(matches!(
            a.verify(&code, &cred),
            Err(CryptoError::MalformedCredential(_))
        ));
    }
}
