//! Key derivation functions
//!
//! `argon2id` — slow, salted derivation used both for passcode
//!   authentication digests and for the escrow wrapping key. The two uses
//!   always run with independent salts.
//!
//! `hkdf_expand` — HKDF-SHA256, used to turn an X25519 shared secret into a
//!   content-key wrapping key.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const SALT_LEN: usize = 16;
pub const DERIVED_KEY_LEN: usize = 32;

/// Upper bounds on stored Argon2id costs. Parameters are read back from
/// records anyone with store access can write, so anything larger is
/// treated as a corrupt record rather than honoured.
pub const MAX_MEMORY_KIB: u32 = 256 * 1024;
pub const MAX_ITERATIONS: u32 = 10;
pub const MAX_PARALLELISM: u32 = 8;

/// Argon2id cost parameters. Persisted next to every digest and escrow blob
/// so that changing the defaults never strands existing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Interactive profile: 19 MiB, 2 passes, 1 lane.
    pub const fn interactive() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }

    /// Minimum Argon2 cost. Only for tests and throwaway fixtures.
    pub const fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Reject costs outside what this crate will ever derive with.
    pub fn check_bounds(&self) -> Result<(), String> {
        if self.memory_kib > MAX_MEMORY_KIB {
            return Err(format!("memory {} KiB exceeds {MAX_MEMORY_KIB}", self.memory_kib));
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(format!("iterations {} outside 1..={MAX_ITERATIONS}", self.iterations));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(format!("parallelism {} outside 1..={MAX_PARALLELISM}", self.parallelism));
        }
        if self.memory_kib < 8 * self.parallelism {
            return Err(format!("memory {} KiB below 8 KiB per lane", self.memory_kib));
        }
        Ok(())
    }

    fn to_argon2(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(DERIVED_KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive 32 bytes from `secret` + `salt` with Argon2id v0x13.
pub fn argon2id(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut out = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(secret, salt, &mut out[..])
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 derive: {e}")))?;
    Ok(out)
}

/// Generate a fresh random 16-byte salt. Salts are not secret.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_bounds() {
        assert!(KdfParams::interactive().check_bounds().is_ok());
        assert!(KdfParams::insecure_fast().check_bounds().is_ok());
        let huge = KdfParams {
            memory_kib: 4 * 1024 * 1024,
            ..KdfParams::interactive()
        };
        assert!(huge.check_bounds().is_err());
        let slow = KdfParams {
            iterations: 1_000,
            ..KdfParams::interactive()
        };
        assert!(slow.check_bounds().is_err());
        let wide = KdfParams {
            parallelism: 0,
            ..KdfParams::interactive()
        };
        assert!(wide.check_bounds().is_err());
    }

    #[test]
    fn argon2id_is_deterministic_per_salt() {
        let params = KdfParams::insecure_fast();
        let salt = generate_salt();
        let a = argon2id(b"123456", &salt, &params).unwrap();
        let b = argon2id(b"123456", &salt, &params).unwrap();
        assert_eq!(*a, *b);

        let other = argon2id(b"123456", &generate_salt(), &params).unwrap();
        assert_ne!(*a, *other);
    }

    #[test]
    fn rejects_impossible_params() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 1,
            parallelism: 1,
        };
        assert!(matches!(
            argon2id(b"x", &generate_salt(), &params),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn hkdf_output_depends_on_info() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_expand(b"ikm", None, b"one", &mut a).unwrap();
        hkdf_expand(b"ikm", None, b"two", &mut b).unwrap();
        assert_ne!(a, b);
    }
}
