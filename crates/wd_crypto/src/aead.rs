//! Authenticated Encryption with Associated Data
//!
//! XChaCha20-Poly1305. Key: 32 bytes. Nonce: 24 bytes (random, carried
//! separately as the record's `iv`). Tag: 16 bytes, appended to ciphertext.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

pub fn encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

pub fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fresh random symmetric key (used as the per-message content key).
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut key[..]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = generate_key();
        let nonce = generate_nonce();
        let mut ct = encrypt(&key, &nonce, b"hello", b"aad").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(
            decrypt(&key, &nonce, &ct, b"aad"),
            Err(CryptoError::AeadDecrypt)
        ));
    }

    #[test]
    fn aad_mismatch_is_rejected() {
        let key = generate_key();
        let nonce = generate_nonce();
        let ct = encrypt(&key, &nonce, b"hello", b"one").unwrap();
        assert!(decrypt(&key, &nonce, &ct, b"two").is_err());
        assert_eq!(&decrypt(&key, &nonce, &ct, b"one").unwrap()[..], b"hello");
    }

    #[test]
    fn short_input_is_rejected() {
        let key = generate_key();
        let nonce = generate_nonce();
        assert!(decrypt(&key, &nonce, &[0u8; 4], b"").is_err());
    }
}
