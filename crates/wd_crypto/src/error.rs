use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch, possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Passcode must be exactly {0} digits")]
    InvalidPasscode(usize),

    #[error("Wrong passcode")]
    WrongPasscode,

    #[error("Unsupported passcode version {0}")]
    UnsupportedPasscodeVersion(u32),

    #[error("Malformed passcode credential: {0}")]
    MalformedCredential(String),

    #[error("Malformed key backup: {0}")]
    MalformedEscrow(String),

    #[error("Message decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("No ciphertext branch is addressed to key {0}")]
    NoBranchForKey(String),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
