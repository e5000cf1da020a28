use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record at {0} is not a JSON object")]
    NotAnObject(String),

    #[error("Invalid JSON pointer {pointer:?} for record {path}")]
    InvalidPointer { path: String, pointer: String },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Secret encoding error: {0}")]
    SecretEncoding(#[from] base64::DecodeError),
}
