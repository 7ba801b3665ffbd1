use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ciphertext is too short: {len} bytes")]
    Truncated { len: usize },
    #[error("authenticated decryption failed")]
    Open,
    #[error("authenticated encryption failed")]
    Seal,
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("malformed kms message: {0}")]
    Malformed(&'static str),
    #[error("reply is for request {actual}, expected {expected}")]
    RequestIdMismatch { expected: String, actual: String },
    #[error("kms rejected the request with status {status}: {reason}")]
    Rejected { status: u16, reason: String },
    #[error("hkdf expansion failed")]
    KeyDerivation,
    #[error("decrypted content is not valid utf-8")]
    Utf8,
}
