//! ALFA Identity Vault - Error Types

use thiserror::Error;

/// Result type for identity vault operations
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Identity vault error types
#[derive(Error, Debug)]
pub enum IdentityError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    /// Authenticated decryption or key unwrap rejected the input
    #[error("Authentication failed - wrong passphrase or corrupted data")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Weak input: {0}")]
    WeakInput(String),

    #[error("Invalid salt: salt must not be empty")]
    InvalidSalt,

    #[error("Session closed - unlock again to continue")]
    SessionClosed,

    // ═══════════════════════════════════════════════════════════════
    // BIOMETRIC ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("No face detected - capture another sample")]
    NoFaceDetected,

    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    // ═══════════════════════════════════════════════════════════════
    // CODEC ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Byte length {len} is not a multiple of element width {width}")]
    Length { len: usize, width: usize },

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid record state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ═══════════════════════════════════════════════════════════════
    // SYNC ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Network error: {0}")]
    Network(String),

    #[error("Sync already in progress for record {0}")]
    SyncInProgress(String),

    #[error("Content integrity mismatch for {0}")]
    IntegrityMismatch(String),

    // ═══════════════════════════════════════════════════════════════
    // CONFIG ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IdentityError {
    /// Check if the failed operation may succeed when retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdentityError::Network(_) | IdentityError::SyncInProgress(_)
        )
    }

    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            IdentityError::AuthenticationFailed | IdentityError::IntegrityMismatch(_)
        )
    }

    /// Message suitable for showing to the person at the device
    pub fn user_message(&self) -> String {
        match self {
            IdentityError::AuthenticationFailed => "Wrong passphrase or corrupted data".into(),
            IdentityError::NoFaceDetected => "No face detected, please capture again".into(),
            IdentityError::Network(_) | IdentityError::SyncInProgress(_) => {
                "Remote service unavailable, the record stays pending and can be retried".into()
            }
            IdentityError::SessionClosed => "Session ended, enter your passphrase again".into(),
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for IdentityError {
    fn from(e: rusqlite::Error) -> Self {
        IdentityError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(e: serde_json::Error) -> Self {
        IdentityError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for IdentityError {
    fn from(e: base64::DecodeError) -> Self {
        IdentityError::InvalidEncoding(e.to_string())
    }
}

impl From<hex::FromHexError> for IdentityError {
    fn from(e: hex::FromHexError) -> Self {
        IdentityError::InvalidEncoding(e.to_string())
    }
}
