//! Error types for Reelcast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReelcastError>;

#[derive(Error, Debug)]
pub enum ReelcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Token error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ReelcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ReelcastError::InvalidInput(_) | ReelcastError::NotFound(_) => 3,
            ReelcastError::Unauthorized(_) => 2,
            ReelcastError::Platform(PlatformError::Authentication(_)) => 2,
            ReelcastError::Config(_) | ReelcastError::Crypto(_) => 2,
            ReelcastError::Platform(_) => 1,
            ReelcastError::Database(_) => 1,
            ReelcastError::Reconcile(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Publishing failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl PlatformError {
    /// The message without the category prefix.
    ///
    /// This is what lands in `platform_posts.last_error`, so vendor error text
    /// is stored exactly as the vendor returned it.
    pub fn detail(&self) -> &str {
        match self {
            PlatformError::Authentication(msg)
            | PlatformError::Validation(msg)
            | PlatformError::Posting(msg)
            | PlatformError::Network(msg)
            | PlatformError::RateLimit(msg)
            | PlatformError::Timeout(msg)
            | PlatformError::NotImplemented(msg) => msg,
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            PlatformError::Timeout(error.to_string())
        } else if error.is_decode() {
            PlatformError::Posting(format!("Unexpected response body: {}", error))
        } else {
            PlatformError::Network(error.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Token encryption key not configured ({0} is unset)")]
    MissingKey(String),

    #[error("Invalid token encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("post has no platform targets")]
    NoTargets,
}
