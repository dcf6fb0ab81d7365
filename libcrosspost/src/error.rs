//! Error types for Crosspost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A status-guarded transition lost its race, e.g. cancelling a post the
    /// scheduler has already claimed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_) => 3,
            CrosspostError::Conflict(_) => 4,
            CrosspostError::Adapter(AdapterError::Authentication(_)) => 2,
            CrosspostError::Adapter(_) => 1,
            CrosspostError::Config(_) => 1,
            CrosspostError::Database(_) => 1,
            CrosspostError::NotFound(_) => 1,
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
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure taxonomy for adapter operations.
///
/// The dispatch coordinator branches on the variant, never on message text:
/// `Validation` and `UnsupportedPlatform` are terminal, everything else is
/// retryable until the budget is exhausted.
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// Content violates platform constraints. Deterministic, never retried.
    #[error("Content validation failed: {0}")]
    Validation(String),

    /// Credential invalid or expired at call time. Retryable with a longer
    /// delay so the refresh monitor has a chance to run first.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Platform throttling. Carries the server's retry-after hint in seconds
    /// when it provided one.
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<u64>,
    },

    /// Timeout, 5xx, connection failure. Retryable with exponential backoff.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Sustained outage signal. Retried like `Transient` but logged
    /// distinctly for operational visibility.
    #[error("Platform unavailable: {0}")]
    Unavailable(String),

    /// Unknown platform identifier at registry resolution. Fatal, surfaced
    /// synchronously, never enters the retry path.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl AdapterError {
    /// Whether the dispatch coordinator may re-enqueue after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Authentication(_)
            | AdapterError::RateLimit { .. }
            | AdapterError::Transient(_)
            | AdapterError::Unavailable(_) => true,
            AdapterError::Validation(_) | AdapterError::UnsupportedPlatform(_) => false,
        }
    }

    /// Server-provided retry-after hint in seconds, if any.
    pub fn retry_after_hint(&self) -> Option<u64> {
        match self {
            AdapterError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
