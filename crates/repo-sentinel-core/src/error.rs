use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy shared by every subsystem.
///
/// Fatal variants carry a process exit code; per-file and per-scanner
/// variants are handled locally and never abort a phase on their own.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("rate limited by {service}")]
    RateLimited { service: String },

    #[error("provider `{provider}` exhausted after {attempts} attempts")]
    ProviderExhausted { provider: String, attempts: u32 },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("scanner `{0}` is not available")]
    ScannerUnavailable(String),

    #[error("scanner `{scanner}` timed out after {seconds}s")]
    ScannerTimeout { scanner: String, seconds: u64 },

    #[error("manifest is pinned to commit {expected} but the source resolved {actual}")]
    StaleManifest { expected: String, actual: String },

    #[error("manifest is not valid JSON: {0}")]
    CorruptManifest(String),

    #[error("manifest missing required top-level key `{0}`")]
    SchemaMismatch(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("manifest not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, SentinelError>;

impl SentinelError {
    /// Process exit code for fatal errors (spec'd CLI contract).
    pub fn exit_code(&self) -> i32 {
        match self {
            SentinelError::ConfigInvalid(_) | SentinelError::StaleManifest { .. } => 2,
            SentinelError::SourceUnavailable(_) => 3,
            SentinelError::Cancelled => 4,
            SentinelError::ScannerUnavailable(_) => 5,
            _ => 1,
        }
    }

    /// Whether a backoff-and-retry loop may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SentinelError::RateLimited { .. })
    }
}
