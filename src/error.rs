//! Error types for the ingestion and report cache pipeline.

use std::fmt;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the pipeline.
///
/// Variants are grouped by who can recover from them:
/// upstream failures are recovered per entity by the rebuild coordinator,
/// cache and storage failures are logged and swallowed by their callers,
/// configuration failures abort startup.
#[derive(Debug, Clone)]
pub enum Error {
    /// The vendor kept answering with a transient failure (429, 5xx, timeout)
    /// until the retry budget ran out.
    ///
    /// **Recovery:** skip this entity for the current rebuild; the next rebuild
    /// retries it from scratch.
    UpstreamUnavailable {
        /// Number of attempts made before giving up.
        attempts: usize,
        /// Description of the last failure seen.
        last_error: String,
    },

    /// The vendor answered with a non-retryable status (4xx other than 429).
    ///
    /// `body` holds the beginning of the response body, truncated.
    UpstreamFatal {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// The vendor answered 2xx but the body could not be understood.
    MalformedResponse(String),

    /// Serialization failed when converting a value to cache or store bytes.
    SerializationError(String),

    /// Deserialization failed when converting cache or store bytes to a value.
    ///
    /// **Recovery:** the entry should be evicted and recomputed.
    DeserializationError(String),

    /// Invalid cache entry: corrupted envelope or bad magic.
    InvalidCacheEntry(String),

    /// Schema version mismatch between code and cached data.
    ///
    /// Expected during deployments; the entry is evicted on read.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from cached entry)
        found: u32,
    },

    /// Cache backend error (Redis connection lost, command failed, ...).
    BackendError(String),

    /// Durable period store could not be read or written.
    StorageError(String),

    /// Configuration error during startup.
    ConfigError(String),

    /// Feature not implemented or not enabled.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether the error came from the vendor API.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable { .. }
                | Error::UpstreamFatal { .. }
                | Error::MalformedResponse(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UpstreamUnavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "Upstream unavailable after {} attempts: {}",
                attempts, last_error
            ),
            Error::UpstreamFatal { status, body } => {
                write!(f, "Upstream returned {}: {}", status, body)
            }
            Error::MalformedResponse(msg) => write!(f, "Malformed upstream response: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::StorageError(e.to_string())
        } else if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::DeserializationError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StorageError(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else {
            Error::Other(format!("HTTP client error: {}", e))
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
