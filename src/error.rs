//! Typed error taxonomy for the ingestion pipeline.
//!
//! Each pipeline stage reports failures through its own enum so the caller can
//! decide what is retryable, what is counted and what aborts the run:
//!
//! | Type | Stage | Effect |
//! |------|-------|--------|
//! | [`ReadError`] | Feed/Sitemap Reader | document skipped, siblings continue |
//! | [`TransientReason`] | Fetch Worker | re-admitted through the rate limiter |
//! | [`PermanentReason`] | Fetch Worker / Admission | recorded, never retried in the run |
//! | [`ExtractionError`] | Extractor | counted per site as a health signal |
//! | [`StorageError`] | Persistence Gateway | task fails; `ConnectionLost` aborts the run |

use sqlx::error::ErrorKind;
use thiserror::Error;

/// Failure to read a single discovery document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    /// The document was fetched but is not a feed or sitemap we understand.
    #[error("malformed document: {0}")]
    Malformed(String),

    /// The document could not be fetched.
    #[error("unreachable document: {0}")]
    Unreachable(String),
}

/// Why a fetch may succeed if tried again later.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransientReason {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by publisher (HTTP 429)")]
    RateLimited,

    #[error("server error (HTTP {0})")]
    ServerError(u16),

    #[error("connection failed: {0}")]
    Connection(String),
}

/// Why a fetch will not be attempted again within this run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermanentReason {
    #[error("access forbidden")]
    Forbidden,

    #[error("client error (HTTP {0})")]
    ClientError(u16),

    #[error("path disallowed by robots.txt")]
    RobotsDisallowed,

    #[error("retries exhausted, last failure: {0}")]
    RetriesExhausted(TransientReason),
}

/// Failure to turn a fetched document into an article record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no title found")]
    NoTitle,

    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),
}

/// Storage failures other than the expected duplicate-key conflict.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The database cannot be reached. Fatal to the whole run.
    #[error("storage connection lost: {0}")]
    ConnectionLost(String),

    /// A constraint other than the `url` uniqueness key was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolationOther(String),

    #[error("storage query failed: {0}")]
    Query(String),
}

impl StorageError {
    /// Whether this error means the store is gone for the rest of the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::ConnectionLost(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::ConnectionLost(e.to_string()),
            sqlx::Error::Database(ref db) => match db.kind() {
                ErrorKind::Other => StorageError::Query(db.message().to_string()),
                _ => StorageError::ConstraintViolationOther(db.message().to_string()),
            },
            other => StorageError::Query(other.to_string()),
        }
    }
}

/// Problems with the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures that end a pipeline run early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(StorageError),

    #[error("cannot build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_loss_is_fatal() {
        assert!(StorageError::ConnectionLost("gone".into()).is_fatal());
        assert!(!StorageError::ConstraintViolationOther("title".into()).is_fatal());
        assert!(!StorageError::Query("syntax".into()).is_fatal());
    }

    #[test]
    fn test_pool_closed_maps_to_connection_lost() {
        let e: StorageError = sqlx::Error::PoolClosed.into();
        assert!(matches!(e, StorageError::ConnectionLost(_)));
    }

    #[test]
    fn test_retries_exhausted_keeps_last_reason() {
        let e = PermanentReason::RetriesExhausted(TransientReason::ServerError(503));
        assert_eq!(e.to_string(), "retries exhausted, last failure: server error (HTTP 503)");
    }
}
