use thiserror::Error;

/// Failures while turning raw XML bytes into an article record.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("document contains no article element")]
    MissingArticle,

    #[error("article carries no external id")]
    MissingIdentity,

    /// Per-field failure; callers treat the field as null and continue.
    #[error("unparseable date value: {0}")]
    UnparseableDate(String),
}

/// Record-store failures, classified by how the caller should react.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Worth retrying (busy/locked connection, transient I/O).
    #[error("transient store error: {0}")]
    Transient(String),

    /// Unique violation; the dedup path owns this outcome.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Permanent(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) => match e.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    StoreError::Transient(err.to_string())
                }
                rusqlite::ErrorCode::ConstraintViolation => {
                    StoreError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
                }
                _ => StoreError::Permanent(err.to_string()),
            },
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The backend could not be reached; the hash fallback is permitted.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Violates the active index dimension invariant. Fatal for the run.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding call cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index has not been created")]
    NotCreated,

    /// An active index state exists with a conflicting dimension.
    #[error("index dimension conflict: active index '{name}' has {active}, requested {requested}")]
    DimensionConflict {
        name: String,
        active: usize,
        requested: usize,
    },

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("provider error: {0}")]
    ProviderPermanent(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Both the vector and the keyword backend failed.
    #[error("no retrieval backend available")]
    NoBackend,

    #[error("query cancelled")]
    Cancelled,

    #[error("query deadline exceeded")]
    Timeout,
}

/// Crate-wide error type used at the engine facade.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: articles.external_id".to_string()),
        );
        match StoreError::from(err) {
            StoreError::Conflict(msg) => assert!(msg.contains("external_id")),
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(err), StoreError::Transient(_)));
    }
}
