use rusqlite::ErrorCode;
use thiserror::Error;

/// Phrases that mark an otherwise unstructured error as a connectivity blip.
/// Only consulted for errors that carry no error code (pool checkout failures).
const TRANSIENT_PHRASES: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "broken pipe",
    "bad connection",
    "no such host",
    "database is locked",
    "database is busy",
    "unable to open database file",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    #[error("invalid stored value: {0}")]
    Invalid(String),

    #[error("database store is closed")]
    Closed,

    #[error("{op} [{key}]: {source}")]
    Context {
        op: &'static str,
        key: String,
        #[source]
        source: Box<StoreError>,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Wraps the error with the operation name and the natural key it touched.
    /// Cancellation and not-found pass through untouched so callers can still
    /// match on them directly.
    pub fn context(self, op: &'static str, key: impl Into<String>) -> Self {
        match self {
            StoreError::Cancelled | StoreError::DeadlineExceeded | StoreError::NotFound { .. } => {
                self
            }
            other => StoreError::Context {
                op,
                key: key.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_cancellation(&self) -> bool {
        match self {
            StoreError::Cancelled | StoreError::DeadlineExceeded => true,
            StoreError::Context { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        is_transient(self)
    }
}

/// Decides whether a failure is worth retrying.
///
/// SQLite errors are classified by their result code. Busy/locked databases
/// and files that cannot be opened yet (volume still mounting, directory being
/// provisioned) are transient; everything else, including permission and
/// "not a database" failures, is fatal. Errors without a code fall back to
/// phrase matching.
pub fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
        ),
        StoreError::Sqlite(_) => false,
        StoreError::Pool(e) => matches_transient_phrase(&e.to_string()),
        StoreError::Context { source, .. } => is_transient(source),
        _ => false,
    }
}

fn matches_transient_phrase(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_PHRASES.iter().any(|p| lowered.contains(p))
}
