use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (reading an upload, writing or removing a blob file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The upload was empty.
    #[error("Empty upload")]
    EmptyUpload,

    /// The upload exceeded the configured maximum.
    #[error("Upload too large: more than {max} bytes")]
    TooLarge { max: u64 },

    /// A grant was requested with a kind / message combination that cannot exist.
    #[error("Invalid grant: {0}")]
    InvalidGrant(&'static str),

    /// A path escaped the storage root.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    /// A stored value could not be interpreted.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Map `QueryReturnedNoRows` onto [`StoreError::NotFound`].
pub(crate) fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

/// True when `e` is a UNIQUE / constraint violation.
pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
