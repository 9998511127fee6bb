//! Error types for credential storage

use rusqlite::ErrorCode;

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database file is damaged or not a database at all. Fatal at startup.
    #[error("credential store corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("secret must not be empty")]
    EmptySecret,

    #[error("secret already belongs to credential {0}")]
    DuplicateSecret(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) =>
            {
                Error::Corrupt(err.to_string())
            }
            _ => Error::Database(err.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a rusqlite error is a UNIQUE/constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}
