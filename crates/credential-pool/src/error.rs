//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No eligible credential. Carries a JSON body with per-status counts.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential store error: {0}")]
    Store(credential_store::Error),
}

impl From<credential_store::Error> for Error {
    fn from(err: credential_store::Error) -> Self {
        match err {
            credential_store::Error::NotFound(id) => Error::NotFound(id),
            other => Error::Store(other),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_becomes_pool_not_found() {
        let err: Error = credential_store::Error::NotFound("cred_x".into()).into();
        assert!(matches!(err, Error::NotFound(ref id) if id == "cred_x"));
    }

    #[test]
    fn other_store_errors_are_wrapped() {
        let err: Error = credential_store::Error::EmptySecret.into();
        assert!(matches!(err, Error::Store(credential_store::Error::EmptySecret)));
        assert!(err.to_string().starts_with("credential store error:"));
    }
}
