//! Upstream error taxonomy
//!
//! Every variant is a failed call from the credential's point of view. The
//! `FailureKind` split only exists for logs and metrics.

/// Coarse classification of a non-success upstream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403: the secret was rejected
    Unauthorized,
    /// 429
    RateLimited,
    /// 5xx and 408
    ServerError,
    /// Anything else outside 2xx
    BadStatus,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServerError => "server_error",
            FailureKind::BadStatus => "bad_status",
        }
    }
}

/// Classify an upstream HTTP status.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Unauthorized,
        429 => FailureKind::RateLimited,
        408 | 500..=599 => FailureKind::ServerError,
        _ => FailureKind::BadStatus,
    }
}

/// Errors from upstream calls.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("image task failed: {0}")]
    TaskFailed(String),

    #[error("image task {0} did not finish in time")]
    TaskTimeout(String),
}

impl UpstreamError {
    /// Label for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Transport(_) => "transport",
            UpstreamError::Status { status, .. } => classify_status(*status).label(),
            UpstreamError::Malformed(_) => "malformed",
            UpstreamError::TaskFailed(_) => "task_failed",
            UpstreamError::TaskTimeout(_) => "task_timeout",
        }
    }

    /// Whether the caller should see a gateway timeout rather than a bad gateway.
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout | UpstreamError::TaskTimeout(_))
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::Malformed(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

/// Result alias for upstream calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_unauthorized() {
        assert_eq!(classify_status(401), FailureKind::Unauthorized);
        assert_eq!(classify_status(403), FailureKind::Unauthorized);
    }

    #[test]
    fn server_statuses_are_server_errors() {
        for status in [408, 500, 502, 503, 504] {
            assert_eq!(classify_status(status), FailureKind::ServerError, "{status}");
        }
    }

    #[test]
    fn other_statuses() {
        assert_eq!(classify_status(429), FailureKind::RateLimited);
        assert_eq!(classify_status(400), FailureKind::BadStatus);
        assert_eq!(classify_status(404), FailureKind::BadStatus);
    }

    #[test]
    fn kind_labels_follow_classification() {
        let err = UpstreamError::Status {
            status: 403,
            body: "forbidden".into(),
        };
        assert_eq!(err.kind(), "unauthorized");
        assert_eq!(UpstreamError::Timeout.kind(), "timeout");
        assert!(UpstreamError::TaskTimeout("t1".into()).is_timeout());
        assert!(!UpstreamError::Malformed("x".into()).is_timeout());
    }
}
