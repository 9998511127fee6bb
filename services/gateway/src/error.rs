//! Service-specific error types
//!
//! `ApiError` is the only place a failure becomes an HTTP status. Every
//! error body has the shape
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use upstream::UpstreamError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No credential could be claimed. Carries the pool's JSON report.
    #[error("pool exhausted")]
    PoolExhausted(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service is shutting down")]
    ShuttingDown,
}

impl From<credential_pool::Error> for ApiError {
    fn from(err: credential_pool::Error) -> Self {
        match err {
            credential_pool::Error::PoolExhausted(report) => ApiError::PoolExhausted(report),
            credential_pool::Error::NotFound(id) => ApiError::NotFound(format!("credential {id}")),
            credential_pool::Error::Store(credential_store::Error::EmptySecret) => {
                ApiError::InvalidRequest("secret must not be empty".into())
            }
            credential_pool::Error::Store(e) => ApiError::Store(e.to_string()),
        }
    }
}

/// Fresh request id, `req_<uuid>`.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PoolExhausted(_) | ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    /// `type` field of the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request_error",
            ApiError::PoolExhausted(_) => "pool_exhausted",
            ApiError::Upstream(UpstreamError::TaskFailed(_)) => "image_task_failed",
            ApiError::Upstream(e) if e.is_timeout() => "upstream_timeout",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Store(_) => "store_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::ShuttingDown => "shutting_down",
        }
    }

    /// JSON error object, without the outer `error` key.
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        let mut error = match self {
            ApiError::PoolExhausted(report) => {
                let parsed: serde_json::Value = serde_json::from_str(report).unwrap_or_default();
                let mut error = parsed
                    .get("error")
                    .filter(|e| e.is_object())
                    .cloned()
                    .unwrap_or_else(|| {
                        serde_json::json!({ "message": "No upstream credential available" })
                    });
                error["type"] = serde_json::json!(self.kind());
                error
            }
            other => serde_json::json!({
                "type": other.kind(),
                "message": other.to_string(),
            }),
        };
        error["request_id"] = serde_json::json!(request_id);
        error
    }

    /// Render with a known request id.
    pub fn into_response_with(self, request_id: &str) -> Response {
        let body = serde_json::json!({ "error": self.body(request_id) });
        (
            self.status(),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with(&new_request_id())
    }
}
