//! Control console API for credential management
//!
//! Runs on a separate listener (default 127.0.0.1:9090). Every mutation goes
//! through the pool's store API, so the console never bypasses acquisition
//! and never sees or returns raw secrets after they are submitted.
//!
//! Endpoints:
//! - GET    /admin/credentials              list credentials with status
//! - POST   /admin/credentials              add `{"secret": "..."}`
//! - POST   /admin/credentials/import       import the backup file
//! - POST   /admin/credentials/{id}/disable operator disable
//! - POST   /admin/credentials/{id}/enable  return to service
//! - DELETE /admin/credentials/{id}         remove
//! - GET    /admin/pool                     pool health summary

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::Secret;
use credential_pool::{Pool, credential_summary};
use credential_store::now_millis;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::ApiError;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

/// Build the admin router with all credential management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials).post(add_credential))
        .route("/admin/credentials/import", post(import_backup))
        .route("/admin/credentials/{id}/disable", post(disable_credential))
        .route("/admin/credentials/{id}/enable", post(enable_credential))
        .route("/admin/credentials/{id}", delete(remove_credential))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_ok(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// GET /admin/credentials
async fn list_credentials(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let now = now_millis();
    let credentials: Vec<_> = state
        .pool
        .credentials()?
        .iter()
        .map(|c| credential_summary(c, now))
        .collect();
    Ok(json_ok(StatusCode::OK, json!({ "credentials": credentials })))
}

#[derive(Deserialize)]
struct AddCredentialRequest {
    secret: String,
}

/// POST /admin/credentials. 201 for a new row, 200 if the secret is
/// already pooled.
async fn add_credential(State(state): State<AdminState>, body: Bytes) -> Result<Response, ApiError> {
    let req: AddCredentialRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("expected {{\"secret\": \"...\"}}: {e}")))?;

    let secret = Secret::new(req.secret);

    match state.pool.add_credential(secret.expose())? {
        Some(credential) => {
            info!(credential_id = credential.id, secret_fp = credential.secret.fingerprint(), "credential added");
            Ok(json_ok(
                StatusCode::CREATED,
                json!({ "credential": credential_summary(&credential, now_millis()), "created": true }),
            ))
        }
        None => Ok(json_ok(
            StatusCode::OK,
            json!({ "created": false, "secret_fp": secret.fingerprint() }),
        )),
    }
}

/// POST /admin/credentials/import
async fn import_backup(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let imported = state.pool.import_backup()?;
    Ok(json_ok(StatusCode::OK, json!({ "imported": imported })))
}

/// POST /admin/credentials/{id}/disable
async fn disable_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.pool.disable(&id)?;
    Ok(json_ok(StatusCode::OK, json!({ "id": id, "status": "disabled" })))
}

/// POST /admin/credentials/{id}/enable. A credential that is active or in
/// flight is left alone.
async fn enable_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.pool.enable(&id)? {
        return Err(ApiError::Conflict(format!(
            "credential {id} is not disabled or cooling down"
        )));
    }
    Ok(json_ok(StatusCode::OK, json!({ "id": id, "status": "active" })))
}

/// DELETE /admin/credentials/{id}
async fn remove_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let removed = state.pool.remove(&id)?;
    Ok(json_ok(
        StatusCode::OK,
        json!({ "id": removed.id, "status": "removed", "secret_fp": removed.secret.fingerprint() }),
    ))
}

/// GET /admin/pool, same shape as the pool object of `/health`.
async fn pool_status(State(state): State<AdminState>) -> Result<Response, ApiError> {
    Ok(json_ok(StatusCode::OK, state.pool.health()?))
}
