//! NoCloud datasource served to booting runners.
//!
//! A runner's SMBIOS serial points cloud-init at
//! `/cloud-init/{token}/`, from which it fetches `user-data`, `meta-data`,
//! `vendor-data` and `network-config`. Only `user-data` carries content: the
//! token is exchanged for a fresh runner registration and the boot template
//! is rendered around it. Every valid fetch registers again.

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use secrecy::ExposeSecret;
use tracing::{error, info, warn};

use super::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cloud-init/{token}/user-data", get(user_data))
        .route("/cloud-init/{token}/meta-data", get(no_content))
        .route("/cloud-init/{token}/vendor-data", get(no_content))
        .route("/cloud-init/{token}/network-config", get(no_content))
}

async fn user_data(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let name = state.tokens().verify(&token).map_err(|e| {
        warn!(error = %e, "Rejected provisioning token");
        ApiError::unauthorized("invalid_token", "provisioning token is invalid or expired")
    })?;

    let jit = state.registrar().register(&name).await.map_err(|e| {
        error!(name = %name, error = %e, "Failed to register runner");
        ApiError::bad_gateway("registration_failed", "runner registration failed")
    })?;
    info!(name = %name, runner_id = jit.runner_id, "Serving runner user-data");

    let body = state
        .template()
        .render(&name, jit.encoded.expose_secret())
        .map_err(|e| {
            error!(name = %name, error = %e, "Failed to render user-data");
            ApiError::internal("template_render_failed", "user-data template failed to render")
        })?;
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}
