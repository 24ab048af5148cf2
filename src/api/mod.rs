pub mod call;
pub mod incoming;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::call::CallError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_json(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// Status code a controller error is reported with.
pub fn error_status(err: &CallError) -> StatusCode {
    match err {
        CallError::InvalidTransition { .. } | CallError::DoubleFinalize { .. } => StatusCode::CONFLICT,
        CallError::NoPendingIncoming | CallError::NoActiveCall => StatusCode::NOT_FOUND,
        CallError::PersistenceFailure(_) | CallError::Telephony(_) => StatusCode::BAD_GATEWAY,
        CallError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: CallError) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!("Call request failed: {err}");
    } else {
        tracing::warn!("Call request refused: {err}");
    }
    error_json(status, err.to_string())
}

/// Turn a controller result into a JSON response.
fn reply<T: Serialize>(result: Result<T, CallError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

#[allow(clippy::result_large_err)]
fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), Response> {
    if expected_token.is_empty() {
        tracing::warn!("API token not configured, rejecting request");
        return Err(error_json(
            StatusCode::SERVICE_UNAVAILABLE,
            "API token not configured".to_string(),
        ));
    }

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected_token => Ok(()),
        _ => {
            tracing::warn!("Unauthorized API request");
            Err(error_json(
                StatusCode::UNAUTHORIZED,
                "Invalid or missing bearer token".to_string(),
            ))
        }
    }
}
