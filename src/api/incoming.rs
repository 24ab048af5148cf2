use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Serialize;

use super::{check_auth, reply};
use crate::AppState;

#[derive(Debug, Serialize)]
struct Rejected {
    status: &'static str,
}

/// POST /api/incoming/accept: Pick up the waiting incoming call.
pub async fn handle_accept(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }
    reply(state.controller.accept_incoming().await)
}

/// POST /api/incoming/reject: Turn the waiting incoming call away.
pub async fn handle_reject(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }
    let result = state
        .controller
        .reject_incoming()
        .await
        .map(|()| Rejected { status: "rejected" });
    reply(result)
}
