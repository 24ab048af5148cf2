use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{check_auth, error_json, reply};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    /// Number to call (E.164 format, e.g., "+34612345678")
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    /// Free-form tag, e.g. "meeting_booked". Stored as-is.
    pub outcome: String,
}

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
}

/// POST /api/call: Dial a number from the desk.
///
/// Requires `Authorization: Bearer <token>` header matching the configured api.token.
///
/// ```json
/// { "to": "+34612345678" }
/// ```
pub async fn handle_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CallRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }

    let to = req.to.trim();
    if to.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "Missing number to call".to_string());
    }

    tracing::info!(to, "Outbound call requested");
    reply(state.controller.start_outgoing(to).await)
}

/// GET /api/call: Current session snapshot.
pub async fn handle_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }
    reply(state.controller.snapshot().await)
}

/// POST /api/call/hangup: Hang up, or cancel a call still connecting.
pub async fn handle_hangup(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }
    reply(state.controller.hang_up().await)
}

/// POST /api/call/mute
pub async fn handle_mute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MuteRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }
    reply(state.controller.set_muted(req.muted).await)
}

/// POST /api/call/reset: Clear a finished call before the next one.
pub async fn handle_reset(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }
    reply(state.controller.reset().await)
}

/// POST /api/call/outcome: Tag the current (or just finished) call's record.
pub async fn handle_outcome(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OutcomeRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }

    let result = state
        .controller
        .record_outcome(req.outcome)
        .await
        .map(|()| Ack { status: "recorded" });
    reply(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallStatus;
    use crate::testing::{read_json, test_state, TOKEN};

    fn auth() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {TOKEN}").parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn start_returns_connecting_snapshot() {
        let desk = test_state();

        let resp = handle_start(
            State(desk.state.clone()),
            auth(),
            Json(CallRequest {
                to: "+15551234".into(),
            }),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["status"], "connecting");
        assert_eq!(body["target"], "+15551234");
        assert_eq!(desk.device.dialled(), vec!["+15551234".to_string()]);
    }

    #[tokio::test]
    async fn start_requires_token() {
        let desk = test_state();
        let resp = handle_start(
            State(desk.state.clone()),
            HeaderMap::new(),
            Json(CallRequest {
                to: "+15551234".into(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(desk.device.dialled().is_empty());
    }

    #[tokio::test]
    async fn blank_number_is_rejected() {
        let desk = test_state();
        let resp = handle_start(
            State(desk.state.clone()),
            auth(),
            Json(CallRequest { to: "  ".into() }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hangup_without_call_conflicts() {
        let desk = test_state();
        let resp = handle_hangup(State(desk.state.clone()), auth()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn hangup_then_reset() {
        let desk = test_state();
        handle_start(
            State(desk.state.clone()),
            auth(),
            Json(CallRequest {
                to: "+15551234".into(),
            }),
        )
        .await;

        let resp = handle_hangup(State(desk.state.clone()), auth()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["status"], "ended");
        assert_eq!(desk.records.updates().len(), 1);

        let resp = handle_reset(State(desk.state.clone()), auth()).await;
        assert_eq!(read_json(resp).await["status"], "idle");

        let snapshot = desk.state.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Idle);
    }

    #[tokio::test]
    async fn outcome_without_call_is_not_found() {
        let desk = test_state();
        let resp = handle_outcome(
            State(desk.state.clone()),
            auth(),
            Json(OutcomeRequest {
                outcome: "no_interest".into(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn record_failure_is_bad_gateway() {
        let desk = test_state();
        desk.records.fail_creates();
        let resp = handle_start(
            State(desk.state.clone()),
            auth(),
            Json(CallRequest {
                to: "+15551234".into(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn get_reports_idle_desk() {
        let desk = test_state();
        let resp = handle_get(State(desk.state.clone()), auth()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["status"], "idle");
        assert_eq!(body["elapsed_secs"], 0);
    }
}
