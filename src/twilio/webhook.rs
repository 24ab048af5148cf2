use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use crate::AppState;

/// How long one hold cycle lasts before Twilio re-fetches the hold TwiML.
const HOLD_PAUSE_SECS: u32 = 30;

#[derive(Debug, Deserialize)]
pub struct VoiceWebhook {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From")]
    pub from: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusWebhook {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
}

/// Handle POST /twilio/voice: Twilio webhook for incoming calls.
///
/// Registers the leg, offers it to the controller and parks the caller on
/// hold until the agent accepts or rejects.
pub async fn handle_voice(
    State(state): State<AppState>,
    Form(form): Form<VoiceWebhook>,
) -> Response {
    tracing::info!(call_sid = %form.call_sid, from = ?form.from, "Incoming call");

    let connection = state
        .device
        .register_incoming(&form.call_sid, form.from)
        .await;

    if let Err(e) = state.controller.offer_incoming(connection).await {
        tracing::error!(call_sid = %form.call_sid, "Could not offer incoming call: {e}");
        return twiml(reject_twiml());
    }

    twiml(hold_twiml(&state.config.server.external_url, true))
}

/// Handle POST /twilio/voice/hold: keeps a parked caller waiting.
pub async fn handle_hold(State(state): State<AppState>) -> Response {
    twiml(hold_twiml(&state.config.server.external_url, false))
}

/// Handle POST /twilio/voice/bridge: connects an answered call to the agent.
///
/// Used both when an outbound callee picks up and when an accepted incoming
/// call is redirected off hold.
pub async fn handle_bridge(State(state): State<AppState>) -> Response {
    let twilio = &state.config.twilio;
    twiml(dial_twiml(&twilio.agent_number, &twilio.phone_number))
}

/// Handle POST /twilio/status: Twilio call status callback.
pub async fn handle_status(
    State(state): State<AppState>,
    Form(form): Form<StatusWebhook>,
) -> StatusCode {
    tracing::debug!(call_sid = %form.call_sid, status = %form.call_status, "Status callback");
    state
        .device
        .apply_status(&form.call_sid, &form.call_status)
        .await;
    StatusCode::OK
}

fn twiml(body: String) -> Response {
    ([("Content-Type", "text/xml")], body).into_response()
}

fn hold_twiml(external_url: &str, greet: bool) -> String {
    let greeting = if greet {
        "\n    <Say>Please hold while we connect you.</Say>"
    } else {
        ""
    };
    let hold_url = format!("{}/twilio/voice/hold", external_url.trim_end_matches('/'));

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>{greeting}
    <Pause length="{HOLD_PAUSE_SECS}" />
    <Redirect method="POST">{}</Redirect>
</Response>"#,
        escape_xml(&hold_url)
    )
}

fn reject_twiml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Reject />
</Response>"#
        .to_string()
}

/// `<Dial>` the agent. `client:name` targets a Twilio Client identity.
fn dial_twiml(agent: &str, caller_id: &str) -> String {
    let target = match agent.strip_prefix("client:") {
        Some(identity) => format!("<Client>{}</Client>", escape_xml(identity)),
        None => format!("<Number>{}</Number>", escape_xml(agent)),
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Dial callerId="{}">{target}</Dial>
</Response>"#,
        escape_xml(caller_id)
    )
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
