use crate::config::TwilioConfig;
use crate::telephony::TelephonyError;

/// Call progress reported to /twilio/status.
const STATUS_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];

/// Twilio REST API client for placing and steering calls.
pub struct TwilioClient {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    external_url: String,
}

impl TwilioClient {
    pub fn new(twilio_config: &TwilioConfig, external_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
            external_url: external_url.trim_end_matches('/').to_string(),
        }
    }

    /// Webhook that bridges an answered call to the agent.
    pub fn bridge_url(&self) -> String {
        format!("{}/twilio/voice/bridge", self.external_url)
    }

    pub fn status_url(&self) -> String {
        format!("{}/twilio/status", self.external_url)
    }

    /// Status callback fields. Twilio reads one `StatusCallbackEvent` per event.
    fn status_callback_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("StatusCallback", self.status_url()),
            ("StatusCallbackMethod", "POST".to_string()),
        ];
        params.extend(
            STATUS_EVENTS
                .iter()
                .map(|event| ("StatusCallbackEvent", event.to_string())),
        );
        params
    }

    fn create_params(&self, to: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("To", to.to_string()),
            ("From", self.from_number.clone()),
            ("Url", self.bridge_url()),
        ];
        params.extend(self.status_callback_params());
        params
    }

    /// An inbound leg has no status callback unless the number is configured
    /// with one, so it is attached when the leg is taken off hold.
    fn bridge_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("Url", self.bridge_url()), ("Method", "POST".to_string())];
        params.extend(self.status_callback_params());
        params
    }

    /// Place an outbound call. When `to` answers, Twilio fetches the bridge
    /// TwiML; every status change is POSTed to /twilio/status.
    pub async fn create_call(&self, to: &str) -> Result<String, TelephonyError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.account_sid
        );
        let params = self.create_params(to);

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| TelephonyError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TelephonyError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TelephonyError::Request(e.to_string()))?;

        let call_sid = body["sid"]
            .as_str()
            .ok_or_else(|| TelephonyError::Api("response carried no call sid".into()))?
            .to_string();

        tracing::info!(to, call_sid = %call_sid, "Outbound call placed");
        Ok(call_sid)
    }

    /// Move a parked call onto the bridge TwiML and start its status callbacks.
    pub async fn bridge(&self, call_sid: &str) -> Result<(), TelephonyError> {
        self.update_call(call_sid, &self.bridge_params()).await
    }

    /// End a call. `canceled` only applies to calls that were never answered.
    pub async fn end_call(&self, call_sid: &str, answered: bool) -> Result<(), TelephonyError> {
        let status = if answered { "completed" } else { "canceled" };
        self.update_call(call_sid, &[("Status", status.to_string())])
            .await
    }

    async fn update_call(
        &self,
        call_sid: &str,
        params: &[(&'static str, String)],
    ) -> Result<(), TelephonyError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls/{}.json",
            self.account_sid, call_sid
        );

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(params)
            .send()
            .await
            .map_err(|e| TelephonyError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TelephonyError::Api(format!("{status}: {body}")));
        }

        tracing::debug!(call_sid, ?params, "Call updated");
        Ok(())
    }
}
