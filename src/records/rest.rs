use async_trait::async_trait;

use super::{CallRecordUpdate, NewCallRecord, RecordError, RecordId, RecordStore};
use crate::config::RecordsConfig;

/// PostgREST client for the call records table.
pub struct RestRecordStore {
    client: reqwest::Client,
    table_url: String,
    api_key: String,
}

impl RestRecordStore {
    pub fn new(config: &RecordsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            table_url: table_url(&config.base_url, &config.table),
            api_key: config.api_key.clone(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn create_record(&self, record: NewCallRecord) -> Result<RecordId, RecordError> {
        let resp = self
            .request(self.client.post(&self.table_url))
            .header("Prefer", "return=representation")
            .json(&record)
            .send()
            .await
            .map_err(|e| RecordError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RecordError::Api(format!("HTTP {status}: {body}")));
        }

        let rows: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RecordError::Parse(e.to_string()))?;

        let id = parse_created_id(&rows)?;
        tracing::debug!(record_id = %id, "Call record created");
        Ok(id)
    }

    async fn update_record(&self, id: &str, update: CallRecordUpdate) -> Result<(), RecordError> {
        let resp = self
            .request(self.client.patch(&self.table_url))
            .query(&[("id", format!("eq.{id}"))])
            .json(&update)
            .send()
            .await
            .map_err(|e| RecordError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RecordError::Api(format!("HTTP {status}: {body}")));
        }

        tracing::debug!(record_id = %id, "Call record updated");
        Ok(())
    }
}

fn table_url(base_url: &str, table: &str) -> String {
    format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table)
}

/// Pull the id out of a `return=representation` body: an array with one row.
/// Numeric and string ids are both accepted.
fn parse_created_id(rows: &serde_json::Value) -> Result<RecordId, RecordError> {
    let row = rows
        .as_array()
        .and_then(|rows| rows.first())
        .unwrap_or(rows);

    match row.get("id") {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(RecordError::Parse("Missing 'id' field".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_url_trims_trailing_slash() {
        assert_eq!(
            table_url("https://db.example.com/", "calls"),
            "https://db.example.com/rest/v1/calls"
        );
    }

    #[test]
    fn parses_numeric_id_from_row_array() {
        let rows = json!([{ "id": 17, "target": "+15551234" }]);
        assert_eq!(parse_created_id(&rows).unwrap(), "17");
    }

    #[test]
    fn parses_uuid_id_from_single_object() {
        let row = json!({ "id": "6f1c0d2e" });
        assert_eq!(parse_created_id(&row).unwrap(), "6f1c0d2e");
    }

    #[test]
    fn missing_id_is_parse_error() {
        let rows = json!([]);
        assert!(matches!(
            parse_created_id(&rows),
            Err(RecordError::Parse(_))
        ));
    }
}
