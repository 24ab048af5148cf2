use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::twilio::device::TwilioConnection;

/// Registry of live Twilio legs, keyed by call_sid.
///
/// Lets the status callback find the connection a webhook is about. Entries
/// are dropped once the leg closes; the controller may still hold its own
/// handle for a while after that.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<TwilioConnection>>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn register(&self, connection: Arc<TwilioConnection>) {
        let call_sid = connection.sid().to_string();
        tracing::info!(call_sid = %call_sid, "Connection registered");
        if self
            .inner
            .lock()
            .await
            .insert(call_sid.clone(), connection)
            .is_some()
        {
            tracing::warn!(call_sid = %call_sid, "Replaced an existing connection");
        }
    }

    pub async fn deregister(&self, call_sid: &str) {
        if self.inner.lock().await.remove(call_sid).is_some() {
            tracing::info!(call_sid = %call_sid, "Connection deregistered");
        }
    }

    pub async fn get(&self, call_sid: &str) -> Option<Arc<TwilioConnection>> {
        self.inner.lock().await.get(call_sid).cloned()
    }
}
