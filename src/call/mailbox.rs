use std::sync::Arc;

use tokio::sync::Mutex;

use crate::records::RecordId;
use crate::telephony::Connection;

/// A leg that is up, together with the record it is written to.
#[derive(Clone)]
pub struct ActiveConnection {
    pub connection: Arc<dyn Connection>,
    pub record_id: RecordId,
}

/// Single-slot store handing the active leg from one controller to the next.
///
/// Last write wins: only one call can be active for the desk at a time. Cloning
/// shares the slot.
#[derive(Clone, Default)]
pub struct ActiveConnectionSlot {
    inner: Arc<Mutex<Option<ActiveConnection>>>,
}

impl ActiveConnectionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, active: ActiveConnection) {
        tracing::debug!(connection = %active.connection.id(), "Active connection stored");
        if let Some(previous) = self.inner.lock().await.replace(active) {
            tracing::debug!(connection = %previous.connection.id(), "Replaced active connection");
        }
    }

    pub async fn get(&self) -> Option<ActiveConnection> {
        self.inner.lock().await.clone()
    }

    pub async fn clear(&self) {
        if let Some(previous) = self.inner.lock().await.take() {
            tracing::debug!(connection = %previous.connection.id(), "Active connection cleared");
        }
    }
}
