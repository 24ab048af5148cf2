use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::telephony::{Connection, ConnectionId, Device, SdkEvent};

/// Normalized event kinds relayed to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Disconnected,
    Cancelled,
    Rejected,
    Failed,
    MuteChanged,
    /// The leg's event stream closed: the SDK object is gone. Not terminal.
    Detached,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Cancelled | Self::Rejected | Self::Failed
        )
    }
}

/// Which SDK object the event was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Device,
    Connection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPayload {
    pub call_sid: Option<String>,
    pub error: Option<String>,
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub kind: EventKind,
    pub connection: ConnectionId,
    pub origin: EventOrigin,
    pub payload: EventPayload,
}

impl CallEvent {
    pub fn normalize(connection: &str, origin: EventOrigin, event: &SdkEvent) -> Self {
        let mut payload = EventPayload::default();
        let kind = match event {
            SdkEvent::Connect { call_sid } | SdkEvent::Accept { call_sid } => {
                payload.call_sid = call_sid.clone();
                EventKind::Connected
            }
            SdkEvent::Disconnect { call_sid } => {
                payload.call_sid = call_sid.clone();
                EventKind::Disconnected
            }
            SdkEvent::Cancel => EventKind::Cancelled,
            SdkEvent::Reject => EventKind::Rejected,
            SdkEvent::Error { message } => {
                payload.error = Some(message.clone());
                EventKind::Failed
            }
            SdkEvent::Mute { muted } => {
                payload.muted = Some(*muted);
                EventKind::MuteChanged
            }
        };

        Self {
            kind,
            connection: connection.to_string(),
            origin,
            payload,
        }
    }

    fn detached(connection: &str) -> Self {
        Self {
            kind: EventKind::Detached,
            connection: connection.to_string(),
            origin: EventOrigin::Connection,
            payload: EventPayload::default(),
        }
    }
}

/// Relays device-level and connection-level SDK events as [`CallEvent`]s.
///
/// Does not interpret or de-duplicate: one hangup usually arrives twice,
/// once per origin.
pub struct EventSourceAdapter {
    tx: mpsc::UnboundedSender<CallEvent>,
    device: Option<CancellationToken>,
    connections: HashMap<ConnectionId, CancellationToken>,
}

impl EventSourceAdapter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                device: None,
                connections: HashMap::new(),
            },
            rx,
        )
    }

    /// Listen to the device. Returns false if already attached.
    pub fn attach_device(&mut self, device: &dyn Device) -> bool {
        if self.device.is_some() {
            return false;
        }

        let mut rx = device.events();
        let tx = self.tx.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            let event = CallEvent::normalize(&ev.connection, EventOrigin::Device, &ev.event);
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Device event listener lagged");
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!("Device event stream closed");
                            return;
                        }
                    },
                }
            }
        });

        self.device = Some(cancel);
        true
    }

    /// Listen to one leg. Subscribing the same leg twice is a no-op and
    /// returns false.
    pub fn subscribe(&mut self, connection: &Arc<dyn Connection>) -> bool {
        let id = connection.id().to_string();
        if self.connections.contains_key(&id) {
            tracing::debug!(connection = %id, "Listeners already attached");
            return false;
        }

        // Subscribe before spawning so nothing emitted from here on is missed
        let mut rx = connection.events();
        let tx = self.tx.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let conn_id = id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            let event = CallEvent::normalize(&conn_id, EventOrigin::Connection, &ev);
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!(connection = %conn_id, skipped = n, "Connection event listener lagged");
                        }
                        Err(RecvError::Closed) => {
                            tracing::debug!(connection = %conn_id, "Connection event stream closed");
                            let _ = tx.send(CallEvent::detached(&conn_id));
                            return;
                        }
                    },
                }
            }
        });

        tracing::debug!(connection = %id, "Listeners attached");
        self.connections.insert(id, cancel);
        true
    }

    /// Stop listening to a leg. Safe for legs that were never subscribed.
    pub fn unsubscribe(&mut self, id: &str) {
        if let Some(token) = self.connections.remove(id) {
            token.cancel();
            tracing::debug!(connection = %id, "Listeners detached");
        }
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn shutdown(&mut self) {
        if let Some(token) = self.device.take() {
            token.cancel();
        }
        for (_, token) in self.connections.drain() {
            token.cancel();
        }
    }
}

impl Drop for EventSourceAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony::DeviceEvent;
    use crate::testing::{FakeConnection, FakeDevice};

    #[test]
    fn normalizes_every_sdk_event() {
        let cases = [
            (SdkEvent::Connect { call_sid: Some("CA1".into()) }, EventKind::Connected),
            (SdkEvent::Accept { call_sid: None }, EventKind::Connected),
            (SdkEvent::Disconnect { call_sid: None }, EventKind::Disconnected),
            (SdkEvent::Cancel, EventKind::Cancelled),
            (SdkEvent::Reject, EventKind::Rejected),
            (SdkEvent::Error { message: "boom".into() }, EventKind::Failed),
            (SdkEvent::Mute { muted: true }, EventKind::MuteChanged),
        ];
        for (sdk, kind) in cases {
            let event = CallEvent::normalize("c1", EventOrigin::Connection, &sdk);
            assert_eq!(event.kind, kind, "{sdk:?}");
            assert_eq!(event.connection, "c1");
        }
    }

    #[test]
    fn payload_carries_details() {
        let ev = CallEvent::normalize(
            "c1",
            EventOrigin::Device,
            &SdkEvent::Disconnect {
                call_sid: Some("CA9".into()),
            },
        );
        assert_eq!(ev.payload.call_sid.as_deref(), Some("CA9"));
        assert_eq!(ev.origin, EventOrigin::Device);

        let ev = CallEvent::normalize(
            "c1",
            EventOrigin::Connection,
            &SdkEvent::Error {
                message: "ICE failed".into(),
            },
        );
        assert_eq!(ev.payload.error.as_deref(), Some("ICE failed"));
    }

    #[test]
    fn terminal_kinds() {
        assert!(EventKind::Disconnected.is_terminal());
        assert!(EventKind::Cancelled.is_terminal());
        assert!(EventKind::Rejected.is_terminal());
        assert!(EventKind::Failed.is_terminal());
        assert!(!EventKind::Connected.is_terminal());
        assert!(!EventKind::MuteChanged.is_terminal());
        assert!(!EventKind::Detached.is_terminal());
    }

    #[tokio::test]
    async fn double_subscribe_does_not_duplicate_events() {
        let (mut adapter, mut rx) = EventSourceAdapter::new();
        let fake = FakeConnection::new("c1");
        let conn: Arc<dyn Connection> = fake.clone();

        assert!(adapter.subscribe(&conn));
        assert!(!adapter.subscribe(&conn));

        fake.emit(SdkEvent::Disconnect { call_sid: None });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Disconnected);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_safe_without_subscription() {
        let (mut adapter, _rx) = EventSourceAdapter::new();
        adapter.unsubscribe("never-seen");
        assert!(!adapter.is_subscribed("never-seen"));
    }

    #[tokio::test]
    async fn unsubscribed_leg_is_silent() {
        let (mut adapter, mut rx) = EventSourceAdapter::new();
        let fake = FakeConnection::new("c1");
        let conn: Arc<dyn Connection> = fake.clone();
        adapter.subscribe(&conn);
        adapter.unsubscribe("c1");
        tokio::task::yield_now().await;

        fake.emit(SdkEvent::Cancel);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn device_and_connection_both_relay() {
        let (mut adapter, mut rx) = EventSourceAdapter::new();
        let device = FakeDevice::new();
        let fake = FakeConnection::new("c1");
        let conn: Arc<dyn Connection> = fake.clone();
        adapter.attach_device(device.as_ref());
        adapter.subscribe(&conn);

        fake.emit(SdkEvent::Disconnect { call_sid: None });
        device.emit(DeviceEvent {
            connection: "c1".into(),
            event: SdkEvent::Disconnect { call_sid: None },
        });

        let mut origins = vec![rx.recv().await.unwrap().origin, rx.recv().await.unwrap().origin];
        origins.sort_by_key(|o| *o == EventOrigin::Device);
        assert_eq!(origins, vec![EventOrigin::Connection, EventOrigin::Device]);
    }

    #[tokio::test]
    async fn closed_stream_relays_detached() {
        let (mut adapter, mut rx) = EventSourceAdapter::new();
        let fake = FakeConnection::new("c1");
        let conn: Arc<dyn Connection> = fake.clone();
        adapter.subscribe(&conn);

        fake.close_events();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Detached);
        assert_eq!(event.connection, "c1");
    }
}
