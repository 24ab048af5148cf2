use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::client::TwilioClient;
use crate::registry::ConnectionRegistry;
use crate::telephony::{
    ConnectParams, Connection, ConnectionStatus, Device, DeviceEvent, SdkEvent, TelephonyError,
};

const EVENT_CAPACITY: usize = 32;

/// Map a Twilio `CallStatus` onto the leg status and the event it raises.
pub fn status_transition(call_sid: &str, status: &str) -> Option<(ConnectionStatus, Option<SdkEvent>)> {
    let call_sid = Some(call_sid.to_string());
    let mapped = match status {
        "queued" | "initiated" => (ConnectionStatus::Pending, None),
        "ringing" => (ConnectionStatus::Ringing, None),
        "in-progress" => (ConnectionStatus::Open, Some(SdkEvent::Connect { call_sid })),
        "completed" => (ConnectionStatus::Closed, Some(SdkEvent::Disconnect { call_sid })),
        "canceled" => (ConnectionStatus::Closed, Some(SdkEvent::Cancel)),
        "busy" | "no-answer" => (ConnectionStatus::Closed, Some(SdkEvent::Reject)),
        "failed" => (
            ConnectionStatus::Closed,
            Some(SdkEvent::Error {
                message: "call failed".to_string(),
            }),
        ),
        _ => return None,
    };
    Some(mapped)
}

/// One Twilio call leg, driven by status callbacks.
///
/// Every event goes out twice: on the leg's own stream and on the device
/// stream, the way a browser voice SDK reports it.
pub struct TwilioConnection {
    call_sid: String,
    peer: Option<String>,
    status: Mutex<ConnectionStatus>,
    /// Incoming leg parked on hold TwiML until the agent picks it up.
    awaiting_accept: AtomicBool,
    muted: AtomicBool,
    events: broadcast::Sender<SdkEvent>,
    device_events: broadcast::Sender<DeviceEvent>,
    client: Arc<TwilioClient>,
}

impl TwilioConnection {
    fn new(
        call_sid: &str,
        peer: Option<String>,
        status: ConnectionStatus,
        awaiting_accept: bool,
        device_events: broadcast::Sender<DeviceEvent>,
        client: Arc<TwilioClient>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            call_sid: call_sid.to_string(),
            peer,
            status: Mutex::new(status),
            awaiting_accept: AtomicBool::new(awaiting_accept),
            muted: AtomicBool::new(false),
            events,
            device_events,
            client,
        })
    }

    pub fn sid(&self) -> &str {
        &self.call_sid
    }

    #[cfg(test)]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Apply a status callback. Returns the resulting leg status, or None for
    /// a status we do not track.
    pub fn apply_status(&self, status: &str) -> Option<ConnectionStatus> {
        let Some((next, event)) = status_transition(&self.call_sid, status) else {
            tracing::debug!(call_sid = %self.call_sid, status, "Ignoring untracked call status");
            return None;
        };

        // Our own hold TwiML answers a parked call; that is not the agent picking up.
        if next == ConnectionStatus::Open && self.awaiting_accept.load(Ordering::Relaxed) {
            return Some(self.current_status());
        }

        let previous = self.swap_status(next);
        if previous == ConnectionStatus::Closed && next == ConnectionStatus::Closed {
            return Some(next);
        }

        if let Some(event) = event {
            self.emit(event);
        }
        Some(next)
    }

    fn current_status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Unknown)
    }

    fn swap_status(&self, next: ConnectionStatus) -> ConnectionStatus {
        match self.status.lock() {
            Ok(mut status) => std::mem::replace(&mut *status, next),
            Err(_) => ConnectionStatus::Unknown,
        }
    }

    fn emit(&self, event: SdkEvent) {
        tracing::debug!(call_sid = %self.call_sid, ?event, "Connection event");
        // No receivers is fine: nobody is watching this leg yet.
        let _ = self.events.send(event.clone());
        let _ = self.device_events.send(DeviceEvent {
            connection: self.call_sid.clone(),
            event,
        });
    }
}

#[async_trait]
impl Connection for TwilioConnection {
    fn id(&self) -> &str {
        &self.call_sid
    }

    fn status(&self) -> ConnectionStatus {
        self.current_status()
    }

    fn call_sid(&self) -> Option<String> {
        Some(self.call_sid.clone())
    }

    fn peer(&self) -> Option<String> {
        self.peer.clone()
    }

    fn events(&self) -> broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    async fn accept(&self) -> Result<(), TelephonyError> {
        if !self.current_status().is_live() {
            return Err(TelephonyError::Closed(self.call_sid.clone()));
        }
        self.client.bridge(&self.call_sid).await?;

        self.awaiting_accept.store(false, Ordering::Relaxed);
        self.swap_status(ConnectionStatus::Open);
        self.emit(SdkEvent::Accept {
            call_sid: Some(self.call_sid.clone()),
        });
        Ok(())
    }

    async fn reject(&self) -> Result<(), TelephonyError> {
        // A parked call was answered by the hold TwiML, so it has to be completed.
        self.client.end_call(&self.call_sid, true).await?;
        if self.swap_status(ConnectionStatus::Closed) != ConnectionStatus::Closed {
            self.emit(SdkEvent::Reject);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TelephonyError> {
        let status = self.current_status();
        if status == ConnectionStatus::Closed {
            return Ok(());
        }
        let answered =
            status == ConnectionStatus::Open || self.awaiting_accept.load(Ordering::Relaxed);
        self.client.end_call(&self.call_sid, answered).await?;

        if self.swap_status(ConnectionStatus::Closed) != ConnectionStatus::Closed {
            self.emit(SdkEvent::Disconnect {
                call_sid: Some(self.call_sid.clone()),
            });
        }
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), TelephonyError> {
        if !self.current_status().is_live() {
            return Err(TelephonyError::Closed(self.call_sid.clone()));
        }
        // Twilio has no mute for a plain two-party call; the agent's client applies it.
        if self.muted.swap(muted, Ordering::Relaxed) == muted {
            tracing::debug!(call_sid = %self.call_sid, muted, "Mute unchanged");
        }
        self.emit(SdkEvent::Mute { muted });
        Ok(())
    }
}

/// Twilio-backed device. Places calls over REST and tracks legs by call_sid.
pub struct TwilioDevice {
    client: Arc<TwilioClient>,
    registry: ConnectionRegistry,
    events: broadcast::Sender<DeviceEvent>,
}

impl TwilioDevice {
    pub fn new(client: Arc<TwilioClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client,
            registry: ConnectionRegistry::new(),
            events,
        }
    }

    /// Track a call that just hit the voice webhook. It stays parked until accepted.
    pub async fn register_incoming(&self, call_sid: &str, from: Option<String>) -> Arc<TwilioConnection> {
        if let Some(existing) = self.registry.get(call_sid).await {
            return existing;
        }
        let connection = TwilioConnection::new(
            call_sid,
            from,
            ConnectionStatus::Ringing,
            true,
            self.events.clone(),
            self.client.clone(),
        );
        self.registry.register(connection.clone()).await;
        connection
    }

    /// Route a status callback to its leg. False if the call_sid is unknown.
    pub async fn apply_status(&self, call_sid: &str, status: &str) -> bool {
        let Some(connection) = self.registry.get(call_sid).await else {
            tracing::debug!(call_sid, status, "Status for unknown call");
            return false;
        };

        if connection.apply_status(status) == Some(ConnectionStatus::Closed) {
            self.registry.deregister(call_sid).await;
        }
        true
    }

    #[cfg(test)]
    pub async fn connection(&self, call_sid: &str) -> Option<Arc<TwilioConnection>> {
        self.registry.get(call_sid).await
    }
}

#[async_trait]
impl Device for TwilioDevice {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn Connection>, TelephonyError> {
        let call_sid = self.client.create_call(&params.to).await?;
        let connection = TwilioConnection::new(
            &call_sid,
            Some(params.to),
            ConnectionStatus::Pending,
            false,
            self.events.clone(),
            self.client.clone(),
        );
        self.registry.register(connection.clone()).await;
        Ok(connection)
    }

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
