use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Identifier of one telephony leg. For Twilio this is the call SID.
pub type ConnectionId = String;

/// Status a connection object reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Created, not yet ringing.
    Pending,
    Ringing,
    Open,
    Closed,
    /// The SDK no longer knows the state of this leg.
    Unknown,
}

impl ConnectionStatus {
    /// Whether the leg can still carry a call.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Ringing | Self::Open)
    }
}

/// Raw events emitted by the SDK, on both the device and the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkEvent {
    Connect { call_sid: Option<String> },
    Accept { call_sid: Option<String> },
    Disconnect { call_sid: Option<String> },
    Cancel,
    Reject,
    Error { message: String },
    Mute { muted: bool },
}

/// A device-level event. The device repeats connection events, tagged with
/// the leg they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub connection: ConnectionId,
    pub event: SdkEvent,
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Address to dial (E.164 number, client name).
    pub to: String,
}

/// One telephony leg.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;
    fn status(&self) -> ConnectionStatus;
    /// Provider call id, if the provider has assigned one yet.
    fn call_sid(&self) -> Option<String>;
    /// Address on the other end (dialled number or caller id).
    fn peer(&self) -> Option<String>;
    /// Subscribe to this leg's events. The stream closes when the leg object goes away.
    fn events(&self) -> broadcast::Receiver<SdkEvent>;
    async fn accept(&self) -> Result<(), TelephonyError>;
    async fn reject(&self) -> Result<(), TelephonyError>;
    async fn disconnect(&self) -> Result<(), TelephonyError>;
    async fn mute(&self, muted: bool) -> Result<(), TelephonyError>;
}

/// The telephony device: places calls and re-broadcasts leg events.
#[async_trait]
pub trait Device: Send + Sync {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn Connection>, TelephonyError>;
    fn events(&self) -> broadcast::Receiver<DeviceEvent>;
}

#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Telephony API error: {0}")]
    Api(String),
    #[error("Connection {0} is closed")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_statuses() {
        assert!(ConnectionStatus::Pending.is_live());
        assert!(ConnectionStatus::Ringing.is_live());
        assert!(ConnectionStatus::Open.is_live());
        assert!(!ConnectionStatus::Closed.is_live());
        assert!(!ConnectionStatus::Unknown.is_live());
    }
}
