//! In-memory telephony and record store used by unit tests, plus a ready
//! [`AppState`] for handler tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::call::{ActiveConnectionSlot, CallController};
use crate::config::Config;
use crate::records::{CallRecordUpdate, NewCallRecord, RecordError, RecordId, RecordStore};
use crate::telephony::{
    ConnectParams, Connection, ConnectionStatus, Device, DeviceEvent, SdkEvent, TelephonyError,
};
use crate::twilio::client::TwilioClient;
use crate::twilio::device::TwilioDevice;
use crate::AppState;

pub const TOKEN: &str = "test-token";

pub fn test_config() -> Config {
    let raw = format!(
        r#"
[server]
host = "127.0.0.1"
port = 0
external_url = "https://desk.example.com"

[twilio]
account_sid = "AC123"
auth_token = "secret"
phone_number = "+15550000"
agent_number = "client:agent"

[records]
base_url = "https://records.example.com"
api_key = "key"

[api]
token = "{TOKEN}"
"#
    );
    toml::from_str(&raw).unwrap()
}

/// App state over a running controller. The controller talks to the fakes;
/// `state.device` is a real (offline) Twilio device for webhook tests.
pub struct TestDesk {
    pub state: AppState,
    pub device: Arc<FakeDevice>,
    pub records: Arc<FakeRecordStore>,
}

pub fn test_state() -> TestDesk {
    let config = test_config();
    let device = FakeDevice::new();
    let records = FakeRecordStore::new();
    let controller = CallController::new(
        &config.controller,
        device.clone(),
        records.clone(),
        ActiveConnectionSlot::new(),
    )
    .spawn();
    let twilio = Arc::new(TwilioClient::new(&config.twilio, &config.server.external_url));

    TestDesk {
        state: AppState {
            config,
            controller,
            device: Arc::new(TwilioDevice::new(twilio)),
        },
        device,
        records,
    }
}

pub async fn read_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub struct FakeConnection {
    id: String,
    status: Mutex<ConnectionStatus>,
    call_sid: Mutex<Option<String>>,
    peer: Mutex<Option<String>>,
    events: Mutex<Option<broadcast::Sender<SdkEvent>>>,
    actions: Mutex<Vec<String>>,
    fail_accept: AtomicBool,
    fail_disconnect: AtomicBool,
}

impl FakeConnection {
    pub fn new(id: &str) -> Arc<Self> {
        let (tx, _) = broadcast::channel(16);
        Arc::new(Self {
            id: id.to_string(),
            status: Mutex::new(ConnectionStatus::Pending),
            call_sid: Mutex::new(None),
            peer: Mutex::new(None),
            events: Mutex::new(Some(tx)),
            actions: Mutex::new(Vec::new()),
            fail_accept: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
        })
    }

    pub fn open(id: &str, call_sid: &str) -> Arc<Self> {
        let conn = Self::new(id);
        conn.set_status(ConnectionStatus::Open);
        conn.set_call_sid(call_sid);
        conn
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_call_sid(&self, sid: &str) {
        *self.call_sid.lock().unwrap() = Some(sid.to_string());
    }

    pub fn set_peer(&self, peer: &str) {
        *self.peer.lock().unwrap() = Some(peer.to_string());
    }

    pub fn emit(&self, event: SdkEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Drop the event sender, as if the SDK object was destroyed.
    pub fn close_events(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn fail_accepts(&self) {
        self.fail_accept.store(true, Ordering::Relaxed);
    }

    pub fn fail_disconnects(&self) {
        self.fail_disconnect.store(true, Ordering::Relaxed);
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, action: &str) {
        self.actions.lock().unwrap().push(action.to_string());
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    fn call_sid(&self) -> Option<String> {
        self.call_sid.lock().unwrap().clone()
    }

    fn peer(&self) -> Option<String> {
        self.peer.lock().unwrap().clone()
    }

    fn events(&self) -> broadcast::Receiver<SdkEvent> {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn accept(&self) -> Result<(), TelephonyError> {
        self.record("accept");
        if self.fail_accept.load(Ordering::Relaxed) {
            return Err(TelephonyError::Api("call no longer exists".into()));
        }
        self.set_status(ConnectionStatus::Open);
        Ok(())
    }

    async fn reject(&self) -> Result<(), TelephonyError> {
        self.record("reject");
        self.set_status(ConnectionStatus::Closed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TelephonyError> {
        self.record("disconnect");
        if self.fail_disconnect.load(Ordering::Relaxed) {
            return Err(TelephonyError::Request("connection reset".into()));
        }
        self.set_status(ConnectionStatus::Closed);
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), TelephonyError> {
        self.record(if muted { "mute" } else { "unmute" });
        self.emit(SdkEvent::Mute { muted });
        Ok(())
    }
}

pub struct FakeDevice {
    events: broadcast::Sender<DeviceEvent>,
    dialled: Mutex<Vec<String>>,
    created: Mutex<Vec<Arc<FakeConnection>>>,
    fail_connect: AtomicBool,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            events,
            dialled: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
        })
    }

    pub fn fail_connects(&self) {
        self.fail_connect.store(true, Ordering::Relaxed);
    }

    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub fn dialled(&self) -> Vec<String> {
        self.dialled.lock().unwrap().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn Connection>, TelephonyError> {
        self.dialled.lock().unwrap().push(params.to.clone());
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(TelephonyError::Api("connect refused".into()));
        }

        let n = self.created.lock().unwrap().len() + 1;
        let conn = FakeConnection::new(&format!("conn-{n}"));
        conn.set_peer(&params.to);
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakeRecordStore {
    next_id: AtomicU64,
    created: Mutex<Vec<NewCallRecord>>,
    updates: Mutex<Vec<(RecordId, CallRecordUpdate)>>,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
}

impl FakeRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::Relaxed);
    }

    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::Relaxed);
    }

    pub fn created(&self) -> Vec<NewCallRecord> {
        self.created.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(RecordId, CallRecordUpdate)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn create_record(&self, record: NewCallRecord) -> Result<RecordId, RecordError> {
        if self.fail_creates.load(Ordering::Relaxed) {
            return Err(RecordError::Request("connection refused".into()));
        }
        self.created.lock().unwrap().push(record);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("rec-{id}"))
    }

    async fn update_record(&self, id: &str, update: CallRecordUpdate) -> Result<(), RecordError> {
        // Failed writes are still counted: the attempt was made.
        self.updates.lock().unwrap().push((id.to_string(), update));
        if self.fail_updates.load(Ordering::Relaxed) {
            return Err(RecordError::Api("HTTP 503: unavailable".into()));
        }
        Ok(())
    }
}
