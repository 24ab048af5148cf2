use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::adapter::EventKind;
use super::CallError;
use crate::records::{CallDirection, RecordId};
use crate::telephony::{Connection, ConnectionId, ConnectionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    Ended,
}

impl CallStatus {
    /// Connecting or Active: a terminal signal still has something to end.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }
}

/// Why a call attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Disconnected,
    Cancelled,
    Rejected,
    Failed,
    UserHangup,
    WatchdogTimeout,
    ConnectFailed,
}

impl EndReason {
    /// Reason for a terminal adapter event. `None` for non-terminal kinds.
    pub fn from_event(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Disconnected => Some(Self::Disconnected),
            EventKind::Cancelled => Some(Self::Cancelled),
            EventKind::Rejected => Some(Self::Rejected),
            EventKind::Failed => Some(Self::Failed),
            EventKind::Connected | EventKind::MuteChanged | EventKind::Detached => None,
        }
    }
}

/// What `finalize` hands back: the attempt's identifiers and the released handle.
pub struct FinalizedCall {
    pub attempt: u64,
    pub record_id: Option<RecordId>,
    pub call_sid: Option<String>,
    pub elapsed_secs: u64,
    pub reason: EndReason,
    pub connection: Option<Arc<dyn Connection>>,
}

/// Serializable view of the session for the API and for tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub attempt: u64,
    pub direction: Option<CallDirection>,
    pub target: Option<String>,
    pub connection_id: Option<ConnectionId>,
    pub has_connection: bool,
    pub call_sid: Option<String>,
    pub record_id: Option<RecordId>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub muted: bool,
    pub end_reason: Option<EndReason>,
    pub end_handled: bool,
    pub pending_incoming: Option<ConnectionId>,
}

/// Single source of truth for the current call attempt.
///
/// Pure state: no timers, no I/O. Every mutator checks the current status and
/// returns [`CallError::InvalidTransition`] when the move is not allowed.
#[derive(Default)]
pub struct CallSession {
    status: CallStatus,
    attempt: u64,
    direction: Option<CallDirection>,
    target: Option<String>,
    connection: Option<Arc<dyn Connection>>,
    /// Kept after the handle is released so late events for this leg still
    /// reach the finalizer.
    connection_id: Option<ConnectionId>,
    call_sid: Option<String>,
    record_id: Option<RecordId>,
    started_at: Option<DateTime<Utc>>,
    elapsed_secs: u64,
    end_handled: bool,
    end_reason: Option<EndReason>,
    muted: bool,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn call_sid(&self) -> Option<&str> {
        self.call_sid.as_deref()
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_secs
    }

    pub fn end_handled(&self) -> bool {
        self.end_handled
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Whether `id` is the leg of the current (or just-ended) attempt.
    pub fn owns(&self, id: &str) -> bool {
        self.connection_id.as_deref() == Some(id)
    }

    /// Begin an outgoing attempt. The record is created by the caller first.
    pub fn start_outgoing(&mut self, target: &str, record_id: RecordId) -> Result<u64, CallError> {
        if !matches!(self.status, CallStatus::Idle | CallStatus::Ended) {
            return Err(self.invalid("start an outgoing call"));
        }

        self.begin_attempt(CallDirection::Outbound);
        self.target = Some(target.to_string());
        self.record_id = Some(record_id);
        self.status = CallStatus::Connecting;
        Ok(self.attempt)
    }

    /// Store the leg an outgoing attempt got back from the device.
    pub fn attach_connection(&mut self, connection: Arc<dyn Connection>) -> Result<(), CallError> {
        if self.status != CallStatus::Connecting {
            return Err(self.invalid("attach a connection"));
        }
        self.connection_id = Some(connection.id().to_string());
        self.connection = Some(connection);
        Ok(())
    }

    /// Take over a leg that was answered elsewhere (live accept or hydration).
    ///
    /// Goes straight to Active when the leg already reports itself open.
    pub fn adopt_incoming(
        &mut self,
        connection: Arc<dyn Connection>,
        record_id: RecordId,
    ) -> Result<CallStatus, CallError> {
        if self.status != CallStatus::Idle {
            return Err(self.invalid("adopt an incoming call"));
        }

        self.begin_attempt(CallDirection::Inbound);
        self.target = connection.peer();
        self.record_id = Some(record_id);
        self.connection_id = Some(connection.id().to_string());
        self.status = if connection.status() == ConnectionStatus::Open {
            self.call_sid = connection.call_sid();
            CallStatus::Active
        } else {
            CallStatus::Connecting
        };
        self.connection = Some(connection);
        Ok(self.status)
    }

    pub fn mark_active(&mut self, call_sid: Option<String>) -> Result<(), CallError> {
        if self.status != CallStatus::Connecting {
            return Err(self.invalid("mark the call active"));
        }
        self.status = CallStatus::Active;
        if let Some(sid) = call_sid {
            self.set_call_sid(sid);
        }
        Ok(())
    }

    /// Record the provider call id. Returns false if one was already set.
    pub fn set_call_sid(&mut self, sid: String) -> bool {
        if self.call_sid.is_some() {
            return false;
        }
        self.call_sid = Some(sid);
        true
    }

    /// Count one second of talk time. Late ticks outside Active are ignored.
    pub fn tick(&mut self) -> bool {
        if self.status != CallStatus::Active {
            return false;
        }
        self.elapsed_secs += 1;
        true
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn set_end_handled(&mut self) {
        self.end_handled = true;
    }

    pub fn release_end_latch(&mut self) {
        self.end_handled = false;
    }

    /// End the attempt and release the handle. Call once per attempt.
    pub fn finalize(&mut self, reason: EndReason) -> Result<FinalizedCall, CallError> {
        match self.status {
            CallStatus::Connecting | CallStatus::Active => {}
            CallStatus::Ended => {
                return Err(CallError::DoubleFinalize {
                    attempt: self.attempt,
                })
            }
            CallStatus::Idle => return Err(self.invalid("finalize the call")),
        }

        self.status = CallStatus::Ended;
        self.end_reason = Some(reason);
        Ok(FinalizedCall {
            attempt: self.attempt,
            record_id: self.record_id.clone(),
            call_sid: self.call_sid.clone(),
            elapsed_secs: self.elapsed_secs,
            reason,
            connection: self.connection.take(),
        })
    }

    /// Re-assert Ended without side effects and drop any handle still held.
    /// Idle is left alone.
    pub fn force_ended(&mut self, reason: EndReason) -> Option<Arc<dyn Connection>> {
        if self.status.is_live() {
            self.status = CallStatus::Ended;
            self.end_reason.get_or_insert(reason);
        }
        if self.status == CallStatus::Ended {
            self.connection.take()
        } else {
            None
        }
    }

    /// Forget the handle without ending the call. The watchdog decides what
    /// happens next.
    pub fn detach_connection(&mut self) -> Option<Arc<dyn Connection>> {
        self.connection.take()
    }

    /// Ended → Idle, clearing everything tied to the finished attempt.
    pub fn reset(&mut self) -> Result<(), CallError> {
        if self.status != CallStatus::Ended {
            return Err(self.invalid("reset the call"));
        }
        self.clear_attempt();
        self.status = CallStatus::Idle;
        Ok(())
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            attempt: self.attempt,
            direction: self.direction,
            target: self.target.clone(),
            connection_id: self.connection_id.clone(),
            has_connection: self.connection.is_some(),
            call_sid: self.call_sid.clone(),
            record_id: self.record_id.clone(),
            started_at: self.started_at,
            elapsed_secs: self.elapsed_secs,
            muted: self.muted,
            end_reason: self.end_reason,
            end_handled: self.end_handled,
            pending_incoming: None,
        }
    }

    fn begin_attempt(&mut self, direction: CallDirection) {
        self.clear_attempt();
        self.attempt += 1;
        self.direction = Some(direction);
        self.started_at = Some(Utc::now());
    }

    fn clear_attempt(&mut self) {
        self.direction = None;
        self.target = None;
        self.connection = None;
        self.connection_id = None;
        self.call_sid = None;
        self.record_id = None;
        self.started_at = None;
        self.elapsed_secs = 0;
        self.end_handled = false;
        self.end_reason = None;
        self.muted = false;
    }

    fn invalid(&self, op: &'static str) -> CallError {
        CallError::InvalidTransition {
            op,
            from: self.status,
        }
    }
}
