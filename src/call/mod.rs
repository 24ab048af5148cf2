//! Call lifecycle controller.
//!
//! One [`CallController`] owns the [`session::CallSession`] and every timer
//! around it. Terminal signals from the [`adapter::EventSourceAdapter`], the
//! [`watchdog::Watchdog`] and the agent's own hang-up all funnel into the
//! [`finalizer::Finalizer`], whose latch turns at-least-once delivery into
//! at-most-once persistence.

pub mod adapter;
pub mod controller;
pub mod finalizer;
pub mod hydration;
pub mod mailbox;
pub mod session;
pub mod timer;
pub mod watchdog;

pub use controller::{CallController, ControllerHandle};
pub use mailbox::ActiveConnectionSlot;
pub use session::CallStatus;

use crate::records::RecordError;
use crate::telephony::TelephonyError;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Cannot {op} while call is {from:?}")]
    InvalidTransition { op: &'static str, from: CallStatus },
    #[error("Call attempt {attempt} was already finalized")]
    DoubleFinalize { attempt: u64 },
    #[error("Failed to persist call record: {0}")]
    PersistenceFailure(#[from] RecordError),
    #[error(transparent)]
    Telephony(#[from] TelephonyError),
    #[error("No incoming call waiting")]
    NoPendingIncoming,
    #[error("No call to act on")]
    NoActiveCall,
    #[error("Call controller has stopped")]
    Stopped,
}
