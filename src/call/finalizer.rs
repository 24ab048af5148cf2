use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::mailbox::ActiveConnectionSlot;
use super::session::{CallSession, CallStatus, EndReason};
use super::timer::{Scheduler, TaskHandle, TimerEvent};
use crate::records::{CallRecordUpdate, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// End-of-call side effects ran for this signal.
    Finalized { duration_secs: u64, persisted: bool },
    /// The call was already handled; only the in-memory state was re-asserted.
    Synced,
    /// Nothing to end.
    Ignored,
}

/// Single entry point for every terminal signal.
///
/// The session's `end_handled` latch makes this at-most-once per attempt:
/// the first signal persists the end of the call, later ones only re-assert
/// Ended and drop stale handles.
pub struct Finalizer {
    records: Arc<dyn RecordStore>,
    slot: ActiveConnectionSlot,
    latch_release: Duration,
    release_timer: Option<TaskHandle>,
}

impl Finalizer {
    pub fn new(records: Arc<dyn RecordStore>, slot: ActiveConnectionSlot, latch_release: Duration) -> Self {
        Self {
            records,
            slot,
            latch_release,
            release_timer: None,
        }
    }

    pub async fn on_terminal_signal(
        &mut self,
        session: &mut CallSession,
        scheduler: &Scheduler,
        reason: EndReason,
        call_sid_hint: Option<&str>,
    ) -> FinalizeOutcome {
        if session.status() == CallStatus::Idle {
            tracing::debug!(?reason, "Terminal signal with no call, ignoring");
            return FinalizeOutcome::Ignored;
        }

        if session.end_handled() || !session.status().is_live() {
            if session.force_ended(reason).is_some() {
                tracing::warn!(attempt = session.attempt(), "Dropped stale connection handle");
            }
            self.slot.clear().await;
            tracing::debug!(
                attempt = session.attempt(),
                ?reason,
                "Call already finalized, state re-synced"
            );
            return FinalizeOutcome::Synced;
        }

        session.set_end_handled();
        if let Some(hint) = call_sid_hint {
            session.set_call_sid(hint.to_string());
        }

        let finalized = match session.finalize(reason) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("Finalize refused: {e}");
                return FinalizeOutcome::Synced;
            }
        };
        // Handle is released here; the SDK object goes with it.
        drop(finalized.connection);

        self.slot.clear().await;
        self.release_timer = Some(scheduler.after(
            self.latch_release,
            TimerEvent::LatchRelease {
                attempt: finalized.attempt,
            },
        ));

        tracing::info!(
            attempt = finalized.attempt,
            call_sid = ?finalized.call_sid,
            duration_secs = finalized.elapsed_secs,
            reason = ?finalized.reason,
            "Call ended"
        );

        let Some(record_id) = finalized.record_id else {
            tracing::warn!(attempt = finalized.attempt, "Call ended without a record to update");
            return FinalizeOutcome::Finalized {
                duration_secs: finalized.elapsed_secs,
                persisted: false,
            };
        };

        let update = CallRecordUpdate {
            ended_at: Some(Utc::now()),
            duration_secs: Some(finalized.elapsed_secs),
            call_sid: finalized.call_sid,
            outcome: None,
        };

        // The call is over either way; a failed write leaves the record stale.
        let persisted = match self.records.update_record(&record_id, update).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(record_id = %record_id, "Failed to persist call end: {e}");
                false
            }
        };

        FinalizeOutcome::Finalized {
            duration_secs: finalized.elapsed_secs,
            persisted,
        }
    }

    /// Latch release timer fired. Only applies to the attempt it was armed for.
    pub fn release_latch(&mut self, session: &mut CallSession, attempt: u64) {
        if session.attempt() != attempt || session.status() != CallStatus::Ended {
            return;
        }
        self.release_timer = None;
        session.release_end_latch();
        tracing::debug!(attempt, "End-of-call latch released");
    }

    /// A new attempt or a reset supersedes any pending release.
    pub fn cancel_release(&mut self) {
        self.release_timer = None;
    }
}
