use std::time::Duration;

use super::mailbox::ActiveConnectionSlot;
use super::session::{CallSession, CallStatus};
use super::timer::{Scheduler, TaskHandle, TimerEvent};
use super::CallError;
use crate::telephony::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// A live leg from the mailbox now drives the session.
    Adopted { connection: ConnectionId },
    NothingFound,
    /// The mailbox held a dead leg; it was cleared instead of adopted.
    Stale { connection: ConnectionId },
    /// The session was already seeded (live call or earlier adoption).
    AlreadySeeded,
}

/// Picks up a call that was answered before this controller existed.
///
/// The first check runs at startup. If the mailbox is empty, a short bounded
/// retry poll covers the mailbox being filled slightly later; once the budget
/// is spent the reconciler stays quiet for the rest of its life.
pub struct HydrationReconciler {
    retry_interval: Duration,
    attempts_left: u32,
    retry: Option<TaskHandle>,
    finished: bool,
}

impl HydrationReconciler {
    pub fn new(retry_interval: Duration, attempts: u32) -> Self {
        Self {
            retry_interval,
            attempts_left: attempts,
            retry: None,
            finished: false,
        }
    }

    pub async fn reconcile(
        &mut self,
        session: &mut CallSession,
        slot: &ActiveConnectionSlot,
    ) -> Result<HydrationOutcome, CallError> {
        if session.status() != CallStatus::Idle {
            return Ok(HydrationOutcome::AlreadySeeded);
        }

        let Some(active) = slot.get().await else {
            return Ok(HydrationOutcome::NothingFound);
        };

        let connection = active.connection.id().to_string();
        if !active.connection.status().is_live() {
            tracing::warn!(
                connection = %connection,
                status = ?active.connection.status(),
                "Mailbox held a dead connection, clearing"
            );
            slot.clear().await;
            return Ok(HydrationOutcome::Stale { connection });
        }

        let call_sid = active.connection.call_sid();
        let status = session.adopt_incoming(active.connection, active.record_id)?;
        if status == CallStatus::Connecting {
            session.mark_active(call_sid)?;
        }

        tracing::info!(
            connection = %connection,
            call_sid = ?session.call_sid(),
            attempt = session.attempt(),
            "Adopted active call"
        );
        Ok(HydrationOutcome::Adopted { connection })
    }

    /// Arm the retry poll. No-op once finished or already armed.
    pub fn schedule_retries(&mut self, scheduler: &Scheduler) {
        if self.finished || self.retry.is_some() || self.attempts_left == 0 {
            return;
        }
        self.retry = Some(scheduler.every(self.retry_interval, TimerEvent::HydrationRetry));
    }

    /// Spend one retry. False when the reconciler is done.
    pub fn take_attempt(&mut self) -> bool {
        if self.finished || self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.attempts_left == 0
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stop(&mut self) {
        self.retry = None;
        self.finished = true;
    }
}
