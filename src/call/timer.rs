use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A timer firing, delivered to the controller loop. Attempt-scoped firings
/// carry the attempt they were armed for so late ones can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Tick { attempt: u64 },
    WatchdogPoll { attempt: u64 },
    LatchRelease { attempt: u64 },
    HydrationRetry,
}

/// Owned handle to a scheduled task. Dropping it cancels the task.
pub struct TaskHandle {
    cancel: CancellationToken,
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns timers that report back to the controller through one channel.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire `event` every `period`, first firing one period from now.
    pub fn every(&self, period: Duration, event: TimerEvent) -> TaskHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        if tx.send(event).is_err() {
                            return; // controller gone
                        }
                    }
                }
            }
        });

        TaskHandle { cancel }
    }

    /// Fire `event` once after `delay`.
    pub fn after(&self, delay: Duration, event: TimerEvent) -> TaskHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep(delay) => {
                    let _ = tx.send(event);
                }
            }
        });

        TaskHandle { cancel }
    }
}
