use std::time::Duration;

use super::session::{CallSession, CallStatus};
use super::timer::{Scheduler, TaskHandle, TimerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Session is not Active; nothing to watch.
    Inactive,
    Healthy,
    /// Consecutive dead polls so far.
    Missed(u32),
    /// Threshold reached: the call has to be finalized.
    Expired,
}

/// Safety net for calls that die without a terminal event.
///
/// Each poll while Active looks at the session's handle; a missing handle or a
/// handle reporting a closed/unknown status counts as a miss.
pub struct Watchdog {
    interval: Duration,
    threshold: u32,
    misses: u32,
    poll: Option<TaskHandle>,
}

impl Watchdog {
    pub fn new(interval: Duration, threshold: u32) -> Self {
        Self {
            interval,
            threshold: threshold.max(1),
            misses: 0,
            poll: None,
        }
    }

    pub fn arm(&mut self, scheduler: &Scheduler, attempt: u64) {
        self.misses = 0;
        self.poll = Some(scheduler.every(self.interval, TimerEvent::WatchdogPoll { attempt }));
    }

    pub fn disarm(&mut self) {
        self.poll = None;
        self.misses = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.poll.is_some()
    }

    pub fn poll(&mut self, session: &CallSession) -> WatchdogVerdict {
        if session.status() != CallStatus::Active {
            self.misses = 0;
            return WatchdogVerdict::Inactive;
        }

        let alive = session
            .connection()
            .is_some_and(|conn| conn.status().is_live());
        if alive {
            self.misses = 0;
            return WatchdogVerdict::Healthy;
        }

        self.misses += 1;
        if self.misses >= self.threshold {
            WatchdogVerdict::Expired
        } else {
            WatchdogVerdict::Missed(self.misses)
        }
    }
}
