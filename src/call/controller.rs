use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use super::adapter::{CallEvent, EventKind, EventSourceAdapter};
use super::finalizer::{FinalizeOutcome, Finalizer};
use super::hydration::{HydrationOutcome, HydrationReconciler};
use super::mailbox::{ActiveConnection, ActiveConnectionSlot};
use super::session::{CallSession, CallSnapshot, CallStatus, EndReason};
use super::timer::{Scheduler, TaskHandle, TimerEvent};
use super::watchdog::{Watchdog, WatchdogVerdict};
use super::CallError;
use crate::config::ControllerConfig;
use crate::records::{CallDirection, CallRecordUpdate, NewCallRecord, RecordStore};
use crate::telephony::{ConnectParams, Connection, Device};

enum Command {
    StartOutgoing {
        to: String,
        reply: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },
    OfferIncoming {
        connection: Arc<dyn Connection>,
    },
    AcceptIncoming {
        reply: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },
    RejectIncoming {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },
    RecordOutcome {
        outcome: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
}

/// Drives one desk's calls.
///
/// Owns every piece of call state and runs as a single task: commands,
/// adapter events and timer firings are handled one at a time, so no
/// transition ever interleaves with another.
pub struct CallController {
    session: CallSession,
    adapter: EventSourceAdapter,
    events: mpsc::UnboundedReceiver<CallEvent>,
    finalizer: Finalizer,
    watchdog: Watchdog,
    hydration: HydrationReconciler,
    scheduler: Scheduler,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    duration_timer: Option<TaskHandle>,
    tick_interval: Duration,
    device: Arc<dyn Device>,
    records: Arc<dyn RecordStore>,
    slot: ActiveConnectionSlot,
    pending_incoming: Option<Arc<dyn Connection>>,
}

impl CallController {
    pub fn new(
        config: &ControllerConfig,
        device: Arc<dyn Device>,
        records: Arc<dyn RecordStore>,
        slot: ActiveConnectionSlot,
    ) -> Self {
        let (mut adapter, events) = EventSourceAdapter::new();
        adapter.attach_device(device.as_ref());
        let (scheduler, timers) = Scheduler::new();

        Self {
            session: CallSession::new(),
            adapter,
            events,
            finalizer: Finalizer::new(records.clone(), slot.clone(), config.latch_release()),
            watchdog: Watchdog::new(config.watchdog_interval(), config.watchdog_miss_threshold),
            hydration: HydrationReconciler::new(config.hydration_retry(), config.hydration_attempts),
            scheduler,
            timers,
            duration_timer: None,
            tick_interval: config.tick_interval(),
            device,
            records,
            slot,
            pending_incoming: None,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let mut snapshot = self.session.snapshot();
        snapshot.pending_incoming = self
            .pending_incoming
            .as_ref()
            .map(|conn| conn.id().to_string());
        snapshot
    }

    /// Dial `to`. The call record is created before the device is asked to connect.
    pub async fn start_outgoing(&mut self, to: &str) -> Result<CallSnapshot, CallError> {
        let from = self.session.status();
        if !matches!(from, CallStatus::Idle | CallStatus::Ended) {
            return Err(CallError::InvalidTransition {
                op: "start an outgoing call",
                from,
            });
        }

        let record_id = self
            .records
            .create_record(NewCallRecord {
                direction: CallDirection::Outbound,
                target: to.to_string(),
                started_at: Utc::now(),
            })
            .await?;

        self.retire_attempt();
        let attempt = self.session.start_outgoing(to, record_id)?;
        tracing::info!(attempt, to, "Dialing");

        match self
            .device
            .connect(ConnectParams { to: to.to_string() })
            .await
        {
            Ok(connection) => {
                self.adapter.subscribe(&connection);
                self.session.attach_connection(connection)?;
            }
            Err(e) => {
                tracing::error!(attempt, "Failed to connect: {e}");
                self.finish(EndReason::ConnectFailed, None).await;
                return Err(e.into());
            }
        }

        Ok(self.snapshot())
    }

    /// An incoming leg is ringing. The most recent offer wins.
    pub fn offer_incoming(&mut self, connection: Arc<dyn Connection>) {
        tracing::info!(
            connection = %connection.id(),
            from = ?connection.peer(),
            "Incoming call offered"
        );
        if let Some(previous) = self.pending_incoming.replace(connection) {
            tracing::debug!(connection = %previous.id(), "Superseded pending incoming call");
        }
    }

    pub async fn accept_incoming(&mut self) -> Result<CallSnapshot, CallError> {
        let connection = self
            .pending_incoming
            .clone()
            .ok_or(CallError::NoPendingIncoming)?;

        let from = self.session.status();
        if !matches!(from, CallStatus::Idle | CallStatus::Ended) {
            return Err(CallError::InvalidTransition {
                op: "accept an incoming call",
                from,
            });
        }

        let target = connection
            .peer()
            .unwrap_or_else(|| connection.id().to_string());
        let record_id = self
            .records
            .create_record(NewCallRecord {
                direction: CallDirection::Inbound,
                target,
                started_at: Utc::now(),
            })
            .await?;

        if let Err(e) = connection.accept().await {
            tracing::error!(connection = %connection.id(), "Failed to accept incoming call: {e}");
            self.close_unanswered_record(&record_id).await;
            return Err(e.into());
        }
        self.pending_incoming = None;

        // Answering moves on from a finished call
        if self.session.status() == CallStatus::Ended {
            self.reset()?;
        }
        self.retire_attempt();
        let status = self
            .session
            .adopt_incoming(connection.clone(), record_id.clone())?;
        self.adapter.subscribe(&connection);
        self.slot
            .set(ActiveConnection {
                connection,
                record_id,
            })
            .await;
        self.sync_timers();

        tracing::info!(attempt = self.session.attempt(), ?status, "Incoming call accepted");
        Ok(self.snapshot())
    }

    /// End a record whose call never got answered on this desk.
    async fn close_unanswered_record(&self, record_id: &str) {
        let update = CallRecordUpdate {
            ended_at: Some(Utc::now()),
            duration_secs: Some(0),
            ..Default::default()
        };
        if let Err(e) = self.records.update_record(record_id, update).await {
            tracing::error!(record_id, "Failed to close unanswered record: {e}");
        }
    }

    pub async fn reject_incoming(&mut self) -> Result<(), CallError> {
        let connection = self
            .pending_incoming
            .take()
            .ok_or(CallError::NoPendingIncoming)?;

        if let Err(e) = connection.reject().await {
            self.pending_incoming = Some(connection);
            return Err(e.into());
        }
        tracing::info!(connection = %connection.id(), "Incoming call rejected");
        Ok(())
    }

    /// Hang up (or cancel while still connecting).
    pub async fn hang_up(&mut self) -> Result<CallSnapshot, CallError> {
        let from = self.session.status();
        if !from.is_live() {
            return Err(CallError::InvalidTransition { op: "hang up", from });
        }

        if let Some(connection) = self.session.connection().cloned() {
            if let Err(e) = connection.disconnect().await {
                tracing::warn!(attempt = self.session.attempt(), "Disconnect failed, ending call anyway: {e}");
            }
        }
        self.finish(EndReason::UserHangup, None).await;
        Ok(self.snapshot())
    }

    pub async fn set_muted(&mut self, muted: bool) -> Result<CallSnapshot, CallError> {
        let from = self.session.status();
        if from != CallStatus::Active {
            return Err(CallError::InvalidTransition {
                op: "change mute",
                from,
            });
        }
        let connection = self
            .session
            .connection()
            .cloned()
            .ok_or(CallError::NoActiveCall)?;

        connection.mute(muted).await?;
        // The SDK echo sets the same value again.
        self.session.set_muted(muted);
        Ok(self.snapshot())
    }

    /// Write the agent's outcome tag to the current attempt's record.
    pub async fn record_outcome(&mut self, outcome: String) -> Result<(), CallError> {
        let record_id = self
            .session
            .record_id()
            .map(str::to_string)
            .ok_or(CallError::NoActiveCall)?;

        self.records
            .update_record(
                &record_id,
                CallRecordUpdate {
                    outcome: Some(outcome),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Ended → Idle: the agent moved on to the next contact.
    pub fn reset(&mut self) -> Result<CallSnapshot, CallError> {
        let previous = self.session.connection_id().map(str::to_string);
        self.session.reset()?;

        if let Some(id) = previous {
            self.adapter.unsubscribe(&id);
        }
        self.finalizer.cancel_release();
        self.sync_timers();
        tracing::info!("Call reset");
        Ok(self.snapshot())
    }

    pub async fn handle_event(&mut self, event: CallEvent) {
        if !self.session.owns(&event.connection) {
            self.handle_foreign_event(&event);
            return;
        }

        match event.kind {
            EventKind::Connected => self.on_connected(event.payload.call_sid).await,
            EventKind::MuteChanged => {
                if let Some(muted) = event.payload.muted {
                    self.session.set_muted(muted);
                }
            }
            EventKind::Detached => self.on_detached().await,
            kind => {
                let Some(reason) = EndReason::from_event(kind) else {
                    return;
                };
                if let Some(ref error) = event.payload.error {
                    tracing::warn!(attempt = self.session.attempt(), error = %error, "Call failed");
                }
                let outcome = self.finish(reason, event.payload.call_sid.as_deref()).await;
                tracing::debug!(origin = ?event.origin, ?outcome, "Terminal event handled");
            }
        }
    }

    pub async fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Tick { attempt } => {
                if attempt == self.session.attempt() {
                    self.session.tick();
                }
            }
            TimerEvent::WatchdogPoll { attempt } => {
                if attempt != self.session.attempt() {
                    return;
                }
                match self.watchdog.poll(&self.session) {
                    WatchdogVerdict::Expired => {
                        tracing::warn!(attempt, "No live connection, ending call");
                        self.finish(EndReason::WatchdogTimeout, None).await;
                    }
                    WatchdogVerdict::Missed(misses) => {
                        tracing::debug!(attempt, misses, "Watchdog found no live connection");
                    }
                    WatchdogVerdict::Healthy | WatchdogVerdict::Inactive => {}
                }
            }
            TimerEvent::LatchRelease { attempt } => {
                self.finalizer.release_latch(&mut self.session, attempt);
            }
            TimerEvent::HydrationRetry => self.retry_hydration().await,
        }
    }

    /// Adopt a call left in the mailbox by another view, if any.
    pub async fn hydrate(&mut self) -> Result<HydrationOutcome, CallError> {
        let outcome = self
            .hydration
            .reconcile(&mut self.session, &self.slot)
            .await?;

        match outcome {
            HydrationOutcome::Adopted { .. } => {
                if let Some(connection) = self.session.connection().cloned() {
                    self.adapter.subscribe(&connection);
                }
                self.sync_timers();
                self.hydration.stop();
            }
            HydrationOutcome::NothingFound | HydrationOutcome::Stale { .. } => {
                self.hydration.schedule_retries(&self.scheduler);
            }
            HydrationOutcome::AlreadySeeded => self.hydration.stop(),
        }
        Ok(outcome)
    }

    /// Run until every [`ControllerHandle`] is dropped.
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        match self.hydrate().await {
            Ok(outcome) => tracing::debug!(?outcome, "Startup hydration"),
            Err(e) => tracing::warn!("Startup hydration failed: {e}"),
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                Some(timer) = self.timers.recv() => self.handle_timer(timer).await,
            }
        }

        self.adapter.shutdown();
        tracing::info!("Call controller stopped");
    }

    pub fn spawn(self) -> ControllerHandle {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.run(rx));
        ControllerHandle { tx }
    }

    async fn dispatch(&mut self, command: Command) {
        // A dropped reply just means the requester went away.
        match command {
            Command::StartOutgoing { to, reply } => {
                let _ = reply.send(self.start_outgoing(&to).await);
            }
            Command::OfferIncoming { connection } => self.offer_incoming(connection),
            Command::AcceptIncoming { reply } => {
                let _ = reply.send(self.accept_incoming().await);
            }
            Command::RejectIncoming { reply } => {
                let _ = reply.send(self.reject_incoming().await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted).await);
            }
            Command::RecordOutcome { outcome, reply } => {
                let _ = reply.send(self.record_outcome(outcome).await);
            }
            Command::Reset { reply } => {
                let _ = reply.send(self.reset());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_connected(&mut self, call_sid: Option<String>) {
        match self.session.status() {
            CallStatus::Connecting => {
                if let Err(e) = self.session.mark_active(call_sid) {
                    tracing::warn!("Could not mark call active: {e}");
                    return;
                }
                let connection = self.session.connection().cloned();
                let record_id = self.session.record_id().map(str::to_string);
                if let (Some(connection), Some(record_id)) = (connection, record_id) {
                    self.slot
                        .set(ActiveConnection {
                            connection,
                            record_id,
                        })
                        .await;
                }
                self.sync_timers();
                tracing::info!(
                    attempt = self.session.attempt(),
                    call_sid = ?self.session.call_sid(),
                    "Call connected"
                );
            }
            CallStatus::Active => {
                // Second delivery of the same connect; it may still carry the sid.
                if let Some(sid) = call_sid {
                    if self.session.set_call_sid(sid) {
                        tracing::debug!(call_sid = ?self.session.call_sid(), "Call sid learned");
                    }
                }
            }
            CallStatus::Idle | CallStatus::Ended => {
                tracing::debug!("Connect event for a finished call, ignoring");
            }
        }
    }

    async fn on_detached(&mut self) {
        match self.session.status() {
            CallStatus::Active => {
                if self.session.detach_connection().is_some() {
                    tracing::warn!(
                        attempt = self.session.attempt(),
                        "Connection object went away, leaving it to the watchdog"
                    );
                }
            }
            // The watchdog does not cover Connecting; a vanished leg cannot connect.
            CallStatus::Connecting => {
                tracing::warn!(attempt = self.session.attempt(), "Connection went away while connecting");
                self.finish(EndReason::Failed, None).await;
            }
            CallStatus::Idle | CallStatus::Ended => {}
        }
    }

    fn handle_foreign_event(&mut self, event: &CallEvent) {
        let pending_match = self
            .pending_incoming
            .as_ref()
            .is_some_and(|conn| conn.id() == event.connection);

        if pending_match && event.kind.is_terminal() {
            tracing::info!(connection = %event.connection, "Caller hung up before answer");
            self.pending_incoming = None;
        } else {
            tracing::debug!(
                connection = %event.connection,
                kind = ?event.kind,
                "Ignoring event for another connection"
            );
        }
    }

    async fn finish(&mut self, reason: EndReason, call_sid_hint: Option<&str>) -> FinalizeOutcome {
        let outcome = self
            .finalizer
            .on_terminal_signal(&mut self.session, &self.scheduler, reason, call_sid_hint)
            .await;
        self.sync_timers();
        outcome
    }

    /// Arm the duration and watchdog timers while Active, drop them otherwise.
    fn sync_timers(&mut self) {
        if self.session.status() == CallStatus::Active {
            let attempt = self.session.attempt();
            if self.duration_timer.is_none() {
                self.duration_timer = Some(
                    self.scheduler
                        .every(self.tick_interval, TimerEvent::Tick { attempt }),
                );
            }
            if !self.watchdog.is_armed() {
                self.watchdog.arm(&self.scheduler, attempt);
            }
        } else {
            self.duration_timer = None;
            self.watchdog.disarm();
        }
    }

    /// Tear down what belongs to the previous attempt before a new one starts.
    fn retire_attempt(&mut self) {
        self.finalizer.cancel_release();
        if let Some(id) = self.session.connection_id() {
            self.adapter.unsubscribe(id);
        }
        self.duration_timer = None;
        self.watchdog.disarm();
    }

    async fn retry_hydration(&mut self) {
        if !self.hydration.take_attempt() {
            self.hydration.stop();
            return;
        }

        match self.hydrate().await {
            Ok(HydrationOutcome::NothingFound | HydrationOutcome::Stale { .. })
                if self.hydration.exhausted() =>
            {
                tracing::info!("No call to adopt, giving up on hydration");
                self.hydration.stop();
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Hydration retry failed: {e}"),
        }
    }

    #[cfg(test)]
    async fn pump_timers(&mut self) {
        while let Ok(timer) = self.timers.try_recv() {
            self.handle_timer(timer).await;
        }
    }
}

/// Cloneable handle for talking to a spawned [`CallController`].
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)
    }

    pub async fn start_outgoing(&self, to: &str) -> Result<CallSnapshot, CallError> {
        let to = to.to_string();
        self.request(|reply| Command::StartOutgoing { to, reply })
            .await?
    }

    pub async fn offer_incoming(&self, connection: Arc<dyn Connection>) -> Result<(), CallError> {
        self.tx
            .send(Command::OfferIncoming { connection })
            .await
            .map_err(|_| CallError::Stopped)
    }

    pub async fn accept_incoming(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::AcceptIncoming { reply }).await?
    }

    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::RejectIncoming { reply }).await?
    }

    pub async fn hang_up(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::HangUp { reply }).await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await?
    }

    pub async fn record_outcome(&self, outcome: String) -> Result<(), CallError> {
        self.request(|reply| Command::RecordOutcome { outcome, reply })
            .await?
    }

    pub async fn reset(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Reset { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}
