// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pair controller.
//!
//! Each pair is owned by one controller task. Operator commands, worker
//! reports and timers all arrive on the controller's loop, so transitions
//! for a pair are strictly serialized without a lock.
//!
//! # Workers
//!
//! At most one worker runs per pair, chosen by state:
//!
//! | State | Worker |
//! |---|---|
//! | `Syncing` | baseline copy |
//! | `Replicating` | live delivery |
//! | `Resyncing` | delta or full resync |
//!
//! A new worker waits for the previous one to finish before touching the
//! store. Each worker is stamped with an epoch and reports from superseded
//! epochs are dropped.
//!
//! # Ordering
//!
//! A transition is persisted before anything observes it: the store write
//! comes first, then the snapshot is published, then workers change.

use super::delivery::{DeliveryEvent, DeliveryTask};
use super::health::{evaluate, HealthInputs, HealthVerdict};
use super::state::{next_state, Command, PairState, TransitionContext, Trigger};
use super::{EngineContext, PairEvent};
use crate::error::{FailureReport, ReplicationError, Result};
use crate::model::{Health, PairId, RecoveryPoint, ReplicationPair, RpKind, TransitionRecord};
use crate::notify;
use crate::resync::ResyncOutcome;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long a controller waits for its worker on shutdown.
pub(crate) const WIND_DOWN: Duration = Duration::from_secs(10);

const COMMAND_QUEUE: usize = 32;

pub(crate) enum ControlMsg {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<ReplicationPair>>,
    },
}

/// Registry-side handle to a running controller.
pub(crate) struct PairHandle {
    pub(crate) pair_id: PairId,
    commands: mpsc::Sender<ControlMsg>,
    events: mpsc::UnboundedSender<PairEvent>,
    snapshot: watch::Receiver<ReplicationPair>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PairHandle {
    pub(crate) fn snapshot(&self) -> ReplicationPair {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ReplicationPair> {
        self.snapshot.clone()
    }

    /// Send a command and wait for the resulting pair.
    pub(crate) async fn command(&self, command: Command) -> Result<ReplicationPair> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ControlMsg::Command { command, reply })
            .await
            .map_err(|_| ReplicationError::Shutdown)?;
        rx.await.map_err(|_| ReplicationError::Shutdown)?
    }

    /// Deliver an out-of-band event (e.g. from the retention sweep).
    pub(crate) fn post(&self, event: PairEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

/// Start a controller for `pair`, driving whatever state it is in.
pub(crate) fn spawn(ctx: Arc<EngineContext>, pair: ReplicationPair, shutdown: watch::Receiver<bool>) -> Arc<PairHandle> {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(pair.clone());

    let controller = PairController {
        ctx,
        pair,
        snapshot: snapshot_tx,
        events_tx: events_tx.clone(),
        epoch: 0,
        worker: None,
        draining: None,
        outage_since: None,
        head_sequence: 0,
        pending_acrp: None,
        quiesce: None,
        recovering: false,
    };

    let handle = Arc::new(PairHandle {
        pair_id: controller.pair.pair_id.clone(),
        commands: cmd_tx,
        events: events_tx,
        snapshot: snapshot_rx,
        task: Mutex::new(None),
    });
    let task = tokio::spawn(controller.run(cmd_rx, events_rx, shutdown));
    *handle.task.lock() = Some(task);
    handle
}

struct Worker {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct PairController {
    ctx: Arc<EngineContext>,
    pair: ReplicationPair,
    snapshot: watch::Sender<ReplicationPair>,
    events_tx: mpsc::UnboundedSender<PairEvent>,
    epoch: u64,
    worker: Option<Worker>,
    /// Last cancelled worker when no successor was started.
    draining: Option<JoinHandle<()>>,
    /// Start of the current transport outage, as reported by delivery.
    outage_since: Option<DateTime<Utc>>,
    /// Newest sequence the source reported.
    head_sequence: u64,
    /// Quiesce point waiting to be sealed as an ACRP.
    pending_acrp: Option<u64>,
    /// In-flight application-consistency handshake.
    quiesce: Option<JoinHandle<()>>,
    /// An operator restarted a `Broken` pair; clear it on first progress.
    recovering: bool,
}

impl PairController {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControlMsg>,
        mut events: mpsc::UnboundedReceiver<PairEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let span = info_span!("pair", pair_id = %self.pair.pair_id);
        async move {
            if let Ok(acked) = self.ctx.rps.acked_through(&self.pair.pair_id) {
                self.pair.current_sequence = self.pair.current_sequence.max(acked);
                self.head_sequence = self.pair.current_sequence;
            }
            info!(state = %self.pair.state, health = %self.pair.health, "Pair controller started");
            crate::metrics::set_pair_health(self.pair.pair_id.as_str(), self.pair.health.as_str());
            self.drive();

            let mut health = every(self.ctx.settings.health.check_interval_duration());
            let mut ccrp = self.pair.policy.ccrp_interval_duration().map(every);
            let mut acrp = self.pair.policy.acrp_interval_duration().map(every);

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }

                    msg = commands.recv() => match msg {
                        Some(ControlMsg::Command { command, reply }) => {
                            let result = self.handle_command(command).await;
                            let _ = reply.send(result);
                            if self.pair.state == PairState::Deleted {
                                break;
                            }
                        }
                        None => break,
                    },

                    Some(event) = events.recv() => self.handle_event(event).await,

                    _ = health.tick() => self.check_health().await,

                    _ = tick(&mut ccrp) => self.seal_crash_consistent().await,

                    _ = tick(&mut acrp) => self.app_consistent_point(),
                }
            }

            self.wind_down().await;
            info!(state = %self.pair.state, "Pair controller stopped");
        }
        .instrument(span)
        .await
    }

    // =========================================================================
    // Commands and transitions
    // =========================================================================

    async fn handle_command(&mut self, command: Command) -> Result<ReplicationPair> {
        let from = self.pair.state;
        let trigger = Trigger::Command(command);
        let to = next_state(from, trigger, self.transition_context())
            .ok_or_else(|| ReplicationError::invalid_transition(&self.pair.pair_id, command, from))?;

        if to == from {
            debug!(%command, state = %from, "Command is a no-op in current state");
            return Ok(self.pair.clone());
        }

        self.transition(trigger, to, None, |_| {}).await?;
        if self.pair.health == Health::Broken && matches!(command, Command::Start | Command::Resync) {
            self.recovering = true;
        }
        if to == PairState::Deleted {
            self.teardown().await;
        }
        Ok(self.pair.clone())
    }

    fn transition_context(&self) -> TransitionContext {
        let has_recovery_points = matches!(self.ctx.rps.latest(&self.pair.pair_id), Ok(Some(_)));
        let offline_exceeded = self
            .pair
            .suspended_at
            .map(|at| elapsed_since(at) > self.pair.policy.max_rp_offline_duration())
            .unwrap_or(false);
        TransitionContext {
            has_recovery_points,
            offline_exceeded,
            resync_origin: self.pair.resync_origin,
        }
    }

    /// Persist, publish, then act on a state change.
    async fn transition(
        &mut self,
        trigger: Trigger,
        to: PairState,
        detail: Option<String>,
        update: impl FnOnce(&mut ReplicationPair),
    ) -> Result<()> {
        let from = self.pair.state;
        let now = Utc::now();

        let mut next = self.pair.clone();
        next.state = to;
        next.updated_at = now;
        match to {
            PairState::Suspended => {
                next.suspended_at.get_or_insert(now);
            }
            PairState::Resyncing => {}
            _ => next.suspended_at = None,
        }
        if to == PairState::Resyncing {
            next.resync_origin = Some(from);
        } else if from == PairState::Resyncing {
            next.resync_origin = None;
        }
        update(&mut next);

        let record = TransitionRecord {
            pair_id: next.pair_id.clone(),
            trigger: trigger.as_str().to_string(),
            from_state: from,
            to_state: to,
            detail: detail.clone(),
            at: now,
        };
        self.ctx.store.save_pair(&next, Some(&record)).await?;

        let health_changed = next.health != self.pair.health;
        self.pair = next;
        self.publish();

        let pair_id = self.pair.pair_id.clone();
        crate::metrics::record_pair_transition(pair_id.as_str(), from.as_str(), to.as_str());
        info!(%from, %to, trigger = trigger.as_str(), detail = detail.as_deref().unwrap_or(""), "Pair transition");
        let summary = match &detail {
            Some(d) => format!("{} -> {} ({}: {})", from, to, trigger.as_str(), d),
            None => format!("{} -> {} ({})", from, to, trigger.as_str()),
        };
        notify::emit(self.ctx.notifier.as_ref(), &pair_id, "state_changed", summary);
        if health_changed {
            crate::metrics::set_pair_health(pair_id.as_str(), self.pair.health.as_str());
            notify::emit(self.ctx.notifier.as_ref(), &pair_id, "health_changed", self.pair.health.as_str());
        }

        if to == PairState::Stopped || to == PairState::Suspended {
            self.outage_since = None;
            self.pending_acrp = None;
        }
        self.drive();
        Ok(())
    }

    /// Persist a health change that does not move the state.
    async fn set_health(&mut self, health: Health, failure: Option<FailureReport>, reason: &str) {
        let previous = self.pair.health;
        self.pair.health = health;
        if failure.is_some() || health == Health::Ok {
            self.pair.last_failure = failure;
        }
        self.pair.updated_at = Utc::now();
        self.persist().await;
        self.publish();

        if previous != health {
            crate::metrics::set_pair_health(self.pair.pair_id.as_str(), health.as_str());
            info!(from = %previous, to = %health, reason, "Pair health changed");
            notify::emit(
                self.ctx.notifier.as_ref(),
                &self.pair.pair_id,
                "health_changed",
                format!("{} -> {}: {}", previous, health, reason),
            );
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.ctx.store.save_pair(&self.pair, None).await {
            warn!(error = %e, "Failed to persist pair");
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.pair.clone());
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Cancel the current worker and start the one the state calls for.
    fn drive(&mut self) {
        let previous = self.cancel_worker();
        self.epoch += 1;

        let ctx = Arc::clone(&self.ctx);
        let pair = self.pair.clone();
        let events = self.events_tx.clone();
        let epoch = self.epoch;

        match self.pair.state {
            PairState::Syncing => self.start_worker(previous, move |mut cancel| async move {
                let result = ctx.resync.baseline(&pair, &mut cancel).await;
                let _ = events.send(PairEvent::BaselineDone { epoch, result });
            }),
            PairState::Resyncing => self.start_worker(previous, move |mut cancel| async move {
                let result = ctx.resync.resync(&pair, &mut cancel).await;
                let _ = events.send(PairEvent::ResyncDone { epoch, result });
            }),
            PairState::Replicating => self.start_worker(previous, move |cancel| {
                let task = DeliveryTask::new(ctx, pair.pair_id.clone(), pair.source_volume_ref.clone(), epoch, events);
                task.run(cancel)
            }),
            _ => self.draining = previous,
        }
    }

    fn start_worker<F, Fut>(&mut self, previous: Option<JoinHandle<()>>, make: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let work = make(cancel_rx);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await;
        });
        self.worker = Some(Worker {
            cancel: cancel_tx,
            handle,
        });
    }

    fn cancel_worker(&mut self) -> Option<JoinHandle<()>> {
        match self.worker.take() {
            Some(worker) => {
                let _ = worker.cancel.send(true);
                Some(worker.handle)
            }
            None => self.draining.take(),
        }
    }

    async fn wind_down(&mut self) {
        if let Some(quiesce) = self.quiesce.take() {
            quiesce.abort();
        }
        if let Some(handle) = self.cancel_worker() {
            if tokio::time::timeout(WIND_DOWN, handle).await.is_err() {
                warn!(timeout = ?WIND_DOWN, "Worker did not stop in time");
            }
        }
    }

    async fn teardown(&mut self) {
        self.wind_down().await;
        let pair_id = self.pair.pair_id.clone();
        if let Err(e) = self.ctx.rps.drop_pair(&pair_id).await {
            warn!(error = %e, "Failed to drop recovery points");
        }
        if let Err(e) = self.ctx.provisioning.release_target(&self.pair.target_volume_ref).await {
            warn!(target = %self.pair.target_volume_ref, error = %e, "Failed to release target");
        }
        notify::emit(self.ctx.notifier.as_ref(), &pair_id, "pair_deleted", &*self.pair.target_volume_ref);
    }

    // =========================================================================
    // Worker reports
    // =========================================================================

    async fn handle_event(&mut self, event: PairEvent) {
        match event {
            PairEvent::BaselineDone { epoch, result } if epoch == self.epoch => {
                self.on_seed_done(Trigger::BaselineComplete, Trigger::BaselineFailed, result).await
            }
            PairEvent::ResyncDone { epoch, result } if epoch == self.epoch => {
                self.on_seed_done(Trigger::ResyncComplete, Trigger::ResyncFailed, result).await
            }
            PairEvent::Delivery { epoch, event } if epoch == self.epoch => self.on_delivery(event).await,
            PairEvent::Quiesced { epoch, result } => {
                self.quiesce = None;
                if epoch == self.epoch && self.pair.state == PairState::Replicating {
                    self.on_quiesced(result).await;
                }
            }
            PairEvent::Corruption(error) => self.on_corruption(error).await,
            stale => debug!(event = ?stale, "Dropping report from superseded worker"),
        }
    }

    async fn on_seed_done(&mut self, complete: Trigger, failed: Trigger, result: Result<ResyncOutcome>) {
        let pair_id = self.pair.pair_id.clone();
        match result {
            Ok(outcome) => {
                let Some(to) = next_state(self.pair.state, complete, self.transition_context()) else {
                    warn!(trigger = complete.as_str(), state = %self.pair.state, "Completion no longer applies");
                    return;
                };
                self.head_sequence = self.head_sequence.max(outcome.watermark);
                self.outage_since = None;
                self.recovering = false;
                let detail = format!("{} through sequence {}", outcome.mode.as_str(), outcome.watermark);
                let watermark = outcome.watermark;
                let applied = self
                    .transition(complete, to, Some(detail.clone()), |p| {
                        p.health = Health::Ok;
                        p.last_failure = None;
                        p.current_sequence = p.current_sequence.max(watermark);
                        p.lag_ms = 0;
                    })
                    .await;
                if let Err(e) = applied {
                    error!(error = %e, "Failed to record completion");
                    return;
                }
                if let Some(rp) = outcome.rp {
                    self.announce_rp(&rp);
                }
                notify::emit(self.ctx.notifier.as_ref(), &pair_id, complete.as_str(), detail);
            }
            Err(ReplicationError::Cancelled) => debug!("Worker cancelled"),
            Err(e) => {
                let Some(to) = next_state(self.pair.state, failed, self.transition_context()) else {
                    return;
                };
                let last_good = self.ctx.rps.sealed_watermark(&pair_id).unwrap_or(0);
                let report = e.report(&pair_id, last_good);
                error!(error = %e, kind = e.kind(), last_good, "Pair operation failed");
                let applied = self
                    .transition(failed, to, Some(e.to_string()), |p| {
                        p.health = Health::Broken;
                        p.last_failure = Some(report);
                    })
                    .await;
                if let Err(persist) = applied {
                    error!(error = %persist, "Failed to record failure");
                }
                notify::emit(self.ctx.notifier.as_ref(), &pair_id, failed.as_str(), e.to_string());
            }
        }
    }

    async fn on_delivery(&mut self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Progress {
                acked_through,
                head_sequence,
            } => {
                self.head_sequence = head_sequence.max(acked_through);
                if self.recovering {
                    self.recovering = false;
                    self.set_health(Health::Ok, None, "delivery resumed").await;
                }
                if acked_through != self.pair.current_sequence {
                    self.pair.current_sequence = acked_through;
                    self.publish();
                }
                self.try_seal_acrp().await;
            }
            DeliveryEvent::Disconnected { since, reason } => {
                self.outage_since.get_or_insert(since);
                notify::emit(self.ctx.notifier.as_ref(), &self.pair.pair_id, "transport_disconnected", reason);
            }
            DeliveryEvent::Reconnected => {
                if let Some(since) = self.outage_since.take() {
                    info!(outage_ms = elapsed_since(since).as_millis() as u64, "Transport restored");
                }
                notify::emit(self.ctx.notifier.as_ref(), &self.pair.pair_id, "transport_reconnected", "");
            }
            DeliveryEvent::Evicted {
                requested,
                oldest_available,
            } => {
                let reason = format!(
                    "source evicted changes after {} (oldest available {})",
                    requested, oldest_available
                );
                if self.pair.health == Health::Broken {
                    warn!(reason = %reason, "Pair is broken, not resyncing automatically");
                    return;
                }
                self.auto_resync("evicted", reason).await;
            }
            DeliveryEvent::Failed(e) => {
                let last_good = self.ctx.rps.sealed_watermark(&self.pair.pair_id).unwrap_or(0);
                let report = e.report(&self.pair.pair_id, last_good);
                error!(error = %e, kind = e.kind(), "Delivery gave up");
                self.set_health(Health::Broken, Some(report), &e.to_string()).await;
            }
        }
    }

    async fn on_corruption(&mut self, error: ReplicationError) {
        let last_good = self.ctx.rps.sealed_watermark(&self.pair.pair_id).unwrap_or(0);
        let report = error.report(&self.pair.pair_id, last_good);
        error!(error = %error, "Recovery point chain failed verification");
        notify::emit(self.ctx.notifier.as_ref(), &self.pair.pair_id, "chain_corruption", error.to_string());
        self.set_health(Health::Broken, Some(report), &error.to_string()).await;
    }

    async fn auto_resync(&mut self, kind: &str, reason: String) {
        let Some(to) = next_state(self.pair.state, Trigger::AutoResync, self.transition_context()) else {
            return;
        };
        crate::metrics::record_auto_resync(self.pair.pair_id.as_str(), kind);
        warn!(reason = %reason, "Forcing resync");
        if let Err(e) = self.transition(Trigger::AutoResync, to, Some(reason), |_| {}).await {
            error!(error = %e, "Failed to record forced resync");
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn check_health(&mut self) {
        let lag = self.lag();
        let lag_ms = lag.as_millis() as u64;
        crate::metrics::set_replication_lag_ms(self.pair.pair_id.as_str(), lag_ms);
        if lag_ms != self.pair.lag_ms {
            self.pair.lag_ms = lag_ms;
            self.publish();
        }

        let inputs = HealthInputs {
            state: self.pair.state,
            health: self.pair.health,
            lag,
            outage: self.outage_since.map(elapsed_since),
            max_rp_interval: self.pair.policy.max_rp_interval_duration(),
            max_rp_offline: self.pair.policy.max_rp_offline_duration(),
        };
        match evaluate(&inputs) {
            HealthVerdict::Unchanged => {}
            HealthVerdict::Healthy => self.set_health(Health::Ok, None, "recovery points current").await,
            HealthVerdict::Degraded(reason) => self.set_health(Health::Degraded, None, &reason).await,
            HealthVerdict::ForceResync(reason) => self.auto_resync("offline", reason).await,
        }
    }

    /// Age of the newest recovery point while the source has unsealed changes.
    fn lag(&self) -> Duration {
        if self.pair.state != PairState::Replicating {
            return Duration::ZERO;
        }
        let pair_id = &self.pair.pair_id;
        let sealed = self.ctx.rps.sealed_watermark(pair_id).unwrap_or(0);
        if self.head_sequence <= sealed {
            return Duration::ZERO;
        }
        match self.ctx.rps.latest(pair_id) {
            Ok(Some(rp)) => elapsed_since(rp.created_at),
            _ => Duration::ZERO,
        }
    }

    async fn seal_crash_consistent(&mut self) {
        if self.pair.state != PairState::Replicating {
            return;
        }
        self.try_seal_acrp().await;
        match self.ctx.rps.materialize_rp(&self.pair.pair_id, RpKind::Ccrp).await {
            Ok(Some(rp)) => self.on_sealed(rp).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to seal recovery point"),
        }
    }

    /// Start the quiesce handshake off the controller loop; the result comes
    /// back as [`PairEvent::Quiesced`].
    fn app_consistent_point(&mut self) {
        if self.pair.state != PairState::Replicating {
            return;
        }
        if self.quiesce.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Quiesce still in flight, skipping tick");
            return;
        }

        let transport = Arc::clone(&self.ctx.transport);
        let source = self.pair.source_volume_ref.clone();
        let limit = self.ctx.settings.health.quiesce_timeout_duration();
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        self.quiesce = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, transport.quiesce(&source)).await {
                Ok(result) => result,
                Err(_) => Err(ReplicationError::ConsistencyHandshake(format!(
                    "no quiesce response from {} within {:?}",
                    source, limit
                ))),
            };
            let _ = events.send(PairEvent::Quiesced { epoch, result });
        }));
    }

    async fn on_quiesced(&mut self, result: Result<u64>) {
        match result {
            Ok(sequence) => {
                debug!(sequence, "Source quiesced");
                self.pending_acrp = Some(sequence);
                self.try_seal_acrp().await;
            }
            Err(e) => {
                crate::metrics::record_acrp_skipped(self.pair.pair_id.as_str());
                debug!(error = %e, "Quiesce failed, skipping application-consistent point");
                notify::emit(self.ctx.notifier.as_ref(), &self.pair.pair_id, "acrp_skipped", e.to_string());
            }
        }
    }

    /// Seal the pending quiesce point once delivery has caught up to it.
    async fn try_seal_acrp(&mut self) {
        let Some(sequence) = self.pending_acrp else {
            return;
        };
        let pair_id = self.pair.pair_id.clone();
        let sealed = self.ctx.rps.sealed_watermark(&pair_id).unwrap_or(0);
        if sequence <= sealed {
            self.pending_acrp = None;
            crate::metrics::record_acrp_skipped(pair_id.as_str());
            notify::emit(
                self.ctx.notifier.as_ref(),
                &pair_id,
                "acrp_skipped",
                format!("sequence {} already sealed", sequence),
            );
            return;
        }
        if self.ctx.rps.acked_through(&pair_id).unwrap_or(0) < sequence {
            return;
        }
        match self.ctx.rps.materialize_rp_at(&pair_id, RpKind::Acrp, Some(sequence)).await {
            Ok(sealed) => {
                self.pending_acrp = None;
                if let Some(rp) = sealed {
                    self.on_sealed(rp).await;
                }
            }
            Err(e) => warn!(sequence, error = %e, "Failed to seal application-consistent point"),
        }
    }

    async fn on_sealed(&mut self, rp: RecoveryPoint) {
        self.pair.current_sequence = self.pair.current_sequence.max(rp.sequence_watermark);
        self.pair.updated_at = Utc::now();
        self.persist().await;
        self.publish();
        self.announce_rp(&rp);
    }

    fn announce_rp(&self, rp: &RecoveryPoint) {
        notify::emit(
            self.ctx.notifier.as_ref(),
            &self.pair.pair_id,
            "rp_sealed",
            format!("{} {} through sequence {}", rp.kind.as_str(), rp.rp_id, rp.sequence_watermark),
        );
    }
}

fn every(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn elapsed_since(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or_default()
}
