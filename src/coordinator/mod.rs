// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The control surface that ties together:
//! - Per-pair controllers (transition table, health monitor, RP cadences)
//! - Live delivery from the [`Transport`] into the [`RecoveryPointStore`]
//! - Baseline and resync via the [`ResyncCoordinator`]
//! - The periodic retention sweep
//!
//! # Architecture
//!
//! ```text
//!  operator ──► ReplicationEngine ──► PairRegistry ──► controller (one per pair)
//!                      │                                  │ worker: baseline / delivery / resync
//!                      │                                  ▼
//!                      └──► sweep task ──────────► RecoveryPointStore ──► MetadataStore (SQLite)
//! ```
//!
//! Commands return as soon as the transition is persisted. Drive-through
//! (copying, delivering, resyncing) happens on the controller's worker and
//! is observable through [`ReplicationEngine::get_pair`] and
//! [`ReplicationEngine::watch_pair`].

mod controller;
mod delivery;
mod health;
mod state;
mod sweep;
mod types;

pub use health::{evaluate as evaluate_health, HealthInputs, HealthVerdict};
pub use state::{next_state, Command, PairState, TransitionContext, Trigger};
pub use types::{EngineState, HealthCheck, PairHealth};

use crate::admission::AdmissionController;
use crate::collaborators::{CredentialProvider, ProvisioningService, StaticCredentials, StaticProvisioning};
use crate::config::{EngineConfig, EngineSettings, RetentionPolicy};
use crate::error::{ReplicationError, Result};
use crate::extent::VolumeImage;
use crate::metrics;
use crate::model::{Health, PairId, RecoveryPoint, RecoveryTarget, ReplicationPair, TransitionRecord};
use crate::notify::{self, NotificationSink, TracingSink};
use crate::resync::{ResyncCoordinator, ResyncOutcome};
use crate::rps::RecoveryPointStore;
use crate::store::MetadataStore;
use crate::transport::Transport;
use controller::PairHandle;
use delivery::DeliveryEvent;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a controller and its workers share.
pub(crate) struct EngineContext {
    pub(crate) settings: EngineSettings,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) rps: Arc<RecoveryPointStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) provisioning: Arc<dyn ProvisioningService>,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) resync: Arc<ResyncCoordinator>,
}

pub(crate) type PairRegistry = RwLock<HashMap<PairId, Arc<PairHandle>>>;

/// Reports delivered to a pair's controller.
#[derive(Debug)]
pub(crate) enum PairEvent {
    BaselineDone { epoch: u64, result: Result<ResyncOutcome> },
    ResyncDone { epoch: u64, result: Result<ResyncOutcome> },
    Delivery { epoch: u64, event: DeliveryEvent },
    Quiesced { epoch: u64, result: Result<u64> },
    Corruption(ReplicationError),
}

/// The services the engine consumes but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub provisioning: Arc<dyn ProvisioningService>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Collaborators {
    /// Unlimited target capacity, static credentials, notifications to the log.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            provisioning: Arc::new(StaticProvisioning::unlimited()),
            credentials: Arc::new(StaticCredentials::default()),
            notifier: Arc::new(TracingSink),
        }
    }

    #[must_use]
    pub fn with_provisioning(mut self, provisioning: Arc<dyn ProvisioningService>) -> Self {
        self.provisioning = provisioning;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// A pairing request.
#[derive(Debug, Clone)]
pub struct CreatePairRequest {
    pub source_volume_ref: String,
    pub target_volume_ref: String,
    /// Falls back to the engine's default policy.
    pub retention_policy: Option<RetentionPolicy>,
}

impl CreatePairRequest {
    pub fn new(source_volume_ref: impl Into<String>, target_volume_ref: impl Into<String>) -> Self {
        Self {
            source_volume_ref: source_volume_ref.into(),
            target_volume_ref: target_volume_ref.into(),
            retention_policy: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.retention_policy = Some(policy);
        self
    }
}

/// A running volume reconstruction.
#[derive(Debug)]
pub struct RecoveryJob {
    pub job_id: Uuid,
    pub pair_id: PairId,
    /// The recovery point being reconstructed.
    pub rp: RecoveryPoint,
    handle: JoinHandle<Result<VolumeImage>>,
}

impl RecoveryJob {
    /// Wait for the reconstructed image.
    pub async fn wait(self) -> Result<VolumeImage> {
        self.handle
            .await
            .map_err(|e| ReplicationError::Internal(format!("recovery job {} failed: {}", self.job_id, e)))?
    }
}

/// The volume replication engine.
///
/// Owns the pair registry and the background sweep. Pairs survive restarts:
/// [`start()`](Self::start) reloads every persisted pair and resumes
/// whatever its state calls for.
pub struct ReplicationEngine {
    config: EngineConfig,
    collaborators: Collaborators,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Set once `start()` has opened the store.
    ctx: Option<Arc<EngineContext>>,
    registry: Arc<PairRegistry>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Background tasks other than controllers.
    tasks: Vec<JoinHandle<()>>,
}

impl ReplicationEngine {
    /// Create an engine in the `Created` state.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            collaborators,
            state_tx,
            state_rx,
            ctx: None,
            registry: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Start the engine.
    ///
    /// 1. Validates configuration and opens the metadata store
    /// 2. Reloads every persisted pair and its recovery point chain
    /// 3. Spawns a controller per live pair (resuming baselines from their checkpoint)
    /// 4. Spawns the retention sweep (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.config.validate()?;

        info!(store = %self.config.store.sqlite_path, "Starting replication engine");
        self.set_state(EngineState::Starting);

        let store = match MetadataStore::open(&self.config.store).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open metadata store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let settings = self.config.settings.clone();
        let rps = Arc::new(RecoveryPointStore::new(Arc::clone(&store)));
        let admission = Arc::new(AdmissionController::new(
            &settings.admission,
            Arc::clone(&self.collaborators.provisioning),
        ));
        let resync = Arc::new(ResyncCoordinator::new(
            Arc::clone(&self.collaborators.transport),
            Arc::clone(&rps),
            admission,
            settings.seed.clone(),
            settings.delivery.batch_size,
        ));
        let ctx = Arc::new(EngineContext {
            settings,
            store: Arc::clone(&store),
            rps,
            transport: Arc::clone(&self.collaborators.transport),
            credentials: Arc::clone(&self.collaborators.credentials),
            provisioning: Arc::clone(&self.collaborators.provisioning),
            notifier: Arc::clone(&self.collaborators.notifier),
            resync,
        });

        let pairs = match store.load_pairs().await {
            Ok(pairs) => pairs,
            Err(e) => {
                error!(error = %e, "Failed to load pairs");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let mut resumed = 0;
        for mut pair in pairs {
            if pair.state == PairState::Deleted {
                continue;
            }
            if let Err(e) = ctx.rps.load_pair(&pair.pair_id).await {
                error!(pair_id = %pair.pair_id, error = %e, "Recovery point chain failed to load");
                ctx.rps.register_pair(&pair.pair_id);
                pair.health = Health::Broken;
                pair.last_failure = Some(e.report(&pair.pair_id, 0));
                if let Err(e) = store.save_pair(&pair, None).await {
                    warn!(pair_id = %pair.pair_id, error = %e, "Failed to record broken chain");
                }
            }
            debug!(pair_id = %pair.pair_id, state = %pair.state, "Resuming pair");
            let handle = controller::spawn(Arc::clone(&ctx), pair, self.shutdown_rx.clone());
            self.registry.write().insert(handle.pair_id.clone(), handle);
            resumed += 1;
        }
        metrics::set_active_pairs(resumed);

        if ctx.settings.sweep.enabled {
            let task = tokio::spawn(sweep::run_sweeper(
                Arc::clone(&ctx),
                Arc::clone(&self.registry),
                self.shutdown_rx.clone(),
            ));
            self.tasks.push(task);
        }

        self.ctx = Some(ctx);
        self.set_state(EngineState::Running);
        info!(pairs = resumed, "Replication engine running");
        Ok(())
    }

    fn ctx(&self) -> Result<&Arc<EngineContext>> {
        match (&self.ctx, self.state()) {
            (Some(ctx), EngineState::Running) => Ok(ctx),
            (_, state) => Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: state.to_string(),
            }),
        }
    }

    fn handle(&self, pair_id: &PairId) -> Result<Arc<PairHandle>> {
        self.registry
            .read()
            .get(pair_id)
            .cloned()
            .ok_or_else(|| ReplicationError::PairNotFound(pair_id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control API
    // ─────────────────────────────────────────────────────────────────────

    /// Register a new pair in `Uninitialized`. Call [`start_pair`](Self::start_pair)
    /// to begin its baseline.
    pub async fn create_pair(&self, request: CreatePairRequest) -> Result<PairId> {
        let ctx = self.ctx()?;
        let policy = request
            .retention_policy
            .unwrap_or_else(|| self.config.default_policy.clone());
        policy.validate()?;

        let pair = ReplicationPair::new(request.source_volume_ref, request.target_volume_ref, policy);
        let record = TransitionRecord {
            pair_id: pair.pair_id.clone(),
            trigger: "create".to_string(),
            from_state: PairState::Uninitialized,
            to_state: PairState::Uninitialized,
            detail: Some(format!("{} -> {}", pair.source_volume_ref, pair.target_volume_ref)),
            at: pair.created_at,
        };
        ctx.store.save_pair(&pair, Some(&record)).await?;
        ctx.rps.register_pair(&pair.pair_id);

        let pair_id = pair.pair_id.clone();
        info!(
            pair_id = %pair_id,
            source = %pair.source_volume_ref,
            target = %pair.target_volume_ref,
            "Pair created"
        );
        notify::emit(
            ctx.notifier.as_ref(),
            &pair_id,
            "pair_created",
            format!("{} -> {}", pair.source_volume_ref, pair.target_volume_ref),
        );

        let handle = controller::spawn(Arc::clone(ctx), pair, self.shutdown_rx.clone());
        let active = {
            let mut registry = self.registry.write();
            registry.insert(pair_id.clone(), handle);
            registry.len()
        };
        metrics::set_active_pairs(active);
        Ok(pair_id)
    }

    /// Apply an operator command. Returns once the transition is persisted.
    pub async fn command(&self, pair_id: &PairId, command: Command) -> Result<(PairState, Health)> {
        self.ctx()?;
        let handle = self.handle(pair_id)?;
        let pair = handle.command(command).await?;

        if pair.state == PairState::Deleted {
            let active = {
                let mut registry = self.registry.write();
                registry.remove(pair_id);
                registry.len()
            };
            metrics::set_active_pairs(active);
            if let Some(task) = handle.take_task() {
                if let Err(e) = task.await {
                    warn!(pair_id = %pair_id, error = %e, "Controller ended abnormally");
                }
            }
        }
        Ok((pair.state, pair.health))
    }

    pub async fn start_pair(&self, pair_id: &PairId) -> Result<(PairState, Health)> {
        self.command(pair_id, Command::Start).await
    }

    pub async fn stop_pair(&self, pair_id: &PairId) -> Result<(PairState, Health)> {
        self.command(pair_id, Command::Stop).await
    }

    pub async fn suspend_pair(&self, pair_id: &PairId) -> Result<(PairState, Health)> {
        self.command(pair_id, Command::Suspend).await
    }

    pub async fn resume_pair(&self, pair_id: &PairId) -> Result<(PairState, Health)> {
        self.command(pair_id, Command::Resume).await
    }

    pub async fn resync_pair(&self, pair_id: &PairId) -> Result<(PairState, Health)> {
        self.command(pair_id, Command::Resync).await
    }

    pub async fn delete_pair(&self, pair_id: &PairId) -> Result<(PairState, Health)> {
        self.command(pair_id, Command::Delete).await
    }

    /// Current view of a pair (state, health, sequence, lag).
    pub fn get_pair(&self, pair_id: &PairId) -> Result<ReplicationPair> {
        Ok(self.handle(pair_id)?.snapshot())
    }

    /// Subscribe to a pair's published snapshots.
    pub fn watch_pair(&self, pair_id: &PairId) -> Result<watch::Receiver<ReplicationPair>> {
        Ok(self.handle(pair_id)?.watch())
    }

    pub fn list_pairs(&self) -> Vec<ReplicationPair> {
        let mut pairs: Vec<_> = self.registry.read().values().map(|h| h.snapshot()).collect();
        pairs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pairs
    }

    /// Retained recovery points, oldest first.
    pub fn list_recovery_points(&self, pair_id: &PairId) -> Result<Vec<RecoveryPoint>> {
        let ctx = self.ctx()?;
        self.handle(pair_id)?;
        ctx.rps.list(pair_id)
    }

    /// Start reconstructing the volume as of `target`.
    ///
    /// The target is resolved immediately against a chain snapshot; the
    /// reconstruction itself runs off the async runtime and never blocks
    /// ingestion or merges.
    pub fn recover(&self, pair_id: &PairId, target: &RecoveryTarget) -> Result<RecoveryJob> {
        let ctx = self.ctx()?;
        self.handle(pair_id)?;

        let chain = ctx.rps.chain(pair_id)?;
        let rp = chain
            .resolve(target)
            .map(|entry| entry.rp.clone())
            .ok_or_else(|| ReplicationError::RecoveryPointNotFound {
                pair_id: pair_id.to_string(),
                target: target.to_string(),
            })?;

        let job_id = Uuid::new_v4();
        info!(pair_id = %pair_id, %job_id, rp_id = rp.rp_id, target = %target, "Recovery started");

        let (job_pair, rp_id, volume_size) = (pair_id.clone(), rp.rp_id, rp.volume_size);
        let handle = tokio::task::spawn_blocking(move || -> Result<VolumeImage> {
            let started = Instant::now();
            let (extents, depth) = chain.reconstruct(&job_pair, rp_id)?;
            metrics::record_recovery(job_pair.as_str(), depth, started.elapsed());
            debug!(pair_id = %job_pair, rp_id, depth, "Recovery reconstructed");
            Ok(VolumeImage::new(volume_size, extents))
        });

        Ok(RecoveryJob {
            job_id,
            pair_id: pair_id.clone(),
            rp,
            handle,
        })
    }

    /// The persisted transition log of a pair, oldest first.
    pub async fn pair_events(&self, pair_id: &PairId) -> Result<Vec<TransitionRecord>> {
        self.ctx()?.store.pair_events(pair_id).await
    }

    /// Run one retention sweep now instead of waiting for the interval.
    pub async fn sweep_now(&self) -> Result<crate::retention::SweepStats> {
        let ctx = self.ctx()?;
        Ok(sweep::sweep_once(ctx, &self.registry).await)
    }

    /// Health summary for monitoring endpoints.
    ///
    /// Built from the controllers' published snapshots; performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let pairs: Vec<PairHealth> = self
            .list_pairs()
            .into_iter()
            .map(|pair| PairHealth {
                last_failure: pair.last_failure.as_ref().map(|f| f.kind.clone()),
                pair_id: pair.pair_id,
                state: pair.state,
                health: pair.health,
                current_sequence: pair.current_sequence,
                lag_ms: pair.lag_ms,
            })
            .collect();

        let mut states = BTreeMap::new();
        for pair in &pairs {
            *states.entry(pair.state.as_str()).or_insert(0) += 1;
        }
        let pairs_degraded = pairs.iter().filter(|p| p.health == Health::Degraded).count();
        let pairs_broken = pairs.iter().filter(|p| p.health == Health::Broken).count();
        let ready = state == EngineState::Running;

        HealthCheck {
            state,
            ready,
            healthy: ready && pairs_broken == 0,
            pairs_total: pairs.len(),
            states,
            pairs_degraded,
            pairs_broken,
            pairs,
        }
    }

    /// Shut the engine down.
    ///
    /// 1. Signal every controller and the sweep to stop
    /// 2. Controllers cancel their workers at the next checkpoint boundary
    /// 3. Wait for tasks (bounded)
    /// 4. Checkpoint and close the metadata store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.tasks);
        let controllers: Vec<Arc<PairHandle>> = self.registry.write().drain().map(|(_, h)| h).collect();
        handles.extend(controllers.iter().filter_map(|h| h.take_task()));

        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for tasks to stop");
        }
        // Controllers bound their own worker wait by WIND_DOWN.
        let drain_timeout = controller::WIND_DOWN + std::time::Duration::from_secs(1);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }
        metrics::set_active_pairs(0);

        if let Some(ctx) = self.ctx.take() {
            if let Err(e) = ctx.store.checkpoint().await {
                warn!(error = %e, "Store checkpoint failed");
            }
            ctx.store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}
