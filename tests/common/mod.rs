// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for scenario and chaos tests.
//!
//! This module provides:
//! - An in-process engine harness over `MemoryChangeTracker` + `LoopbackTransport`
//! - Polling helpers for asynchronous drive-through
//! - Notification capture

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use volume_replication::tracker::{MemoryChangeTracker, TrackerConfig};
use volume_replication::{
    ChannelSink, Collaborators, CreatePairRequest, EngineConfig, LoopbackTransport, Notification, PairId, PairState,
    ReplicationEngine, ReplicationPair, RetentionPolicy, StaticCredentials, StaticProvisioning,
};

pub const SOURCE: &str = "src-vol";
pub const TARGET: &str = "tgt-vol";

/// Default wait for drive-through in tests.
pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub config: EngineConfig,
    pub tracker: Arc<MemoryChangeTracker>,
    pub transport: Arc<LoopbackTransport<MemoryChangeTracker>>,
    pub provisioning: Arc<StaticProvisioning>,
    pub credentials: Arc<StaticCredentials>,
    pub sink: Arc<ChannelSink>,
    pub notifications: broadcast::Receiver<Notification>,
    pub engine: ReplicationEngine,
}

impl Harness {
    /// Running engine with an in-memory store and one attached source volume.
    pub async fn start(volume_size: u64) -> Self {
        Self::start_with(EngineConfig::for_testing(), TrackerConfig::default(), volume_size).await
    }

    pub async fn start_with(config: EngineConfig, tracker_config: TrackerConfig, volume_size: u64) -> Self {
        let tracker = Arc::new(MemoryChangeTracker::new(tracker_config));
        tracker.attach(SOURCE, volume_size);
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&tracker)));
        let provisioning = Arc::new(StaticProvisioning::unlimited());
        let credentials = Arc::new(StaticCredentials::default());
        let sink = Arc::new(ChannelSink::new(4096));
        let notifications = sink.subscribe();

        let mut harness = Self {
            engine: build_engine(&config, &transport, &provisioning, &credentials, &sink),
            config,
            tracker,
            transport,
            provisioning,
            credentials,
            sink,
            notifications,
        };
        harness.engine.start().await.unwrap();
        harness
    }

    /// Shut the engine down and start a fresh one over the same store and source.
    pub async fn restart(&mut self) {
        self.engine.shutdown().await;
        self.relaunch().await;
    }

    /// Start a fresh engine after the previous one was shut down.
    pub async fn relaunch(&mut self) {
        self.engine = build_engine(
            &self.config,
            &self.transport,
            &self.provisioning,
            &self.credentials,
            &self.sink,
        );
        self.engine.start().await.unwrap();
    }

    pub async fn create_pair(&self, policy: RetentionPolicy) -> PairId {
        self.engine
            .create_pair(CreatePairRequest::new(SOURCE, TARGET).with_policy(policy))
            .await
            .unwrap()
    }

    /// Create and start a pair, then wait for its baseline.
    pub async fn replicating_pair(&self, policy: RetentionPolicy) -> PairId {
        let pair_id = self.create_pair(policy).await;
        self.engine.start_pair(&pair_id).await.unwrap();
        wait_for_state(&self.engine, &pair_id, PairState::Replicating).await;
        pair_id
    }

    /// Write to the source volume.
    pub fn write(&self, offset: u64, data: &[u8]) -> u64 {
        self.tracker.write(SOURCE, offset, data).unwrap()
    }

    pub fn source_bytes(&self) -> Vec<u8> {
        self.tracker.volume_bytes(SOURCE).unwrap()
    }

    /// Event types received so far for `pair_id`.
    pub fn drain_events(&mut self, pair_id: &PairId) -> Vec<String> {
        let mut events = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            if &n.pair_id == pair_id {
                events.push(n.event_type);
            }
        }
        events
    }

    pub async fn shutdown(mut self) {
        self.engine.shutdown().await;
    }
}

fn build_engine(
    config: &EngineConfig,
    transport: &Arc<LoopbackTransport<MemoryChangeTracker>>,
    provisioning: &Arc<StaticProvisioning>,
    credentials: &Arc<StaticCredentials>,
    sink: &Arc<ChannelSink>,
) -> ReplicationEngine {
    let collaborators = Collaborators::new(transport.clone())
        .with_provisioning(provisioning.clone())
        .with_credentials(credentials.clone())
        .with_notifier(sink.clone());
    ReplicationEngine::new(config.clone(), collaborators)
}

/// Poll `check` every 10ms until it holds or `WAIT` elapses.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Wait until the pair reaches `state` and return its snapshot.
pub async fn wait_for_state(engine: &ReplicationEngine, pair_id: &PairId, state: PairState) -> ReplicationPair {
    let mut rx = engine.watch_pair(pair_id).unwrap();
    let waited = tokio::time::timeout(WAIT, rx.wait_for(|pair| pair.state == state)).await;
    match waited {
        Ok(Ok(pair)) => pair.clone(),
        Ok(Err(_)) => panic!("controller for {} stopped before reaching {}", pair_id, state),
        Err(_) => panic!(
            "timed out waiting for {} to reach {} (currently {})",
            pair_id,
            state,
            engine.get_pair(pair_id).unwrap().state
        ),
    }
}

/// Wait until `count` recovery points exist.
pub async fn wait_for_rps(engine: &ReplicationEngine, pair_id: &PairId, count: usize) {
    eventually("recovery points", || {
        engine.list_recovery_points(pair_id).map(|rps| rps.len() >= count).unwrap_or(false)
    })
    .await;
}

/// Wait until the newest RP covers `sequence`.
pub async fn wait_for_sealed(engine: &ReplicationEngine, pair_id: &PairId, sequence: u64) {
    eventually("sealed watermark", || {
        engine
            .list_recovery_points(pair_id)
            .ok()
            .and_then(|rps| rps.last().map(|rp| rp.sequence_watermark >= sequence))
            .unwrap_or(false)
    })
    .await;
}
