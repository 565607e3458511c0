//! # Volume Replication
//!
//! Continuous block-volume replication core: every write on a source volume
//! is captured, shipped and folded into a chain of recovery points on a
//! target, from which any retained point in time can be reconstructed.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           volume-replication                              │
//! │                                                                           │
//! │  ┌───────────────┐   ┌───────────┐   ┌─────────────────────────────────┐  │
//! │  │ ChangeTracker │──►│ Transport │──►│ RecoveryPointStore              │  │
//! │  │ (source side) │   │ (zstd)    │   │ ingest → seal CCRP/ACRP → chain │  │
//! │  └───────────────┘   └───────────┘   └─────────────────────────────────┘  │
//! │          ▲                 ▲                 │               ▲            │
//! │          │ block reads     │                 ▼               │ merge/prune│
//! │  ┌───────────────────┐     │        ┌────────────────┐  ┌──────────────┐  │
//! │  │ ResyncCoordinator │─────┘        │ MetadataStore  │  │ Retention    │  │
//! │  │ baseline / resync │              │ (SQLite)       │  │ sweep        │  │
//! │  └───────────────────┘              └────────────────┘  └──────────────┘  │
//! │                                                                           │
//! │  ReplicationEngine: pair registry, one controller per pair (state machine)│
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pair lifecycle
//!
//! `Uninitialized → Syncing → Replicating ⇄ Suspended`, with `Resyncing` to
//! repair gaps and `Stopped` / `Deleted` for teardown. See
//! [`coordinator::next_state`] for the full table.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use volume_replication::tracker::{MemoryChangeTracker, TrackerConfig};
//! use volume_replication::transport::LoopbackTransport;
//! use volume_replication::{Collaborators, CreatePairRequest, EngineConfig, ReplicationEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let tracker = Arc::new(MemoryChangeTracker::new(TrackerConfig::default()));
//!     tracker.attach("vol-a", 1 << 20);
//!     let transport = Arc::new(LoopbackTransport::new(tracker));
//!
//!     let mut engine = ReplicationEngine::new(EngineConfig::default(), Collaborators::new(transport));
//!     engine.start().await.expect("Failed to start");
//!
//!     let pair_id = engine
//!         .create_pair(CreatePairRequest::new("vol-a", "vol-b"))
//!         .await
//!         .expect("Failed to create pair");
//!     engine.start_pair(&pair_id).await.expect("Failed to start pair");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod admission;
pub mod circuit_breaker;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extent;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod resilience;
pub mod retention;
pub mod rps;
pub mod resync;
pub mod store;
pub mod tracker;
pub mod transport;

// Re-exports for convenience
pub use collaborators::{Credential, CredentialProvider, ProvisioningService, StaticCredentials, StaticProvisioning};
pub use config::{EngineConfig, EngineSettings, PeakSchedule, RetentionPolicy, StoreConfig};
pub use coordinator::{
    Collaborators, Command, CreatePairRequest, EngineState, HealthCheck, PairHealth, PairState, RecoveryJob,
    ReplicationEngine,
};
pub use error::{FailureReport, ReplicationError, Result};
pub use extent::{ExtentMap, VolumeImage};
pub use model::{ChangeRecord, Health, PairId, RecoveryPoint, RecoveryTarget, ReplicationPair, RpId, RpKind};
pub use notify::{ChannelSink, Notification, NotificationSink, TracingSink};
pub use rps::RecoveryPointStore;
pub use transport::{LoopbackTransport, Transport};
