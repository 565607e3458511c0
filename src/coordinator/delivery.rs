// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live delivery: source change stream into the recovery point store.
//!
//! One task per `Replicating` pair:
//!
//! 1. Fetch records after `acked_through` (through the fetch circuit)
//! 2. Decompress and validate each payload
//! 3. Ingest the batch (through the ingest circuit)
//! 4. Acknowledge to the source so it can release its buffer
//!
//! Delivery always resumes from the RPS's acknowledged sequence, so records
//! reach the RPS in sequence order across reconnects and redelivery is
//! absorbed by ingest dedup.
//!
//! # Failures
//!
//! | Error | Reaction |
//! |---|---|
//! | `TransportDisconnected` (or circuit open) | report outage once, back off, retry |
//! | `AuthExpired` | refresh credential and re-authenticate, give up after `auth_refresh_attempts` |
//! | evicted buffer | report to controller and exit (resync needed) |
//! | anything fatal | report to controller and exit |
//!
//! The controller owns every state change; this task only reports.

use super::{EngineContext, PairEvent};
use crate::circuit_breaker::DeliveryCircuit;
use crate::error::{ReplicationError, Result};
use crate::model::{ChangeRecord, PairId};
use crate::resync::decode;
use crate::transport::FetchOutcome;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// What delivery tells the controller.
#[derive(Debug)]
pub(crate) enum DeliveryEvent {
    Progress { acked_through: u64, head_sequence: u64 },
    Disconnected { since: chrono::DateTime<Utc>, reason: String },
    Reconnected,
    Evicted { requested: u64, oldest_available: u64 },
    Failed(ReplicationError),
}

enum Step {
    Idle,
    Delivered,
    Exit,
}

pub(crate) struct DeliveryTask {
    ctx: Arc<EngineContext>,
    pair_id: PairId,
    source_ref: String,
    epoch: u64,
    events: mpsc::UnboundedSender<PairEvent>,
    circuit: DeliveryCircuit,
    disconnected: bool,
    auth_failures: u32,
}

impl DeliveryTask {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        pair_id: PairId,
        source_ref: String,
        epoch: u64,
        events: mpsc::UnboundedSender<PairEvent>,
    ) -> Self {
        let circuit = DeliveryCircuit::new(ctx.settings.delivery.circuit_config());
        Self {
            ctx,
            pair_id,
            source_ref,
            epoch,
            events,
            circuit,
            disconnected: false,
            auth_failures: 0,
        }
    }

    fn report(&self, event: DeliveryEvent) {
        // Controller gone means the pair is shutting down.
        let _ = self.events.send(PairEvent::Delivery {
            epoch: self.epoch,
            event,
        });
    }

    pub(crate) async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let span = info_span!("delivery", pair_id = %self.pair_id, epoch = self.epoch);
        async move {
            let poll = self.ctx.settings.delivery.poll_interval_duration();
            let backoff = self.ctx.settings.delivery.retry_config();
            let mut failures = 0usize;
            info!(source = %self.source_ref, "Delivery started");

            loop {
                if *cancel.borrow() {
                    break;
                }

                let pause = match self.step().await {
                    Ok(Step::Delivered) => {
                        failures = 0;
                        None
                    }
                    Ok(Step::Idle) => {
                        failures = 0;
                        Some(poll)
                    }
                    Ok(Step::Exit) => break,
                    Err(e) => match self.on_error(e).await {
                        Some(()) => {
                            failures += 1;
                            Some(backoff.delay_for_attempt(failures))
                        }
                        None => break,
                    },
                };

                if let Some(pause) = pause {
                    tokio::select! {
                        biased;
                        _ = crate::admission::wait_cancelled(&mut cancel) => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
            info!("Delivery stopped");
        }
        .instrument(span)
        .await
    }

    /// One fetch → ingest → acknowledge round.
    async fn step(&mut self) -> Result<Step> {
        let after = self.ctx.rps.acked_through(&self.pair_id)?;
        let batch = self.ctx.settings.delivery.batch_size;
        let started = Instant::now();

        let transport = &self.ctx.transport;
        let (pair_id, source) = (&self.pair_id, self.source_ref.as_str());
        let outcome = self
            .circuit
            .fetch
            .call(|| transport.fetch_changes(pair_id, source, after, batch))
            .await
            .map_err(|e| e.into_replication(source))?;

        if self.disconnected {
            self.disconnected = false;
            info!("Transport reachable again");
            self.report(DeliveryEvent::Reconnected);
        }
        self.auth_failures = 0;

        let (records, head_sequence) = match outcome {
            FetchOutcome::Evicted { oldest_available } => {
                warn!(after, oldest_available, "Source evicted undelivered changes");
                self.report(DeliveryEvent::Evicted {
                    requested: after,
                    oldest_available,
                });
                return Ok(Step::Exit);
            }
            FetchOutcome::Records { records, head_sequence } => (records, head_sequence),
        };
        crate::metrics::record_fetch(self.pair_id.as_str(), records.len(), started.elapsed());

        if records.is_empty() {
            self.report(DeliveryEvent::Progress {
                acked_through: after,
                head_sequence,
            });
            return Ok(Step::Idle);
        }

        let decoded = records.into_iter().map(decode).collect::<Result<Vec<ChangeRecord>>>()?;
        let rps = &self.ctx.rps;
        let ack = self
            .circuit
            .ingest
            .call(|| rps.ingest_batch(pair_id, decoded))
            .await
            .map_err(|e| e.into_replication("recovery_point_store"))?;

        if ack.acked_through > after {
            if let Err(e) = transport.acknowledge(source, ack.acked_through).await {
                debug!(through = ack.acked_through, error = %e, "Acknowledge failed, will repeat");
            }
        }
        self.report(DeliveryEvent::Progress {
            acked_through: ack.acked_through,
            head_sequence,
        });
        Ok(Step::Delivered)
    }

    /// `Some(())` to back off and retry, `None` to exit.
    async fn on_error(&mut self, error: ReplicationError) -> Option<()> {
        crate::metrics::record_delivery_error(self.pair_id.as_str(), error.kind());

        match error {
            ReplicationError::AuthExpired { .. } => {
                self.auth_failures += 1;
                let attempts = self.ctx.settings.delivery.auth_refresh_attempts.max(1);
                match self.refresh_credentials().await {
                    Ok(()) => {
                        crate::metrics::record_credential_refresh(self.pair_id.as_str(), true);
                        info!("Credentials refreshed");
                        Some(())
                    }
                    Err(e) if self.auth_failures < attempts => {
                        crate::metrics::record_credential_refresh(self.pair_id.as_str(), false);
                        warn!(attempt = self.auth_failures, error = %e, "Credential refresh failed");
                        Some(())
                    }
                    Err(e) => {
                        crate::metrics::record_credential_refresh(self.pair_id.as_str(), false);
                        self.report(DeliveryEvent::Failed(e));
                        None
                    }
                }
            }
            e if e.is_retryable() => {
                if !self.disconnected {
                    self.disconnected = true;
                    warn!(error = %e, "Delivery interrupted");
                    self.report(DeliveryEvent::Disconnected {
                        since: Utc::now(),
                        reason: e.to_string(),
                    });
                } else {
                    debug!(error = %e, "Still unable to deliver");
                }
                Some(())
            }
            e => {
                warn!(error = %e, "Delivery failed");
                self.report(DeliveryEvent::Failed(e));
                None
            }
        }
    }

    async fn refresh_credentials(&self) -> Result<()> {
        let credential = self.ctx.credentials.fetch(&self.source_ref).await?;
        self.ctx.transport.authenticate(&self.source_ref, credential).await
    }
}
