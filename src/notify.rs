// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound event notifications.
//!
//! The core emits a [`Notification`] for every transition, health change,
//! recovery point seal, merge and prune. Delivery is fire-and-forget: sinks
//! must not block and no core behavior depends on whether a notification
//! arrives.

use crate::model::PairId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// One emitted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub pair_id: PairId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl Notification {
    pub fn new(pair_id: &PairId, event_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            pair_id: pair_id.clone(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Receives notifications. Implementations must return promptly.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

/// Logs every notification at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, n: Notification) {
        info!(
            pair_id = %n.pair_id,
            event_type = %n.event_type,
            detail = %n.detail,
            "Replication event"
        );
    }
}

/// Fans notifications out over a tokio broadcast channel.
///
/// Slow subscribers lag and lose events; the sender never waits.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

/// Emit through `sink` and count it.
pub(crate) fn emit(sink: &dyn NotificationSink, pair_id: &PairId, event_type: &str, detail: impl Into<String>) {
    crate::metrics::record_notification(event_type);
    sink.notify(Notification::new(pair_id, event_type, detail));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_to_subscribers() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();
        let pair = PairId::from("p-1");

        emit(&sink, &pair, "state_changed", "Stopped -> Syncing");

        let n = rx.recv().await.unwrap();
        assert_eq!(n.pair_id, pair);
        assert_eq!(n.event_type, "state_changed");
        assert_eq!(n.detail, "Stopped -> Syncing");
    }

    #[test]
    fn test_channel_sink_without_subscribers() {
        let sink = ChannelSink::new(1);
        sink.notify(Notification::new(&PairId::from("p"), "merge", "rp 1 -> 2"));
    }

    #[test]
    fn test_tracing_sink_never_panics() {
        TracingSink.notify(Notification::new(&PairId::from("p"), "prune", ""));
    }
}
