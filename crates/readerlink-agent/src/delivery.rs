// ABOUTME: Delivery loop that drains the record store through the supervisor, oldest record first.
// ABOUTME: A record leaves the store only after the broker acknowledged it; failed removals are retried on later ticks.

//! Records are normally delivered in timestamp order. A record whose publish
//! fails stays pending and is retried on a later tick, so while it waits a
//! newer record may be delivered first. Delivery is at-least-once: a crash
//! between acknowledgement and removal re-sends the record after restart.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use readerlink_core::{Record, RecordKey, SharedSettings, StatusEvent, StatusEvents};
use readerlink_store::RecordStore;

use crate::supervisor::SupervisorHandle;
use crate::topics::DeviceTopics;
use crate::transport::{OutboundMessage, QoS};

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The supervisor was not connected; nothing was attempted.
    NotConnected,
    /// No eligible record was pending.
    Idle,
    /// Published and removed from the store.
    Delivered(RecordKey),
    /// Published, but the removal could not be persisted. The key is held
    /// back from selection until a later tick removes it.
    DeliveredPendingRemoval(RecordKey),
    /// The publish failed or timed out; the record stays pending.
    Failed(RecordKey),
}

pub struct DeliveryLoop {
    store: Arc<RecordStore>,
    supervisor: SupervisorHandle,
    settings: SharedSettings,
    status: StatusEvents,
    read_topic: String,
    in_flight: HashSet<RecordKey>,
    pending_removal: BTreeSet<RecordKey>,
}

impl DeliveryLoop {
    pub fn new(
        store: Arc<RecordStore>,
        supervisor: SupervisorHandle,
        settings: SharedSettings,
        topics: &DeviceTopics,
        status: StatusEvents,
    ) -> Self {
        Self {
            store,
            supervisor,
            settings,
            status,
            read_topic: topics.read.clone(),
            in_flight: HashSet::new(),
            pending_removal: BTreeSet::new(),
        }
    }

    /// Keys with a publish attempt in progress.
    pub fn in_flight(&self) -> &HashSet<RecordKey> {
        &self.in_flight
    }

    /// Delivered keys whose removal still has to be persisted.
    pub fn pending_removal(&self) -> &BTreeSet<RecordKey> {
        &self.pending_removal
    }

    /// Tick forever, sleeping the configured delivery interval between
    /// ticks. Stops when the task is aborted.
    pub async fn run(mut self) {
        loop {
            let interval = self.settings.read().await.delivery_interval();
            tokio::time::sleep(interval).await;

            let outcome = self.tick().await;
            tracing::trace!(?outcome, "delivery tick");
        }
    }

    /// Attempt to deliver the oldest eligible record.
    pub async fn tick(&mut self) -> TickOutcome {
        if !self.supervisor.state().is_connected() {
            return TickOutcome::NotConnected;
        }

        self.retry_one_removal().await;

        let excluded: HashSet<RecordKey> = self
            .in_flight
            .iter()
            .chain(self.pending_removal.iter())
            .cloned()
            .collect();
        let Some(record) = self.store.oldest_excluding(&excluded).await else {
            return TickOutcome::Idle;
        };
        let key = record.key.clone();

        self.in_flight.insert(key.clone());
        let delivered = self.publish(&record).await;
        self.in_flight.remove(&key);

        if !delivered {
            tracing::warn!(key = %key, "record delivery failed, will retry");
            self.status.emit(StatusEvent::PublishFail { key: key.clone() });
            return TickOutcome::Failed(key);
        }

        self.status.emit(StatusEvent::PublishOk { key: key.clone() });
        match self.store.remove(&key).await {
            Ok(_) => {
                tracing::info!(key = %key, "record delivered");
                TickOutcome::Delivered(key)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "record delivered but removal failed, will retry removal");
                self.pending_removal.insert(key.clone());
                TickOutcome::DeliveredPendingRemoval(key)
            }
        }
    }

    async fn publish(&self, record: &Record) -> bool {
        let payload = match record.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(key = %record.key, error = %e, "failed to encode record");
                return false;
            }
        };

        let timeout = self.settings.read().await.publish_timeout();
        let message = OutboundMessage::new(self.read_topic.clone(), payload, QoS::AtLeastOnce);
        self.supervisor.publish(message, timeout).await
    }

    /// Retry at most one outstanding removal.
    async fn retry_one_removal(&mut self) {
        let Some(key) = self.pending_removal.first().cloned() else {
            return;
        };

        match self.store.remove(&key).await {
            Ok(removed) => {
                tracing::info!(key = %key, removed, "deferred removal completed");
                self.pending_removal.remove(&key);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "deferred removal failed again");
            }
        }
    }
}
