//! The Publish operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stickypub_core::{
    assign_initiator_index, CoordinatorObject, CoordinatorState, Id160, KeyPair, Message, MessageCollection,
};
use stickypub_dht::StoreAdapter;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::sequence::SequenceTracker;

/// Wire payload for the low-latency push-delivery hook: tells the receiving
/// subscriber which topic has new messages so it can poll immediately
/// instead of waiting out its poll interval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushNotification {
    pub topic_id: Id160,
}

/// Publishes messages to topics, handling sequence assignment, signing,
/// and the coordinator CAS retry loop.
pub struct Publisher {
    adapter: StoreAdapter,
    sequencer: Arc<dyn SequenceTracker>,
    config: ClientConfig,
}

impl Publisher {
    pub fn new(adapter: StoreAdapter, sequencer: Arc<dyn SequenceTracker>, config: ClientConfig) -> Self {
        Self {
            adapter,
            sequencer,
            config,
        }
    }

    /// Publish a single message to `topic_id`, returning its `messageID`
    /// once it is durably reflected in the topic's coordinator.
    pub async fn publish(
        &self,
        topic_id: Id160,
        keypair: &KeyPair,
        data: Vec<u8>,
        now: i64,
        expires_at: i64,
    ) -> Result<Id160> {
        let ids = self.publish_batch(topic_id, keypair, vec![(data, expires_at)], now).await?;
        Ok(ids[0])
    }

    /// Publish several messages from the same publisher in one coordinator
    /// update round: every message is signed and stored individually, but
    /// the retry loop commits all of them into a single new
    /// `MessageCollection` and coordinator version bump, so a burst of
    /// publishes costs one CAS round trip instead of one per message.
    pub async fn publish_batch(
        &self,
        topic_id: Id160,
        keypair: &KeyPair,
        items: Vec<(Vec<u8>, i64)>,
        now: i64,
    ) -> Result<Vec<Id160>> {
        let publisher_id = keypair.public_key().id();
        let mut messages = Vec::with_capacity(items.len());
        for (data, expires_at) in items {
            let sequence = self.sequencer.next(topic_id)?;
            let mut message = Message::new(topic_id, publisher_id, sequence, data, now, expires_at)?;
            message.sign(keypair)?;
            self.adapter.store_message(&message).await?;
            messages.push(message);
        }

        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            let existing = self.adapter.load_coordinator_resilient(topic_id).await?;
            let coordinator = existing.clone().unwrap_or_else(|| CoordinatorObject::new(topic_id, now));

            let current_collection = match coordinator.current_messages() {
                Some(id) => self
                    .adapter
                    .load_message_collection(id)
                    .await?
                    .unwrap_or_else(|| MessageCollection::empty(now)),
                None => MessageCollection::empty(now),
            };

            let new_collection = messages.iter().fold(current_collection, |collection, message| {
                let mut meta = message.to_meta();
                meta.added_in_version = coordinator.version() + 1;
                collection.add_message(meta)
            });

            let mut new_coordinator = coordinator.update_messages(new_collection.collection_id(), now);
            let snapshot = if new_coordinator.needs_pruning() {
                let (pruned, snapshot) = new_coordinator.prune(now);
                new_coordinator = pruned;
                Some(snapshot)
            } else {
                None
            };

            let accepted = self
                .adapter
                .store_coordinator_with_version_check(existing.as_ref(), &new_coordinator)
                .await?;

            if accepted {
                self.adapter.store_message_collection(&new_collection).await?;
                if let Some(snapshot) = snapshot {
                    self.adapter.store_snapshot(&snapshot).await?;
                }
                self.trigger_push_delivery(topic_id, &new_coordinator, now).await;
                return Ok(messages.iter().map(|m| m.message_id).collect());
            }

            attempt += 1;
            debug!(topic = %topic_id, attempt, "coordinator CAS conflict, retrying publish");
            if attempt >= self.config.catastrophic_threshold {
                match self.attempt_recovery(topic_id, now).await {
                    Ok(()) => {
                        debug!(topic = %topic_id, "coordinator recovered after sustained contention, resuming retry");
                        attempt = 0;
                        backoff = self.config.retry_initial_backoff;
                        continue;
                    }
                    Err(err) => {
                        warn!(topic = %topic_id, %err, "coordinator recovery failed, marking FAILED");
                        self.mark_failed(topic_id, now).await;
                        return Err(ClientError::Catastrophic {
                            topic: topic_id.to_hex(),
                            attempts: attempt,
                        });
                    }
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.retry_max_backoff);
        }
    }

    /// Sustained CAS contention past the catastrophic threshold doesn't by
    /// itself mean the coordinator is broken -- it's marked `RECOVERING`,
    /// revalidated structurally and against its referenced collections, and
    /// restored to `ACTIVE` if that all checks out. Only a failure during
    /// revalidation itself is truly catastrophic.
    async fn attempt_recovery(&self, topic_id: Id160, now: i64) -> Result<()> {
        let current = self
            .adapter
            .load_coordinator_resilient(topic_id)
            .await?
            .ok_or_else(|| ClientError::Validation(stickypub_core::Error::Validation("coordinator missing during recovery".into())))?;

        let recovering = current.update_state(CoordinatorState::Recovering, now);
        self.adapter
            .store_coordinator_with_version_check(Some(&current), &recovering)
            .await?;

        let reloaded = self
            .adapter
            .load_coordinator_resilient(topic_id)
            .await?
            .ok_or_else(|| ClientError::Validation(stickypub_core::Error::Validation("coordinator missing after marking RECOVERING".into())))?;
        reloaded.validate()?;

        if let Some(id) = reloaded.current_messages() {
            self.adapter
                .load_message_collection(id)
                .await?
                .ok_or_else(|| ClientError::Validation(stickypub_core::Error::Validation("current message collection unloadable during recovery".into())))?;
        }
        if let Some(id) = reloaded.current_subscribers() {
            self.adapter
                .load_subscriber_collection(id)
                .await?
                .ok_or_else(|| ClientError::Validation(stickypub_core::Error::Validation("current subscriber collection unloadable during recovery".into())))?;
        }

        let active = reloaded.update_state(CoordinatorState::Active, now);
        self.adapter
            .store_coordinator_with_version_check(Some(&reloaded), &active)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, topic_id: Id160, now: i64) {
        match self.adapter.load_coordinator_resilient(topic_id).await {
            Ok(Some(current)) => {
                let failed = current.update_state(CoordinatorState::Failed, now);
                if let Err(err) = self
                    .adapter
                    .store_coordinator_with_version_check(Some(&current), &failed)
                    .await
                {
                    warn!(topic = %topic_id, %err, "failed to mark coordinator FAILED after catastrophic publish failure");
                }
            }
            _ => warn!(topic = %topic_id, "could not load coordinator to mark FAILED after catastrophic publish failure"),
        }
    }

    /// On a successful publish, push a lightweight notification to every
    /// active subscriber this node is responsible for initiating delivery
    /// to, so they can poll immediately instead of waiting for their next
    /// interval. Best-effort: polling remains the source of truth, so any
    /// failure here is swallowed rather than surfaced to the publisher.
    async fn trigger_push_delivery(&self, topic_id: Id160, coordinator: &CoordinatorObject, now: i64) {
        let Some(subscribers_id) = coordinator.current_subscribers() else {
            return;
        };
        let Ok(Some(collection)) = self.adapter.load_subscriber_collection(subscribers_id).await else {
            return;
        };
        let initiators = match self.adapter.find_node(topic_id).await {
            Ok(nodes) if !nodes.is_empty() => nodes,
            _ => return,
        };

        let local_id = self.adapter.dht().local_node().node_id;
        let Ok(payload) = postcard::to_allocvec(&PushNotification { topic_id }) else {
            return;
        };

        for sub in collection.subscribers() {
            if sub.expires_at <= now {
                continue;
            }
            let idx = assign_initiator_index(&sub.subscriber_id, &topic_id, initiators.len());
            if initiators[idx].node_id != local_id {
                continue;
            }
            let Ok(targets) = self.adapter.find_node(sub.subscriber_id).await else {
                continue;
            };
            if let Some(target) = targets.first() {
                let _ = self.adapter.send_message(target, payload.clone()).await;
            }
        }
    }
}
