//! The Subscribe operation.

use stickypub_core::{
    coordinator_slot, CoordinatorObject, Id160, KeyPair, Message, MessageMeta, SubscriberCollection,
    SubscriberMeta,
};
use stickypub_dht::StoreAdapter;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::Result;

/// A live subscription's cursor into a topic's history. Returned by
/// [`Subscriber::subscribe`] and threaded back into `poll_updates`/`renew`/
/// `unsubscribe`.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    pub topic_id: Id160,
    pub subscriber_id: Id160,
    pub coordinator_slot: u32,
    /// The highest coordinator version this subscriber has already
    /// consumed messages from.
    pub last_seen_version: u64,
}

/// The result of a poll: either nothing new, a normal delta, or a version
/// gap large enough that a full historical re-backfill is warranted
/// instead of trusting `getMessagesSince`.
#[derive(Debug)]
pub enum PollOutcome {
    UpToDate,
    Delta(Vec<MessageMeta>),
    GapRecovered(Vec<MessageMeta>),
}

pub struct Subscriber {
    adapter: StoreAdapter,
    config: ClientConfig,
}

impl Subscriber {
    pub fn new(adapter: StoreAdapter, config: ClientConfig) -> Self {
        Self { adapter, config }
    }

    /// Subscribe to `topic_id`, returning the subscription handle and every
    /// currently-live message's metadata as the initial historical
    /// backfill.
    pub async fn subscribe(
        &self,
        topic_id: Id160,
        keypair: &KeyPair,
        now: i64,
        ttl: i64,
    ) -> Result<(SubscriptionHandle, Vec<MessageMeta>)> {
        let subscriber_id = keypair.public_key().id();
        let slot = coordinator_slot(&topic_id, &subscriber_id, self.config.coordinator_slots);
        let meta = SubscriberMeta::new_signed(keypair, slot, now, now + ttl)?;

        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt: u32 = 0;

        let coordinator_version = loop {
            let existing = self.adapter.load_coordinator_resilient(topic_id).await?;
            let coordinator = existing.clone().unwrap_or_else(|| CoordinatorObject::new(topic_id, now));

            let current_collection = match coordinator.current_subscribers() {
                Some(id) => self
                    .adapter
                    .load_subscriber_collection(id)
                    .await?
                    .unwrap_or_else(|| SubscriberCollection::empty(now)),
                None => SubscriberCollection::empty(now),
            };
            let new_collection = current_collection.add_subscriber(meta.clone());
            let new_coordinator = coordinator.update_subscribers(new_collection.collection_id(), now);

            let accepted = self
                .adapter
                .store_coordinator_with_version_check(existing.as_ref(), &new_coordinator)
                .await?;

            if accepted {
                self.adapter.store_subscriber_collection(&new_collection).await?;
                break new_coordinator.version();
            }

            attempt += 1;
            if attempt >= self.config.catastrophic_threshold {
                return Err(crate::error::ClientError::Catastrophic {
                    topic: topic_id.to_hex(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.retry_max_backoff);
        };

        let backfill = self.historical_messages(topic_id, now).await?;
        let handle = SubscriptionHandle {
            topic_id,
            subscriber_id,
            coordinator_slot: slot,
            last_seen_version: coordinator_version,
        };
        Ok((handle, backfill))
    }

    async fn historical_messages(&self, topic_id: Id160, now: i64) -> Result<Vec<MessageMeta>> {
        let Some(coordinator) = self.adapter.load_coordinator(topic_id).await? else {
            return Ok(Vec::new());
        };
        let Some(collection_id) = coordinator.current_messages() else {
            return Ok(Vec::new());
        };
        let collection = self
            .adapter
            .load_message_collection(collection_id)
            .await?
            .unwrap_or_else(|| stickypub_core::MessageCollection::empty(0));
        Ok(collection.remove_expired(now).messages().to_vec())
    }

    /// `pollUpdates(handle, now)`: fetch anything published since
    /// `handle.last_seen_version`, dropping anything already expired by
    /// `now`. A coordinator version jump of more than one since the last
    /// poll means the delta may not reflect the full set of changes (some
    /// intermediate version's messages may have since been pruned), so that
    /// case is reported as `GapRecovered` rather than `Delta` even though
    /// both carry the same underlying query.
    pub async fn poll_updates(&self, handle: &mut SubscriptionHandle, now: i64) -> Result<PollOutcome> {
        let Some(coordinator) = self.adapter.load_coordinator(handle.topic_id).await? else {
            return Err(crate::error::ClientError::NotSubscribed(handle.topic_id.to_hex()));
        };
        let still_subscribed = match coordinator.current_subscribers() {
            Some(id) => self
                .adapter
                .load_subscriber_collection(id)
                .await?
                .map(|c| c.has_subscriber(handle.subscriber_id))
                .unwrap_or(false),
            None => false,
        };
        if !still_subscribed {
            return Err(crate::error::ClientError::NotSubscribed(handle.topic_id.to_hex()));
        }
        if coordinator.version() <= handle.last_seen_version {
            return Ok(PollOutcome::UpToDate);
        }

        let Some(collection_id) = coordinator.current_messages() else {
            handle.last_seen_version = coordinator.version();
            return Ok(PollOutcome::UpToDate);
        };
        let collection = self
            .adapter
            .load_message_collection(collection_id)
            .await?
            .unwrap_or_else(|| stickypub_core::MessageCollection::empty(0));

        let is_gap = coordinator.version() > handle.last_seen_version + 1;
        let delta: Vec<MessageMeta> = collection
            .get_messages_since(handle.last_seen_version)
            .into_iter()
            .filter(|m| m.expires_at > now)
            .collect();

        handle.last_seen_version = coordinator.version();

        if is_gap {
            debug!(topic = %handle.topic_id, from_version = handle.last_seen_version, "coordinator version gap detected, recovering via bounded replay");
            Ok(PollOutcome::GapRecovered(delta))
        } else {
            Ok(PollOutcome::Delta(delta))
        }
    }

    /// Resolve a batch of metadata entries into full, verifiable messages.
    pub async fn resolve(&self, metas: &[MessageMeta]) -> Result<Vec<Message>> {
        let ids: Vec<Id160> = metas.iter().map(|m| m.message_id).collect();
        Ok(self.adapter.load_messages(&ids).await?)
    }

    /// `renew(handle, newExpiresAt)`
    pub async fn renew(
        &self,
        handle: &SubscriptionHandle,
        keypair: &KeyPair,
        now: i64,
        new_expires_at: i64,
    ) -> Result<()> {
        let new_meta = SubscriberMeta::new_signed(keypair, handle.coordinator_slot, now, new_expires_at)?;

        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            let existing = self.adapter.load_coordinator_resilient(handle.topic_id).await?;
            let Some(coordinator) = existing.clone() else {
                return Err(crate::error::ClientError::NotSubscribed(handle.topic_id.to_hex()));
            };
            let Some(collection_id) = coordinator.current_subscribers() else {
                return Err(crate::error::ClientError::NotSubscribed(handle.topic_id.to_hex()));
            };
            let current_collection = self
                .adapter
                .load_subscriber_collection(collection_id)
                .await?
                .unwrap_or_else(|| SubscriberCollection::empty(now));
            if !current_collection.has_subscriber(handle.subscriber_id) {
                return Err(crate::error::ClientError::NotSubscribed(handle.topic_id.to_hex()));
            }
            let new_collection = current_collection.renew(
                handle.subscriber_id,
                new_expires_at,
                new_meta.signature.clone(),
            );
            let new_coordinator = coordinator.update_subscribers(new_collection.collection_id(), now);

            let accepted = self
                .adapter
                .store_coordinator_with_version_check(Some(&coordinator), &new_coordinator)
                .await?;
            if accepted {
                self.adapter.store_subscriber_collection(&new_collection).await?;
                return Ok(());
            }
            attempt += 1;
            if attempt >= self.config.catastrophic_threshold {
                return Err(crate::error::ClientError::Catastrophic {
                    topic: handle.topic_id.to_hex(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.retry_max_backoff);
        }
    }

    /// `unsubscribe(handle)`
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle, now: i64) -> Result<()> {
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            let existing = self.adapter.load_coordinator_resilient(handle.topic_id).await?;
            let Some(coordinator) = existing.clone() else {
                return Ok(());
            };
            let Some(collection_id) = coordinator.current_subscribers() else {
                return Ok(());
            };
            let current_collection = self
                .adapter
                .load_subscriber_collection(collection_id)
                .await?
                .unwrap_or_else(|| SubscriberCollection::empty(now));
            if !current_collection.has_subscriber(handle.subscriber_id) {
                return Ok(());
            }
            let new_collection = current_collection.remove_subscriber(handle.subscriber_id);
            let new_coordinator = coordinator.update_subscribers(new_collection.collection_id(), now);

            let accepted = self
                .adapter
                .store_coordinator_with_version_check(Some(&coordinator), &new_coordinator)
                .await?;
            if accepted {
                self.adapter.store_subscriber_collection(&new_collection).await?;
                return Ok(());
            }
            attempt += 1;
            if attempt >= self.config.catastrophic_threshold {
                return Err(crate::error::ClientError::Catastrophic {
                    topic: handle.topic_id.to_hex(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.retry_max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stickypub_dht::{MemoryDht, NodeInfo};
    use std::sync::Arc;

    fn subscriber() -> Subscriber {
        let node = NodeInfo::new(Id160::new(b"n1"), "memory://n1".into());
        let adapter = StoreAdapter::new(Arc::new(MemoryDht::standalone(node)));
        Subscriber::new(adapter, ClientConfig::default())
    }

    #[tokio::test]
    async fn subscribe_registers_and_backfills_empty_topic() {
        let sub = subscriber();
        let kp = KeyPair::generate();
        let topic = Id160::new(b"topic");

        let (handle, backfill) = sub.subscribe(topic, &kp, 0, 3_600_000).await.unwrap();
        assert!(backfill.is_empty());
        assert_eq!(handle.last_seen_version, 1);

        let coordinator = sub.adapter.load_coordinator(topic).await.unwrap().unwrap();
        let collection = sub
            .adapter
            .load_subscriber_collection(coordinator.current_subscribers().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(collection.has_subscriber(handle.subscriber_id));
    }

    #[tokio::test]
    async fn poll_updates_reports_up_to_date_with_no_changes() {
        let sub = subscriber();
        let kp = KeyPair::generate();
        let topic = Id160::new(b"topic");
        let (mut handle, _) = sub.subscribe(topic, &kp, 0, 3_600_000).await.unwrap();

        let outcome = sub.poll_updates(&mut handle, 0).await.unwrap();
        assert!(matches!(outcome, PollOutcome::UpToDate));
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let sub = subscriber();
        let kp = KeyPair::generate();
        let topic = Id160::new(b"topic");
        let (handle, _) = sub.subscribe(topic, &kp, 0, 3_600_000).await.unwrap();

        sub.unsubscribe(&handle, 10).await.unwrap();

        let coordinator = sub.adapter.load_coordinator(topic).await.unwrap().unwrap();
        let collection = sub
            .adapter
            .load_subscriber_collection(coordinator.current_subscribers().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!collection.has_subscriber(handle.subscriber_id));
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let sub = subscriber();
        let kp = KeyPair::generate();
        let topic = Id160::new(b"topic");
        let (handle, _) = sub.subscribe(topic, &kp, 0, 1_000).await.unwrap();

        sub.renew(&handle, &kp, 10, 100_000).await.unwrap();

        let coordinator = sub.adapter.load_coordinator(topic).await.unwrap().unwrap();
        let collection = sub
            .adapter
            .load_subscriber_collection(coordinator.current_subscribers().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            collection.get_subscriber(handle.subscriber_id).unwrap().expires_at,
            100_000
        );
    }
}
