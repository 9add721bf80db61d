//! PubSub Client Facade: the single entry point an application talks to,
//! wrapping the publish/subscribe operations with a topic-keyed event
//! surface, a dedup cache, and a background polling loop -- a long-lived
//! handle with spawned background tasks and a broadcast-channel shutdown
//! signal.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use stickypub_core::{Id160, KeyPair, Message, MessageMeta};
use stickypub_dht::{DhtClient, StoreAdapter};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::publish::{Publisher, PushNotification};
use crate::sequence::SequenceTracker;
use crate::subscribe::{PollOutcome, SubscriptionHandle, Subscriber};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Aggregate counters exposed by [`PubSubClient::get_stats`].
#[derive(Clone, Debug, Default)]
pub struct ClientStats {
    pub topics_subscribed: usize,
    pub messages_delivered: u64,
    pub messages_deduped: u64,
    pub poll_count: u64,
}

struct DedupCache {
    window: Duration,
    capacity: usize,
    seen: HashMap<Id160, Instant>,
    order: VecDeque<Id160>,
}

impl DedupCache {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if `id` had not been seen within the window (and
    /// records it), `false` if it's a duplicate.
    fn check_and_insert(&mut self, id: Id160, now: Instant) -> bool {
        if let Some(seen_at) = self.seen.get(&id) {
            if now.duration_since(*seen_at) < self.window {
                return false;
            }
        }
        self.seen.insert(id, now);
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

struct TopicSubscription {
    handle: SubscriptionHandle,
    task: tokio::task::JoinHandle<()>,
}

/// The facade an application embeds: publish to topics, subscribe to
/// topics, and receive delivered messages deduplicated across the poll
/// loop and any push notifications.
pub struct PubSubClient {
    adapter: StoreAdapter,
    publisher: Publisher,
    subscriber: Arc<Subscriber>,
    config: ClientConfig,
    topics: Mutex<HashMap<Id160, TopicSubscription>>,
    dedup: Arc<Mutex<DedupCache>>,
    stats: Arc<Mutex<ClientStats>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PubSubClient {
    pub fn new(adapter: StoreAdapter, sequencer: Arc<dyn SequenceTracker>, config: ClientConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let dedup = Arc::new(Mutex::new(DedupCache::new(config.dedup_window, config.dedup_capacity)));
        Self {
            publisher: Publisher::new(adapter.clone(), sequencer, config.clone()),
            subscriber: Arc::new(Subscriber::new(adapter.clone(), config.clone())),
            adapter,
            config,
            topics: Mutex::new(HashMap::new()),
            dedup,
            stats: Arc::new(Mutex::new(ClientStats::default())),
            shutdown_tx,
        }
    }

    pub async fn publish(
        &self,
        topic_id: Id160,
        keypair: &KeyPair,
        data: Vec<u8>,
        now: i64,
        expires_at: i64,
    ) -> Result<Id160> {
        self.publisher.publish(topic_id, keypair, data, now, expires_at).await
    }

    /// Subscribe to `topic_id`. Historical messages are delivered first
    /// (deduplicated the same as live ones), then the returned receiver
    /// keeps streaming new messages until `unsubscribe` or `shutdown`.
    pub async fn subscribe(
        &self,
        topic_id: Id160,
        keypair: &KeyPair,
        now: i64,
        ttl: i64,
    ) -> Result<mpsc::Receiver<Message>> {
        {
            let topics = self.topics.lock();
            if topics.contains_key(&topic_id) {
                return Err(ClientError::AlreadySubscribed(topic_id.to_hex()));
            }
        }

        let (handle, backfill_metas) = self.subscriber.subscribe(topic_id, keypair, now, ttl).await?;
        let (tx, rx) = mpsc::channel(128);

        self.deliver(&tx, &backfill_metas, now).await;

        let task = self.spawn_poll_task(handle.clone(), tx);
        self.topics.lock().insert(topic_id, TopicSubscription { handle, task });
        self.stats.lock().topics_subscribed = self.topics.lock().len();
        Ok(rx)
    }

    pub async fn unsubscribe(&self, topic_id: Id160, now: i64) -> Result<()> {
        let removed = self.topics.lock().remove(&topic_id);
        let Some(subscription) = removed else {
            return Err(ClientError::NotSubscribed(topic_id.to_hex()));
        };
        subscription.task.abort();
        self.subscriber.unsubscribe(&subscription.handle, now).await?;
        self.stats.lock().topics_subscribed = self.topics.lock().len();
        Ok(())
    }

    pub fn get_stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }

    /// Signal every background poll task to stop and wait for them to
    /// finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let subscriptions: Vec<TopicSubscription> = self.topics.lock().drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            subscription.task.abort();
        }
    }

    fn spawn_poll_task(
        &self,
        mut handle: SubscriptionHandle,
        tx: mpsc::Sender<Message>,
    ) -> tokio::task::JoinHandle<()> {
        let subscriber = self.subscriber.clone();
        let adapter = self.adapter.clone();
        let dedup = self.dedup.clone();
        let stats = self.stats.clone();
        let poll_interval = self.config.poll_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    push = adapter.dht().recv_push() => {
                        match push {
                            Some(envelope) => match postcard::from_bytes::<PushNotification>(&envelope.payload) {
                                Ok(notification) if notification.topic_id == handle.topic_id => {}
                                Ok(_) => continue,
                                Err(err) => {
                                    warn!(topic = %handle.topic_id, %err, "failed to decode push notification");
                                    continue;
                                }
                            },
                            None => continue,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }

                stats.lock().poll_count += 1;
                let wall_now = now_millis();
                let metas = match subscriber.poll_updates(&mut handle, wall_now).await {
                    Ok(PollOutcome::UpToDate) => continue,
                    Ok(PollOutcome::Delta(metas)) | Ok(PollOutcome::GapRecovered(metas)) => metas,
                    Err(err) => {
                        warn!(topic = %handle.topic_id, %err, "poll_updates failed");
                        continue;
                    }
                };

                let ids: Vec<Id160> = metas.iter().map(|m| m.message_id).collect();
                let messages = match adapter.load_messages(&ids).await {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(topic = %handle.topic_id, %err, "failed to resolve polled message metadata");
                        continue;
                    }
                };

                let now = Instant::now();
                for message in messages {
                    if message.expires_at <= wall_now {
                        continue;
                    }
                    let fresh = dedup.lock().check_and_insert(message.message_id, now);
                    if !fresh {
                        stats.lock().messages_deduped += 1;
                        continue;
                    }
                    if tx.send(message).await.is_ok() {
                        stats.lock().messages_delivered += 1;
                    } else {
                        debug!(topic = %handle.topic_id, "subscriber channel closed, stopping poll task");
                        return;
                    }
                }
            }
        })
    }

    async fn deliver(&self, tx: &mpsc::Sender<Message>, metas: &[MessageMeta], now: i64) {
        let ids: Vec<Id160> = metas.iter().map(|m| m.message_id).collect();
        let messages = match self.adapter.load_messages(&ids).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(%err, "failed to resolve backfill message metadata");
                return;
            }
        };
        let instant_now = Instant::now();
        for message in messages {
            if message.expires_at <= now {
                continue;
            }
            let fresh = self.dedup.lock().check_and_insert(message.message_id, instant_now);
            if !fresh {
                self.stats.lock().messages_deduped += 1;
                continue;
            }
            if tx.send(message).await.is_ok() {
                self.stats.lock().messages_delivered += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::InMemorySequenceTracker;
    use stickypub_dht::{MemoryNetwork, NodeInfo};

    fn client(network: &MemoryNetwork, seed: &[u8]) -> PubSubClient {
        let node = NodeInfo::new(Id160::new(seed), format!("memory://{}", Id160::new(seed).to_hex()));
        let mut config = ClientConfig::default();
        config.poll_interval = Duration::from_millis(20);
        let adapter = StoreAdapter::new(Arc::new(network.join(node)));
        PubSubClient::new(adapter, Arc::new(InMemorySequenceTracker::new()), config)
    }

    #[tokio::test]
    async fn publish_then_subscribe_backfills_existing_messages() {
        let network = MemoryNetwork::new();
        let publisher_client = client(&network, b"pub");
        let subscriber_client = client(&network, b"sub");
        let topic = Id160::new(b"topic");
        let pub_kp = KeyPair::generate();
        let sub_kp = KeyPair::generate();

        publisher_client
            .publish(topic, &pub_kp, b"hello".to_vec(), 0, 1_000_000)
            .await
            .unwrap();

        let mut rx = subscriber_client.subscribe(topic, &sub_kp, 0, 3_600_000).await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.data, b"hello");
    }

    #[tokio::test]
    async fn subscribe_twice_to_same_topic_errors() {
        let network = MemoryNetwork::new();
        let c = client(&network, b"c");
        let topic = Id160::new(b"topic");
        let kp = KeyPair::generate();

        let _rx = c.subscribe(topic, &kp, 0, 3_600_000).await.unwrap();
        let result = c.subscribe(topic, &kp, 0, 3_600_000).await;
        assert!(matches!(result, Err(ClientError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn delivered_messages_are_deduped_across_backfill_and_poll() {
        let network = MemoryNetwork::new();
        let publisher_client = client(&network, b"pub");
        let subscriber_client = client(&network, b"sub");
        let topic = Id160::new(b"topic");
        let pub_kp = KeyPair::generate();
        let sub_kp = KeyPair::generate();

        publisher_client
            .publish(topic, &pub_kp, b"hello".to_vec(), 0, 1_000_000)
            .await
            .unwrap();

        let mut rx = subscriber_client.subscribe(topic, &sub_kp, 0, 3_600_000).await.unwrap();
        let _ = rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = subscriber_client.get_stats();
        assert_eq!(stats.messages_delivered, 1);
    }
}
