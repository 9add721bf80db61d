//! Typed store/load operations over a [`DhtClient`], keyed by the
//! `coordinator:`/`msgcoll:`/`subcoll:`/`msg:`/`snapshot:` schema. Everything
//! above this layer (publish, subscribe) talks to the DHT only through
//! `StoreAdapter`; nothing else touches raw keys.

use std::sync::Arc;

use stickypub_core::{
    CoordinatorObject, CoordinatorSnapshot, Id160, Message, MessageCollection,
    SubscriberCollection,
};
use tracing::debug;

use crate::client::{DhtClient, NodeInfo};
use crate::error::{DhtError, Result};

/// Maximum number of hops `load_snapshot_chain` will walk before concluding
/// the chain is cyclic or pathologically long.
pub const MAX_SNAPSHOT_CHAIN_DEPTH: usize = 10;

fn coordinator_key(topic_id: Id160) -> String {
    format!("coordinator:{}", topic_id.to_hex())
}

fn message_key(message_id: Id160) -> String {
    format!("msg:{}", message_id.to_hex())
}

fn message_collection_key(collection_id: Id160) -> String {
    format!("msgcoll:{}", collection_id.to_hex())
}

fn subscriber_collection_key(collection_id: Id160) -> String {
    format!("subcoll:{}", collection_id.to_hex())
}

fn snapshot_key(snapshot_id: Id160) -> String {
    format!("snapshot:{}", snapshot_id.to_hex())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Wraps a [`DhtClient`] with stickypub's typed key schema and the
/// coordinator-specific read/write paths the publish and subscribe
/// operations need.
#[derive(Clone)]
pub struct StoreAdapter {
    dht: Arc<dyn DhtClient>,
}

impl StoreAdapter {
    pub fn new(dht: Arc<dyn DhtClient>) -> Self {
        Self { dht }
    }

    pub fn dht(&self) -> &Arc<dyn DhtClient> {
        &self.dht
    }

    // -- Coordinator -----------------------------------------------------

    /// First write of a brand-new topic's coordinator. Not CAS-protected:
    /// callers must already know the key is absent (the publish algorithm
    /// only takes this path after a failed `load_coordinator`).
    pub async fn store_coordinator(&self, obj: &CoordinatorObject) -> Result<()> {
        self.dht
            .store(&coordinator_key(obj.topic_id()), encode(obj)?)
            .await
    }

    /// `loadCoordinator(topicID)`: always a fresh network fetch. Reading a
    /// coordinator from a local cache would silently reintroduce updates
    /// another writer already superseded.
    pub async fn load_coordinator(&self, topic_id: Id160) -> Result<Option<CoordinatorObject>> {
        match self.dht.get_from_network(&coordinator_key(topic_id)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// `loadCoordinatorResilient(topicID)`: refresh routing via `findNode`
    /// before retrying the fresh fetch, and fall back to a possibly-stale
    /// local `get` only if the network is unreachable, so a partition never
    /// turns into an unrecoverable failure for a read-only caller.
    pub async fn load_coordinator_resilient(
        &self,
        topic_id: Id160,
    ) -> Result<Option<CoordinatorObject>> {
        match self.load_coordinator(topic_id).await {
            Ok(found) => Ok(found),
            Err(err) => {
                debug!(%err, "fresh coordinator fetch failed, refreshing routing table");
                let _ = self.dht.find_node(topic_id).await;
                match self.dht.get(&coordinator_key(topic_id)).await? {
                    Some(bytes) => Ok(Some(decode(&bytes)?)),
                    None => Err(err),
                }
            }
        }
    }

    /// `storeCoordinatorWithVersionCheck(new, expectedVersion)`: a CAS
    /// write against the coordinator's previously observed encoding.
    /// Returns `false` on conflict rather than erroring, so callers can
    /// merge and retry per the publish/subscribe algorithms.
    pub async fn store_coordinator_with_version_check(
        &self,
        expected: Option<&CoordinatorObject>,
        new: &CoordinatorObject,
    ) -> Result<bool> {
        let expected_bytes = expected.map(encode).transpose()?;
        self.dht
            .compare_and_swap(&coordinator_key(new.topic_id()), expected_bytes, encode(new)?)
            .await
    }

    // -- Message -----------------------------------------------------------

    pub async fn store_message(&self, message: &Message) -> Result<()> {
        self.dht
            .store(&message_key(message.message_id), encode(message)?)
            .await
    }

    pub async fn load_message(&self, message_id: Id160) -> Result<Option<Message>> {
        match self.dht.get(&message_key(message_id)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn load_messages(&self, message_ids: &[Id160]) -> Result<Vec<Message>> {
        let mut out = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            if let Some(m) = self.load_message(*id).await? {
                out.push(m);
            }
        }
        Ok(out)
    }

    // -- MessageCollection ---------------------------------------------------

    pub async fn store_message_collection(&self, collection: &MessageCollection) -> Result<()> {
        self.dht
            .store(&message_collection_key(collection.collection_id()), encode(collection)?)
            .await
    }

    pub async fn load_message_collection(
        &self,
        collection_id: Id160,
    ) -> Result<Option<MessageCollection>> {
        match self.dht.get(&message_collection_key(collection_id)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- SubscriberCollection ------------------------------------------------

    pub async fn store_subscriber_collection(
        &self,
        collection: &SubscriberCollection,
    ) -> Result<()> {
        self.dht
            .store(
                &subscriber_collection_key(collection.collection_id()),
                encode(collection)?,
            )
            .await
    }

    pub async fn load_subscriber_collection(
        &self,
        collection_id: Id160,
    ) -> Result<Option<SubscriberCollection>> {
        match self.dht.get(&subscriber_collection_key(collection_id)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- CoordinatorSnapshot -------------------------------------------------

    pub async fn store_snapshot(&self, snapshot: &CoordinatorSnapshot) -> Result<()> {
        self.dht
            .store(&snapshot_key(snapshot.snapshot_id()), encode(snapshot)?)
            .await
    }

    pub async fn load_snapshot(&self, snapshot_id: Id160) -> Result<Option<CoordinatorSnapshot>> {
        match self.dht.get(&snapshot_key(snapshot_id)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Walk `previousCoordinator` links starting at `start_id`, stopping at
    /// the first missing snapshot or after [`MAX_SNAPSHOT_CHAIN_DEPTH`]
    /// hops -- a cycle (which should never occur, but a malicious or buggy
    /// peer could write one) must not hang the caller.
    pub async fn load_snapshot_chain(
        &self,
        start_id: Id160,
    ) -> Result<Vec<CoordinatorSnapshot>> {
        let mut chain = Vec::new();
        let mut current = Some(start_id);
        let mut seen = std::collections::HashSet::new();

        while let Some(id) = current {
            if chain.len() >= MAX_SNAPSHOT_CHAIN_DEPTH {
                return Err(DhtError::ChainTooDeep(MAX_SNAPSHOT_CHAIN_DEPTH));
            }
            if !seen.insert(id) {
                return Err(DhtError::ChainTooDeep(MAX_SNAPSHOT_CHAIN_DEPTH));
            }
            let Some(snapshot) = self.load_snapshot(id).await? else {
                break;
            };
            current = snapshot.previous_coordinator();
            chain.push(snapshot);
        }
        Ok(chain)
    }

    pub async fn find_node(&self, id: Id160) -> Result<Vec<NodeInfo>> {
        self.dht.find_node(id).await
    }

    pub async fn send_message(&self, to: &NodeInfo, payload: Vec<u8>) -> Result<()> {
        self.dht.send_message(to, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDht;
    use stickypub_core::Id160;

    fn adapter() -> StoreAdapter {
        let node = NodeInfo::new(Id160::new(b"n1"), "memory://n1".into());
        StoreAdapter::new(Arc::new(MemoryDht::standalone(node)))
    }

    #[tokio::test]
    async fn coordinator_round_trip_and_cas() {
        let adapter = adapter();
        let topic = Id160::new(b"topic");
        let obj = CoordinatorObject::new(topic, 0);
        adapter.store_coordinator(&obj).await.unwrap();

        let loaded = adapter.load_coordinator(topic).await.unwrap().unwrap();
        assert_eq!(loaded.version(), 0);

        let bumped = obj.update_subscribers(Id160::new(b"coll"), 10);
        let ok = adapter
            .store_coordinator_with_version_check(Some(&obj), &bumped)
            .await
            .unwrap();
        assert!(ok);

        // Stale `expected` now loses the race.
        let conflict = adapter
            .store_coordinator_with_version_check(Some(&obj), &bumped)
            .await
            .unwrap();
        assert!(!conflict);
    }

    #[tokio::test]
    async fn message_round_trip() {
        let adapter = adapter();
        let kp = stickypub_core::KeyPair::generate();
        let mut msg = Message::new(
            Id160::new(b"t"),
            kp.public_key().id(),
            1,
            b"hi".to_vec(),
            0,
            1_000,
        )
        .unwrap();
        msg.sign(&kp).unwrap();
        let id = msg.message_id;
        adapter.store_message(&msg).await.unwrap();
        let loaded = adapter.load_message(id).await.unwrap().unwrap();
        assert_eq!(loaded.message_id, id);
    }

    #[tokio::test]
    async fn snapshot_chain_stops_at_missing_link() {
        let adapter = adapter();
        let topic = Id160::new(b"topic");
        let tail = CoordinatorSnapshot::new(topic, 0, vec![], vec![], None, 0);
        let head = CoordinatorSnapshot::new(topic, 1, vec![], vec![], Some(tail.snapshot_id()), 10);
        adapter.store_snapshot(&head).await.unwrap();
        // tail intentionally not stored

        let chain = adapter.load_snapshot_chain(head.snapshot_id()).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].snapshot_id(), head.snapshot_id());
    }

    #[tokio::test]
    async fn snapshot_chain_detects_cycles() {
        let adapter = adapter();
        let topic = Id160::new(b"topic");
        // `snapshot_id` is derived from (topic, version, created_at) only,
        // not `previous_coordinator` -- so two snapshots sharing those three
        // fields share an id even as their `previous_coordinator` differs.
        // That lets a buggy or malicious writer overwrite `a` with a version
        // pointing forward to `b`, forming a cycle a -> b -> a.
        let a = CoordinatorSnapshot::new(topic, 0, vec![], vec![], None, 0);
        let b = CoordinatorSnapshot::new(topic, 1, vec![], vec![], Some(a.snapshot_id()), 1);
        adapter.store_snapshot(&b).await.unwrap();
        let a_cyclic = CoordinatorSnapshot::new(topic, 0, vec![], vec![], Some(b.snapshot_id()), 0);
        assert_eq!(a_cyclic.snapshot_id(), a.snapshot_id());
        adapter.store_snapshot(&a_cyclic).await.unwrap();

        let result = adapter.load_snapshot_chain(a_cyclic.snapshot_id()).await;
        assert!(matches!(result, Err(DhtError::ChainTooDeep(_))));
    }
}
