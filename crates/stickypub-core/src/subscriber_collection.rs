//! SubscriberCollection: immutable, content-addressed subscriber set.

use serde::{Deserialize, Serialize};

use crate::id::{verify, Id160, KeyPair, PublicKey, Signature64};
use crate::message_collection::GRACE_PERIOD_MS;

/// Default number of coordinator-slot partitions (`k`).
pub const DEFAULT_K: u32 = 20;

/// One subscriber's signed record inside a `SubscriberCollection`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriberMeta {
    pub subscriber_id: Id160,
    pub coordinator_slot: u32,
    pub subscribed_at: i64,
    pub expires_at: i64,
    pub signature: Signature64,
}

/// The fields a subscriber signs to authenticate its own subscription
/// record.
#[derive(Serialize)]
struct Signable<'a> {
    subscriber_id: &'a Id160,
    coordinator_slot: u32,
    subscribed_at: i64,
    expires_at: i64,
}

impl SubscriberMeta {
    /// Build and sign a subscription record for `keypair`'s own identity.
    pub fn new_signed(
        keypair: &KeyPair,
        coordinator_slot: u32,
        subscribed_at: i64,
        expires_at: i64,
    ) -> crate::error::Result<Self> {
        let subscriber_id = keypair.public_key().id();
        let signable = Signable {
            subscriber_id: &subscriber_id,
            coordinator_slot,
            subscribed_at,
            expires_at,
        };
        let bytes = crate::canonical::canonical_bytes(&signable)?;
        Ok(Self {
            subscriber_id,
            coordinator_slot,
            subscribed_at,
            expires_at,
            signature: keypair.sign(&bytes),
        })
    }

    fn signable_bytes(&self) -> crate::error::Result<Vec<u8>> {
        crate::canonical::canonical_bytes(&Signable {
            subscriber_id: &self.subscriber_id,
            coordinator_slot: self.coordinator_slot,
            subscribed_at: self.subscribed_at,
            expires_at: self.expires_at,
        })
    }

    pub fn verify(&self, public_key: &PublicKey) -> bool {
        match self.signable_bytes() {
            Ok(bytes) => verify(public_key, &bytes, &self.signature),
            Err(_) => false,
        }
    }
}

/// `coordinatorSlot = uint32(firstFourBytes(hash(topicID ∥ subscriberID))) mod k`
///
/// Deterministic across all participants: every peer partitions the same
/// subscriber into the same slot without coordination.
pub fn coordinator_slot(topic_id: &Id160, subscriber_id: &Id160, k: u32) -> u32 {
    let mut buf = Vec::with_capacity(Id160::new(b"").as_bytes().len() * 2);
    buf.extend_from_slice(topic_id.as_bytes());
    buf.extend_from_slice(subscriber_id.as_bytes());
    let digest = blake3::hash(&buf);
    let first_four: [u8; 4] = digest.as_bytes()[..4].try_into().unwrap();
    u32::from_be_bytes(first_four) % k
}

/// `assign(subscriberID, topicID, initiators) = initiators[uint32(firstFourBytes(hash(subscriberID
/// ∥ topicID))) mod |initiators|]`
///
/// Partitions push-delivery responsibility for a topic's subscribers across
/// the `initiator_count` nodes closest to the topic, the same way
/// `coordinator_slot` partitions subscribers across storage slots. Returns
/// the index into the initiator list the caller should compare its own
/// position against.
pub fn assign_initiator_index(subscriber_id: &Id160, topic_id: &Id160, initiator_count: usize) -> usize {
    let mut buf = Vec::with_capacity(Id160::new(b"").as_bytes().len() * 2);
    buf.extend_from_slice(subscriber_id.as_bytes());
    buf.extend_from_slice(topic_id.as_bytes());
    let digest = blake3::hash(&buf);
    let first_four: [u8; 4] = digest.as_bytes()[..4].try_into().unwrap();
    (u32::from_be_bytes(first_four) as usize) % initiator_count
}

fn compute_collection_id(subscriber_ids: &[Id160], created_at: i64) -> Id160 {
    let mut hex_ids: Vec<String> = subscriber_ids.iter().map(Id160::to_hex).collect();
    hex_ids.sort();
    let joined = hex_ids.join(":");

    let mut buf = Vec::with_capacity(b"subcoll".len() + joined.len() + 8);
    buf.extend_from_slice(b"subcoll");
    buf.extend_from_slice(joined.as_bytes());
    buf.extend_from_slice(&created_at.to_le_bytes());
    Id160::new(&buf)
}

fn compute_expires_at(subscribers: &[SubscriberMeta], created_at: i64) -> i64 {
    subscribers
        .iter()
        .map(|s| s.expires_at)
        .max()
        .map(|max_expiry| max_expiry + GRACE_PERIOD_MS)
        .unwrap_or(created_at + GRACE_PERIOD_MS)
}

/// An immutable set of subscriber records for one topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriberCollection {
    collection_id: Id160,
    subscribers: Vec<SubscriberMeta>,
    created_at: i64,
    expires_at: i64,
}

impl SubscriberCollection {
    fn from_parts(subscribers: Vec<SubscriberMeta>, created_at: i64) -> Self {
        let ids: Vec<Id160> = subscribers.iter().map(|s| s.subscriber_id).collect();
        let collection_id = compute_collection_id(&ids, created_at);
        let expires_at = compute_expires_at(&subscribers, created_at);
        Self {
            collection_id,
            subscribers,
            created_at,
            expires_at,
        }
    }

    pub fn empty(created_at: i64) -> Self {
        Self::from_parts(Vec::new(), created_at)
    }

    pub fn collection_id(&self) -> Id160 {
        self.collection_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn size(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers(&self) -> &[SubscriberMeta] {
        &self.subscribers
    }

    pub fn has_subscriber(&self, id: Id160) -> bool {
        self.subscribers.iter().any(|s| s.subscriber_id == id)
    }

    pub fn get_subscriber(&self, id: Id160) -> Option<&SubscriberMeta> {
        self.subscribers.iter().find(|s| s.subscriber_id == id)
    }

    pub fn get_by_coordinator_slot(&self, slot: u32) -> Vec<&SubscriberMeta> {
        self.subscribers
            .iter()
            .filter(|s| s.coordinator_slot == slot)
            .collect()
    }

    /// `addSubscriber(meta)`: replaces any existing entry for the same
    /// subscriber (a re-subscribe), otherwise appends.
    pub fn add_subscriber(&self, meta: SubscriberMeta) -> Self {
        let mut subscribers: Vec<SubscriberMeta> = self
            .subscribers
            .iter()
            .filter(|s| s.subscriber_id != meta.subscriber_id)
            .cloned()
            .collect();
        subscribers.push(meta);
        Self::from_parts(subscribers, self.created_at)
    }

    /// `removeSubscriber(id)`
    pub fn remove_subscriber(&self, id: Id160) -> Self {
        let subscribers: Vec<SubscriberMeta> = self
            .subscribers
            .iter()
            .filter(|s| s.subscriber_id != id)
            .cloned()
            .collect();
        Self::from_parts(subscribers, self.created_at)
    }

    /// `removeExpired(now)`
    pub fn remove_expired(&self, now: i64) -> Self {
        let subscribers: Vec<SubscriberMeta> = self
            .subscribers
            .iter()
            .filter(|s| s.expires_at > now)
            .cloned()
            .collect();
        Self::from_parts(subscribers, self.created_at)
    }

    /// `merge(other)`: set union by subscriberID, keeping the entry with the
    /// greater `subscribedAt` on duplicates.
    pub fn merge(&self, other: &Self) -> Self {
        let mut by_id: std::collections::HashMap<Id160, SubscriberMeta> =
            self.subscribers.iter().map(|s| (s.subscriber_id, s.clone())).collect();

        for s in &other.subscribers {
            match by_id.get(&s.subscriber_id) {
                Some(existing) if existing.subscribed_at >= s.subscribed_at => {}
                _ => {
                    by_id.insert(s.subscriber_id, s.clone());
                }
            }
        }

        let mut subscribers: Vec<SubscriberMeta> = by_id.into_values().collect();
        subscribers.sort_by_key(|s| s.subscriber_id);
        let created_at = self.created_at.min(other.created_at);
        Self::from_parts(subscribers, created_at)
    }

    /// `renew(id, newExpiresAt, newSignature)`
    pub fn renew(&self, id: Id160, new_expires_at: i64, new_signature: Signature64) -> Self {
        let subscribers: Vec<SubscriberMeta> = self
            .subscribers
            .iter()
            .map(|s| {
                if s.subscriber_id == id {
                    SubscriberMeta {
                        expires_at: new_expires_at,
                        signature: new_signature.clone(),
                        ..s.clone()
                    }
                } else {
                    s.clone()
                }
            })
            .collect();
        Self::from_parts(subscribers, self.created_at)
    }

    /// `verifyAll(publicKeyLookup)`: every entry's signature must verify
    /// against the key its lookup function returns; subscribers whose key
    /// cannot be resolved count as unverified.
    pub fn verify_all(&self, public_key_lookup: impl Fn(Id160) -> Option<PublicKey>) -> bool {
        self.subscribers.iter().all(|s| {
            public_key_lookup(s.subscriber_id)
                .map(|pk| s.verify(&pk))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::KeyPair;

    fn signed_meta(kp: &KeyPair, slot: u32, subscribed_at: i64, expires_at: i64) -> SubscriberMeta {
        let subscriber_id = kp.public_key().id();
        let signable = Signable {
            subscriber_id: &subscriber_id,
            coordinator_slot: slot,
            subscribed_at,
            expires_at,
        };
        let bytes = crate::canonical::canonical_bytes(&signable).unwrap();
        SubscriberMeta {
            subscriber_id,
            coordinator_slot: slot,
            subscribed_at,
            expires_at,
            signature: kp.sign(&bytes),
        }
    }

    #[test]
    fn coordinator_slot_is_deterministic_and_bounded() {
        let topic = Id160::new(b"topic");
        let sub = Id160::new(b"sub");
        let slot_a = coordinator_slot(&topic, &sub, DEFAULT_K);
        let slot_b = coordinator_slot(&topic, &sub, DEFAULT_K);
        assert_eq!(slot_a, slot_b);
        assert!(slot_a < DEFAULT_K);
    }

    #[test]
    fn add_and_lookup_subscriber() {
        let kp = KeyPair::generate();
        let meta = signed_meta(&kp, 3, 0, 10_000);
        let c = SubscriberCollection::empty(0).add_subscriber(meta.clone());
        assert!(c.has_subscriber(meta.subscriber_id));
        assert_eq!(c.get_by_coordinator_slot(3).len(), 1);
    }

    #[test]
    fn merge_keeps_greater_subscribed_at_on_duplicate() {
        let kp = KeyPair::generate();
        let older = signed_meta(&kp, 1, 100, 10_000);
        let newer = signed_meta(&kp, 1, 200, 20_000);

        let a = SubscriberCollection::empty(0).add_subscriber(older);
        let b = SubscriberCollection::empty(0).add_subscriber(newer.clone());

        let merged = a.merge(&b);
        assert_eq!(merged.size(), 1);
        assert_eq!(merged.get_subscriber(kp.public_key().id()).unwrap().subscribed_at, 200);
        assert_eq!(merged.get_subscriber(kp.public_key().id()).unwrap().expires_at, 20_000);

        // Commutative
        let merged_rev = b.merge(&a);
        assert_eq!(merged_rev.get_subscriber(kp.public_key().id()).unwrap().subscribed_at, 200);
    }

    #[test]
    fn renew_updates_expiry_and_signature() {
        let kp = KeyPair::generate();
        let meta = signed_meta(&kp, 0, 0, 1_000);
        let id = meta.subscriber_id;
        let c = SubscriberCollection::empty(0).add_subscriber(meta);

        let renewed_signable = Signable {
            subscriber_id: &id,
            coordinator_slot: 0,
            subscribed_at: 0,
            expires_at: 5_000,
        };
        let bytes = crate::canonical::canonical_bytes(&renewed_signable).unwrap();
        let new_sig = kp.sign(&bytes);

        let c2 = c.renew(id, 5_000, new_sig);
        assert_eq!(c2.get_subscriber(id).unwrap().expires_at, 5_000);
    }

    #[test]
    fn verify_all_rejects_tampered_entry() {
        let kp = KeyPair::generate();
        let mut meta = signed_meta(&kp, 0, 0, 1_000);
        let c_ok = SubscriberCollection::empty(0).add_subscriber(meta.clone());
        assert!(c_ok.verify_all(|_| Some(kp.public_key())));

        meta.coordinator_slot = 7; // tamper after signing
        let c_bad = SubscriberCollection::empty(0).add_subscriber(meta);
        assert!(!c_bad.verify_all(|_| Some(kp.public_key())));
    }

    #[test]
    fn remove_subscriber_and_remove_expired() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let m1 = signed_meta(&kp1, 0, 0, 500);
        let m2 = signed_meta(&kp2, 0, 0, 5_000);
        let c = SubscriberCollection::empty(0)
            .add_subscriber(m1.clone())
            .add_subscriber(m2.clone());

        let filtered = c.remove_expired(1_000);
        assert_eq!(filtered.size(), 1);
        assert!(filtered.has_subscriber(m2.subscriber_id));

        let removed = c.remove_subscriber(m1.subscriber_id);
        assert_eq!(removed.size(), 1);
    }
}
