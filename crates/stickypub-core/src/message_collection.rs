//! MessageCollection: immutable, content-addressed message-metadata set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::Id160;
use crate::message::MessageMeta;

/// Collections outlive their last-referenced message by this much, so a
/// trailing subscriber still sees the collection as "current" briefly after
/// its newest entry expires.
pub const GRACE_PERIOD_MS: i64 = 3_600_000;

/// An immutable set of message-metadata entries for one topic.
///
/// Every transformation (`add_message`, `merge`, `remove_expired`, ...)
/// returns a new `MessageCollection`; nothing here is ever mutated in place.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageCollection {
    collection_id: Id160,
    messages: Vec<MessageMeta>,
    created_at: i64,
    expires_at: i64,
}

fn compute_collection_id(message_ids: &[Id160], created_at: i64) -> Id160 {
    let mut hex_ids: Vec<String> = message_ids.iter().map(Id160::to_hex).collect();
    hex_ids.sort();
    let joined = hex_ids.join(":");

    let mut buf = Vec::with_capacity(b"msgcoll".len() + joined.len() + 8);
    buf.extend_from_slice(b"msgcoll");
    buf.extend_from_slice(joined.as_bytes());
    buf.extend_from_slice(&created_at.to_le_bytes());
    Id160::new(&buf)
}

fn compute_expires_at(messages: &[MessageMeta], created_at: i64) -> i64 {
    messages
        .iter()
        .map(|m| m.expires_at)
        .max()
        .map(|max_expiry| max_expiry + GRACE_PERIOD_MS)
        .unwrap_or(created_at + GRACE_PERIOD_MS)
}

impl MessageCollection {
    /// Build a collection from an ordered, already-deduplicated message list.
    fn from_parts(messages: Vec<MessageMeta>, created_at: i64) -> Self {
        let ids: Vec<Id160> = messages.iter().map(|m| m.message_id).collect();
        let collection_id = compute_collection_id(&ids, created_at);
        let expires_at = compute_expires_at(&messages, created_at);
        Self {
            collection_id,
            messages,
            created_at,
            expires_at,
        }
    }

    /// An empty collection created at `created_at`.
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

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[MessageMeta] {
        &self.messages
    }

    pub fn has_message(&self, id: Id160) -> bool {
        self.messages.iter().any(|m| m.message_id == id)
    }

    /// `addMessage(meta)`: returns a new collection with `meta` appended,
    /// unless its `messageID` is already present (unique-by-messageID, and
    /// re-adding the same message is a no-op).
    pub fn add_message(&self, meta: MessageMeta) -> Self {
        if self.has_message(meta.message_id) {
            return self.clone();
        }
        let mut messages = self.messages.clone();
        messages.push(meta);
        Self::from_parts(messages, self.created_at)
    }

    /// `addMessages(metas)`
    pub fn add_messages(&self, metas: &[MessageMeta]) -> Self {
        let mut messages = self.messages.clone();
        for meta in metas {
            if !messages.iter().any(|m| m.message_id == meta.message_id) {
                messages.push(*meta);
            }
        }
        Self::from_parts(messages, self.created_at)
    }

    /// `removeExpired(now)`
    pub fn remove_expired(&self, now: i64) -> Self {
        let messages: Vec<MessageMeta> = self
            .messages
            .iter()
            .copied()
            .filter(|m| m.expires_at > now)
            .collect();
        Self::from_parts(messages, self.created_at)
    }

    /// `merge(other)`: set union by messageID. `createdAt` of the result is
    /// the older of the two, consistent with CoordinatorObject's merge rule
    /// so repeated merges converge rather than perpetually producing "newer"
    /// collection IDs.
    pub fn merge(&self, other: &Self) -> Self {
        let mut messages = self.messages.clone();
        for meta in &other.messages {
            if !messages.iter().any(|m| m.message_id == meta.message_id) {
                messages.push(*meta);
            }
        }
        let created_at = self.created_at.min(other.created_at);
        Self::from_parts(messages, created_at)
    }

    /// `getMessagesSince(version)`: entries first referenced after `version`.
    pub fn get_messages_since(&self, version: u64) -> Vec<MessageMeta> {
        self.messages
            .iter()
            .copied()
            .filter(|m| m.added_in_version > version)
            .collect()
    }

    /// `getByPublisher(publisherID)`
    pub fn get_by_publisher(&self, publisher_id: Id160) -> Vec<MessageMeta> {
        self.messages
            .iter()
            .copied()
            .filter(|m| m.publisher_id == publisher_id)
            .collect()
    }

    /// `detectSequenceGaps()`: for each publisher with at least two entries,
    /// the sorted sequence numbers missing between their minimum and maximum
    /// observed `publisherSequence`.
    pub fn detect_sequence_gaps(&self) -> HashMap<Id160, Vec<u64>> {
        let mut by_publisher: HashMap<Id160, Vec<u64>> = HashMap::new();
        for m in &self.messages {
            by_publisher.entry(m.publisher_id).or_default().push(m.publisher_sequence);
        }

        let mut gaps = HashMap::new();
        for (publisher, mut seqs) in by_publisher {
            seqs.sort_unstable();
            let (min, max) = (seqs[0], *seqs.last().unwrap());
            let present: std::collections::HashSet<u64> = seqs.into_iter().collect();
            let missing: Vec<u64> = (min..=max).filter(|s| !present.contains(s)).collect();
            if !missing.is_empty() {
                gaps.insert(publisher, missing);
            }
        }
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(n: u8, seq: u64, added_in_version: u64, expires_at: i64) -> MessageMeta {
        MessageMeta {
            message_id: Id160::new(&[n]),
            publisher_id: Id160::new(b"pub"),
            publisher_sequence: seq,
            added_in_version,
            expires_at,
        }
    }

    #[test]
    fn empty_collection_expiry() {
        let c = MessageCollection::empty(1_000);
        assert_eq!(c.expires_at(), 1_000 + GRACE_PERIOD_MS);
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn add_message_is_idempotent_by_id() {
        let c = MessageCollection::empty(0);
        let m = meta(1, 1, 1, 10_000);
        let c2 = c.add_message(m);
        let c3 = c2.add_message(m);
        assert_eq!(c2.size(), 1);
        assert_eq!(c2.collection_id(), c3.collection_id());
    }

    #[test]
    fn different_created_at_changes_id_even_with_same_content() {
        let m = meta(1, 1, 1, 10_000);
        let a = MessageCollection::empty(0).add_message(m);
        let b = MessageCollection::empty(1).add_message(m);
        assert_ne!(a.collection_id(), b.collection_id());
    }

    #[test]
    fn get_messages_since_filters_by_added_in_version() {
        let c = MessageCollection::empty(0)
            .add_message(meta(1, 1, 1, 10_000))
            .add_message(meta(2, 2, 3, 10_000))
            .add_message(meta(3, 3, 5, 10_000));
        let since_2 = c.get_messages_since(2);
        let ids: Vec<u64> = since_2.iter().map(|m| m.publisher_sequence).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn merge_is_commutative_on_content() {
        let a = MessageCollection::empty(0).add_message(meta(1, 1, 1, 10_000));
        let b = MessageCollection::empty(0).add_message(meta(2, 2, 1, 10_000));
        let ab = a.merge(&b);
        let ba = b.merge(&a);
        let mut ab_ids: Vec<_> = ab.messages().iter().map(|m| m.message_id).collect();
        let mut ba_ids: Vec<_> = ba.messages().iter().map(|m| m.message_id).collect();
        ab_ids.sort();
        ba_ids.sort();
        assert_eq!(ab_ids, ba_ids);
    }

    #[test]
    fn merge_is_idempotent() {
        let a = MessageCollection::empty(0).add_message(meta(1, 1, 1, 10_000));
        let merged_once = a.merge(&a);
        assert_eq!(merged_once.size(), a.size());
    }

    #[test]
    fn remove_expired_filters_by_now() {
        let c = MessageCollection::empty(0)
            .add_message(meta(1, 1, 1, 500))
            .add_message(meta(2, 2, 1, 1_500));
        let filtered = c.remove_expired(1_000);
        assert_eq!(filtered.size(), 1);
        assert_eq!(filtered.messages()[0].publisher_sequence, 2);
    }

    #[test]
    fn detect_sequence_gaps_finds_missing_numbers() {
        let c = MessageCollection::empty(0)
            .add_message(meta(1, 1, 1, 10_000))
            .add_message(meta(2, 3, 1, 10_000))
            .add_message(meta(3, 5, 1, 10_000));
        let gaps = c.detect_sequence_gaps();
        let publisher = Id160::new(b"pub");
        assert_eq!(gaps.get(&publisher).unwrap(), &vec![2, 4]);
    }

    #[test]
    fn no_gaps_when_sequence_is_contiguous() {
        let c = MessageCollection::empty(0)
            .add_message(meta(1, 1, 1, 10_000))
            .add_message(meta(2, 2, 1, 10_000));
        assert!(c.detect_sequence_gaps().is_empty());
    }
}
