//! CoordinatorSnapshot and CoordinatorObject: per-topic mutable head and its
//! immutable history checkpoints.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Id160;

/// A snapshot outlives the coordinator version it was taken at by this much
/// before it is eligible for garbage collection by a DHT node.
pub const SNAPSHOT_GRACE_PERIOD_MS: i64 = 3_600_000;

/// `needsPruning` size threshold: serialized size in bytes.
pub const PRUNE_SIZE_THRESHOLD: usize = 1024;

/// `needsPruning` length threshold: entries in either history list.
pub const PRUNE_LENGTH_THRESHOLD: usize = 50;

/// How many of the most recent history entries survive a `prune`.
pub const PRUNE_KEEP: usize = 10;

/// An immutable checkpoint of a coordinator's history at some version,
/// chained to its predecessor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorSnapshot {
    snapshot_id: Id160,
    topic_id: Id160,
    version: u64,
    subscriber_history: Vec<Id160>,
    message_history: Vec<Id160>,
    previous_coordinator: Option<Id160>,
    created_at: i64,
    expires_at: i64,
}

fn compute_snapshot_id(topic_id: &Id160, version: u64, created_at: i64) -> Id160 {
    let mut buf = Vec::with_capacity(b"snapshot".len() + 20 + 8 + 8);
    buf.extend_from_slice(b"snapshot");
    buf.extend_from_slice(topic_id.as_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&created_at.to_le_bytes());
    Id160::new(&buf)
}

impl CoordinatorSnapshot {
    pub fn new(
        topic_id: Id160,
        version: u64,
        subscriber_history: Vec<Id160>,
        message_history: Vec<Id160>,
        previous_coordinator: Option<Id160>,
        created_at: i64,
    ) -> Self {
        let snapshot_id = compute_snapshot_id(&topic_id, version, created_at);
        Self {
            snapshot_id,
            topic_id,
            version,
            subscriber_history,
            message_history,
            previous_coordinator,
            created_at,
            expires_at: created_at + SNAPSHOT_GRACE_PERIOD_MS,
        }
    }

    pub fn snapshot_id(&self) -> Id160 {
        self.snapshot_id
    }

    pub fn topic_id(&self) -> Id160 {
        self.topic_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn subscriber_history(&self) -> &[Id160] {
        &self.subscriber_history
    }

    pub fn message_history(&self) -> &[Id160] {
        &self.message_history
    }

    pub fn previous_coordinator(&self) -> Option<Id160> {
        self.previous_coordinator
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
}

/// A topic coordinator's operating state. Ordered so `FAILED > RECOVERING >
/// ACTIVE` can be expressed with `Ord` during merges.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoordinatorState {
    Active,
    Recovering,
    Failed,
}

/// The mutable per-topic head object, written via compare-and-swap against
/// the DHT (`storeCoordinatorWithVersionCheck`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorObject {
    topic_id: Id160,
    coordinator_id: Id160,
    version: u64,
    current_subscribers: Option<Id160>,
    current_messages: Option<Id160>,
    subscriber_history: Vec<Id160>,
    message_history: Vec<Id160>,
    previous_coordinator: Option<Id160>,
    state: CoordinatorState,
    created_at: i64,
    last_modified: i64,
}

impl CoordinatorObject {
    /// `coordinatorID = hash(topicID)`
    pub fn coordinator_id_for(topic_id: &Id160) -> Id160 {
        Id160::new(topic_id.as_bytes())
    }

    /// A freshly created coordinator for a topic with no history yet.
    pub fn new(topic_id: Id160, created_at: i64) -> Self {
        Self {
            coordinator_id: Self::coordinator_id_for(&topic_id),
            topic_id,
            version: 0,
            current_subscribers: None,
            current_messages: None,
            subscriber_history: Vec::new(),
            message_history: Vec::new(),
            previous_coordinator: None,
            state: CoordinatorState::Active,
            created_at,
            last_modified: created_at,
        }
    }

    pub fn topic_id(&self) -> Id160 {
        self.topic_id
    }

    pub fn coordinator_id(&self) -> Id160 {
        self.coordinator_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current_subscribers(&self) -> Option<Id160> {
        self.current_subscribers
    }

    pub fn current_messages(&self) -> Option<Id160> {
        self.current_messages
    }

    pub fn subscriber_history(&self) -> &[Id160] {
        &self.subscriber_history
    }

    pub fn message_history(&self) -> &[Id160] {
        &self.message_history
    }

    pub fn previous_coordinator(&self) -> Option<Id160> {
        self.previous_coordinator
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// `updateSubscribers(newCollectionID, now)`: pushes the previous
    /// current collection into history, bumps the version.
    pub fn update_subscribers(&self, new_collection_id: Id160, now: i64) -> Self {
        let mut next = self.clone();
        if let Some(prev) = next.current_subscribers {
            next.subscriber_history.push(prev);
        }
        next.current_subscribers = Some(new_collection_id);
        next.version += 1;
        next.last_modified = now;
        next
    }

    /// `updateMessages(newCollectionID, now)`
    pub fn update_messages(&self, new_collection_id: Id160, now: i64) -> Self {
        let mut next = self.clone();
        if let Some(prev) = next.current_messages {
            next.message_history.push(prev);
        }
        next.current_messages = Some(new_collection_id);
        next.version += 1;
        next.last_modified = now;
        next
    }

    /// `updateBoth(newSubscriberCollectionID, newMessageCollectionID, now)`:
    /// a single version bump covering both slots, used when a publish or
    /// subscribe needs to move both atomically within one CAS round.
    pub fn update_both(
        &self,
        new_subscriber_collection_id: Id160,
        new_message_collection_id: Id160,
        now: i64,
    ) -> Self {
        let mut next = self.clone();
        if let Some(prev) = next.current_subscribers {
            next.subscriber_history.push(prev);
        }
        if let Some(prev) = next.current_messages {
            next.message_history.push(prev);
        }
        next.current_subscribers = Some(new_subscriber_collection_id);
        next.current_messages = Some(new_message_collection_id);
        next.version += 1;
        next.last_modified = now;
        next
    }

    /// `updateState(newState, now)`
    pub fn update_state(&self, new_state: CoordinatorState, now: i64) -> Self {
        let mut next = self.clone();
        next.state = new_state;
        next.last_modified = now;
        next
    }

    /// `needsPruning()`: serialized size over threshold, or either history
    /// list longer than the length threshold.
    pub fn needs_pruning(&self) -> bool {
        if self.subscriber_history.len() > PRUNE_LENGTH_THRESHOLD
            || self.message_history.len() > PRUNE_LENGTH_THRESHOLD
        {
            return true;
        }
        match crate::canonical::canonical_bytes(self) {
            Ok(bytes) => bytes.len() > PRUNE_SIZE_THRESHOLD,
            Err(_) => false,
        }
    }

    /// `prune(now)`: folds everything but the last [`PRUNE_KEEP`] history
    /// entries per list into a [`CoordinatorSnapshot`], linked via
    /// `previousCoordinator`, and returns the pruned object alongside it.
    pub fn prune(&self, now: i64) -> (Self, CoordinatorSnapshot) {
        let split = |history: &[Id160]| -> (Vec<Id160>, Vec<Id160>) {
            if history.len() <= PRUNE_KEEP {
                (Vec::new(), history.to_vec())
            } else {
                let split_at = history.len() - PRUNE_KEEP;
                (history[..split_at].to_vec(), history[split_at..].to_vec())
            }
        };
        let (archived_subscribers, kept_subscribers) = split(&self.subscriber_history);
        let (archived_messages, kept_messages) = split(&self.message_history);

        let snapshot = CoordinatorSnapshot::new(
            self.topic_id,
            self.version,
            archived_subscribers,
            archived_messages,
            self.previous_coordinator,
            now,
        );

        let mut next = self.clone();
        next.subscriber_history = kept_subscribers;
        next.message_history = kept_messages;
        next.previous_coordinator = Some(snapshot.snapshot_id());
        next.last_modified = now;

        (next, snapshot)
    }

    /// `merge(other, now)`: the commutative, idempotent conflict-resolution
    /// rule applied when a CAS write races another writer:
    ///
    /// - history lists: set union
    /// - `currentSubscribers'`/`currentMessages'`: taken from whichever side
    ///   has the higher version (ties favor `other`, the remote side); a
    ///   `None` side never overwrites a `Some` from the other
    /// - `previousCoordinator'`: taken from whichever side has the higher
    ///   version (ties favor `other`)
    /// - `state'`: the more severe of the two (`FAILED` > `RECOVERING` >
    ///   `ACTIVE`)
    /// - `version' = max(self.version, other.version) + 1`
    /// - `createdAt' = min(self.createdAt, other.createdAt)`
    /// - `lastModified' = now`
    pub fn merge(&self, other: &Self, now: i64) -> Self {
        let union = |a: &[Id160], b: &[Id160]| -> Vec<Id160> {
            let mut merged: Vec<Id160> = a.to_vec();
            for id in b {
                if !merged.contains(id) {
                    merged.push(*id);
                }
            }
            merged
        };

        let (newer, older) = if other.version >= self.version {
            (other, self)
        } else {
            (self, other)
        };

        let current_subscribers = newer.current_subscribers.or(older.current_subscribers);
        let current_messages = newer.current_messages.or(older.current_messages);

        Self {
            topic_id: self.topic_id,
            coordinator_id: self.coordinator_id,
            version: self.version.max(other.version) + 1,
            current_subscribers,
            current_messages,
            subscriber_history: union(&self.subscriber_history, &other.subscriber_history),
            message_history: union(&self.message_history, &other.message_history),
            previous_coordinator: newer.previous_coordinator,
            state: self.state.max(other.state),
            created_at: self.created_at.min(other.created_at),
            last_modified: now,
        }
    }

    /// `validate()`: structural invariants that must hold for any
    /// coordinator object regardless of how it was produced.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator_id != Self::coordinator_id_for(&self.topic_id) {
            return Err(Error::Validation(
                "coordinator_id does not match hash(topic_id)".into(),
            ));
        }
        if self.created_at > self.last_modified {
            return Err(Error::InvalidTimeRange(
                "created_at must be <= last_modified".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Id160 {
        Id160::new(b"topic")
    }

    #[test]
    fn coordinator_id_is_hash_of_topic() {
        let c = CoordinatorObject::new(topic(), 0);
        assert_eq!(c.coordinator_id(), Id160::new(topic().as_bytes()));
    }

    #[test]
    fn update_subscribers_bumps_version_and_history() {
        let c = CoordinatorObject::new(topic(), 0);
        let coll1 = Id160::new(b"coll1");
        let coll2 = Id160::new(b"coll2");
        let c1 = c.update_subscribers(coll1, 10);
        assert_eq!(c1.version(), 1);
        assert_eq!(c1.current_subscribers(), Some(coll1));
        assert!(c1.subscriber_history().is_empty());

        let c2 = c1.update_subscribers(coll2, 20);
        assert_eq!(c2.version(), 2);
        assert_eq!(c2.current_subscribers(), Some(coll2));
        assert_eq!(c2.subscriber_history(), &[coll1]);
    }

    #[test]
    fn merge_takes_max_version_plus_one_and_is_commutative_on_version() {
        let base = CoordinatorObject::new(topic(), 0);
        let a = base.update_subscribers(Id160::new(b"a"), 10);
        let b = base.update_messages(Id160::new(b"b"), 10);

        let merged_ab = a.merge(&b, 100);
        let merged_ba = b.merge(&a, 100);
        assert_eq!(merged_ab.version(), 2);
        assert_eq!(merged_ba.version(), 2);
        assert_eq!(merged_ab.last_modified(), 100);
    }

    #[test]
    fn merge_unions_histories_and_keeps_non_null_current() {
        let base = CoordinatorObject::new(topic(), 0);
        let a = base.update_subscribers(Id160::new(b"suba"), 10);
        let b = base.update_messages(Id160::new(b"msgb"), 10);

        let merged = a.merge(&b, 50);
        assert_eq!(merged.current_subscribers(), Some(Id160::new(b"suba")));
        assert_eq!(merged.current_messages(), Some(Id160::new(b"msgb")));
    }

    #[test]
    fn merge_state_prefers_more_severe() {
        let base = CoordinatorObject::new(topic(), 0);
        let active = base.clone();
        let failed = base.update_state(CoordinatorState::Failed, 5);

        let merged = active.merge(&failed, 10);
        assert_eq!(merged.state(), CoordinatorState::Failed);
        let merged_rev = failed.merge(&active, 10);
        assert_eq!(merged_rev.state(), CoordinatorState::Failed);
    }

    #[test]
    fn needs_pruning_on_long_history() {
        let mut c = CoordinatorObject::new(topic(), 0);
        for i in 0..(PRUNE_LENGTH_THRESHOLD as u8 + 1) {
            c = c.update_subscribers(Id160::new(&[i]), i as i64);
        }
        assert!(c.needs_pruning());
    }

    #[test]
    fn prune_keeps_last_n_and_links_snapshot() {
        let mut c = CoordinatorObject::new(topic(), 0);
        for i in 0..30u8 {
            c = c.update_subscribers(Id160::new(&[i]), i as i64);
        }
        let (pruned, snapshot) = c.prune(1_000);
        assert_eq!(pruned.subscriber_history().len(), PRUNE_KEEP);
        assert_eq!(pruned.previous_coordinator(), Some(snapshot.snapshot_id()));
        assert_eq!(snapshot.topic_id(), topic());
    }

    #[test]
    fn validate_rejects_mismatched_coordinator_id() {
        let mut c = CoordinatorObject::new(topic(), 0);
        c.coordinator_id = Id160::new(b"wrong");
        assert!(c.validate().is_err());
    }
}
