//! Publisher sequence-number tracking.
//!
//! A publisher's next sequence number per topic is durable local state,
//! tracked one counter per key, `sled`-backed for real deployments. A
//! publisher that loses this state and starts back at `0` would mint
//! `messageID`s colliding with (and silently shadowing) ones it already
//! published -- so the tracker is required, not optional, wherever a
//! publisher's identity outlives a single process.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use stickypub_core::Id160;

use crate::error::Result;

/// Assigns each topic a publisher's next `publisherSequence`, durably.
pub trait SequenceTracker: Send + Sync {
    /// Returns the next unused sequence number for `topic_id` and records
    /// that it has now been used.
    fn next(&self, topic_id: Id160) -> Result<u64>;
}

/// Process-lifetime-only tracker, for tests and ephemeral publishers.
#[derive(Default)]
pub struct InMemorySequenceTracker {
    counters: Mutex<std::collections::HashMap<Id160, AtomicU64>>,
}

impl InMemorySequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceTracker for InMemorySequenceTracker {
    fn next(&self, topic_id: Id160) -> Result<u64> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(topic_id).or_insert_with(|| AtomicU64::new(1));
        Ok(counter.fetch_add(1, Ordering::SeqCst))
    }
}

/// `sled`-backed tracker: one counter per topic, surviving process restarts.
pub struct SledSequenceTracker {
    tree: sled::Tree,
}

impl SledSequenceTracker {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(stickypub_dht::DhtError::from)?;
        let tree = db
            .open_tree("publisher_sequences")
            .map_err(stickypub_dht::DhtError::from)?;
        Ok(Self { tree })
    }
}

impl SequenceTracker for SledSequenceTracker {
    fn next(&self, topic_id: Id160) -> Result<u64> {
        let key = topic_id.as_bytes();
        let mut assigned = 1u64;
        self.tree
            .fetch_and_update(key, |old| {
                let current = old
                    .map(|bytes| u64::from_le_bytes(bytes.try_into().unwrap_or([0; 8])))
                    .unwrap_or(1);
                assigned = current;
                Some(current.wrapping_add(1).to_le_bytes().to_vec())
            })
            .map_err(stickypub_dht::DhtError::from)?;
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_assigns_increasing_sequences() {
        let tracker = InMemorySequenceTracker::new();
        let topic = Id160::new(b"t");
        assert_eq!(tracker.next(topic).unwrap(), 1);
        assert_eq!(tracker.next(topic).unwrap(), 2);
        assert_eq!(tracker.next(topic).unwrap(), 3);
    }

    #[test]
    fn in_memory_tracks_topics_independently() {
        let tracker = InMemorySequenceTracker::new();
        let a = Id160::new(b"a");
        let b = Id160::new(b"b");
        assert_eq!(tracker.next(a).unwrap(), 1);
        assert_eq!(tracker.next(b).unwrap(), 1);
        assert_eq!(tracker.next(a).unwrap(), 2);
    }

    #[test]
    fn sled_tracker_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let topic = Id160::new(b"t");
        {
            let tracker = SledSequenceTracker::open(dir.path()).unwrap();
            assert_eq!(tracker.next(topic).unwrap(), 1);
            assert_eq!(tracker.next(topic).unwrap(), 2);
        }
        let tracker = SledSequenceTracker::open(dir.path()).unwrap();
        assert_eq!(tracker.next(topic).unwrap(), 3);
    }
}
