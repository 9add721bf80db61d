//! Client-tunable parameters.

use std::time::Duration;

/// Configuration shared by the publish, subscribe, and facade layers.
///
/// Mirrors the shape of `stickypubd`'s own `Config` (sync interval, batch
/// sizes, ...), scoped to what a single client needs rather than a whole
/// node.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// `k`: number of coordinator-slot partitions.
    pub coordinator_slots: u32,

    /// Initial delay before the first publish retry.
    pub retry_initial_backoff: Duration,

    /// Ceiling the exponential retry backoff never exceeds.
    pub retry_max_backoff: Duration,

    /// Number of consecutive CAS conflicts before a publish or subscribe
    /// operation gives up and reports `ClientError::Catastrophic`.
    pub catastrophic_threshold: u32,

    /// Maximum messages accumulated before a pending batch is flushed.
    /// `None` disables batching.
    pub batch_size: Option<usize>,

    /// Maximum time a message waits in a pending batch before it is
    /// flushed regardless of `batch_size`.
    pub batch_interval: Duration,

    /// How often a subscription polls for coordinator updates when no push
    /// notification has arrived.
    pub poll_interval: Duration,

    /// Window within which a duplicate `messageID` delivered to the same
    /// subscription is suppressed rather than re-emitted.
    pub dedup_window: Duration,

    /// Maximum number of message IDs tracked by the dedup cache; the
    /// oldest entries are evicted first once this is exceeded (bounds
    /// memory regardless of `dedup_window` under high publish volume).
    pub dedup_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_slots: 20,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(30),
            catastrophic_threshold: 10,
            batch_size: None,
            batch_interval: Duration::from_millis(100),
            poll_interval: Duration::from_secs(5),
            dedup_window: Duration::from_secs(60),
            dedup_capacity: 1000,
        }
    }
}
