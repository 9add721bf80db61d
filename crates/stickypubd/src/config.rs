//! Configuration for stickypubd

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use stickypub_client::ClientConfig;

/// stickypubd - StickyPub publish/subscribe daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "stickypubd")]
#[command(about = "StickyPub DHT-backed publish/subscribe daemon")]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Data directory for the local identity file and (if `--storage sled`)
    /// the persistent DHT store and sequence tracker
    #[arg(long, env = "STICKYPUB_DATA_DIR", default_value = "./data/stickypubd", global = true)]
    pub data_dir: PathBuf,

    /// Storage backend for this node's view of the DHT
    #[arg(long, env = "STICKYPUB_STORAGE", value_enum, default_value_t = StorageBackend::Sled, global = true)]
    pub storage: StorageBackend,

    /// Default subscriber/subscription TTL in seconds, when a subcommand
    /// doesn't override it
    #[arg(long, default_value = "3600", global = true)]
    pub ttl_secs: i64,

    /// Number of coordinator slots subscribers are sharded across
    #[arg(long, env = "STICKYPUB_COORDINATOR_SLOTS", default_value = "20", global = true)]
    pub coordinator_slots: u32,

    /// Initial backoff for the coordinator CAS retry loop, in milliseconds
    #[arg(long, default_value = "100", global = true)]
    pub retry_initial_backoff_ms: u64,

    /// Backoff cap for the coordinator CAS retry loop, in milliseconds
    #[arg(long, default_value = "30000", global = true)]
    pub retry_max_backoff_ms: u64,

    /// Consecutive CAS conflicts before a retry loop gives up and marks the
    /// coordinator FAILED
    #[arg(long, default_value = "10", global = true)]
    pub catastrophic_threshold: u32,

    /// Poll interval for subscribed topics, in milliseconds
    #[arg(long, default_value = "5000", global = true)]
    pub poll_interval_ms: u64,

    /// Dedup cache window, in seconds
    #[arg(long, default_value = "60", global = true)]
    pub dedup_window_secs: u64,

    /// Dedup cache capacity (entries)
    #[arg(long, default_value = "1000", global = true)]
    pub dedup_capacity: usize,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Publish one message to a topic and exit
    Publish {
        /// Topic identifier, as hex or an arbitrary phrase (hashed to an Id160)
        #[arg(long)]
        topic: String,
        /// Message payload. Use `--data-file` instead for binary payloads
        #[arg(long)]
        data: String,
        /// Message TTL in seconds from now
        #[arg(long, default_value = "3600")]
        expires_in_secs: i64,
    },
    /// Subscribe to a topic, print backfill and new messages, run until Ctrl-C
    Subscribe {
        #[arg(long)]
        topic: String,
    },
    /// Long-running node: subscribe to one or more topics and keep serving
    /// until Ctrl-C, reporting periodic stats
    Serve {
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process, non-persistent. Loses all state (and its identity) on
    /// restart -- only useful for one-shot local experiments.
    Memory,
    /// `sled`-backed, persisted under `data_dir`.
    Sled,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.coordinator_slots == 0 {
            anyhow::bail!("coordinator-slots must be at least 1");
        }
        if self.retry_initial_backoff_ms == 0 {
            anyhow::bail!("retry-initial-backoff-ms must be at least 1");
        }
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            anyhow::bail!("retry-max-backoff-ms must be >= retry-initial-backoff-ms");
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.coordinator_slots = self.coordinator_slots;
        config.retry_initial_backoff = Duration::from_millis(self.retry_initial_backoff_ms);
        config.retry_max_backoff = Duration::from_millis(self.retry_max_backoff_ms);
        config.catastrophic_threshold = self.catastrophic_threshold;
        config.poll_interval = Duration::from_millis(self.poll_interval_ms);
        config.dedup_window = Duration::from_secs(self.dedup_window_secs);
        config.dedup_capacity = self.dedup_capacity;
        config
    }
}
