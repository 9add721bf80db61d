//! stickypubd - StickyPub publish/subscribe daemon

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use stickypub_client::{ClientError, InMemorySequenceTracker, PubSubClient, SequenceTracker, SledSequenceTracker};
use stickypub_core::{Id160, KeyPair};
use stickypub_dht::{DhtClient, MemoryDht, NodeInfo, StoreAdapter};
use stickypubd::config::{Command, Config, StorageBackend};
use stickypubd::identity;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::from_default_env().add_directive(
        if config.verbose { "stickypubd=debug" } else { "stickypubd=info" }
            .parse()
            .unwrap(),
    );
    if config.log_format == "json" {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    if let Err(err) = config.validate() {
        error!("invalid configuration: {}", err);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let keypair = identity::load_or_generate(&config.data_dir.join("identity.key"))?;
    let (adapter, sequencer) = build_adapter(&config)?;
    let client = PubSubClient::new(adapter, sequencer, config.client_config());

    match config.command.clone() {
        Command::Publish {
            topic,
            data,
            expires_in_secs,
        } => publish(&client, &keypair, &topic, data, expires_in_secs).await,
        Command::Subscribe { topic } => subscribe_and_print(&client, &keypair, &topic, config.ttl_secs).await,
        Command::Serve { topics } => serve(&client, &keypair, &topics, config.ttl_secs).await,
    }
}

fn build_adapter(config: &Config) -> anyhow::Result<(StoreAdapter, Arc<dyn SequenceTracker>)> {
    let node = NodeInfo::new(Id160::new(config.data_dir.to_string_lossy().as_bytes()), "local".to_string());
    match config.storage {
        StorageBackend::Memory => {
            info!("starting with in-memory storage (state does not survive a restart)");
            let dht: Arc<dyn DhtClient> = Arc::new(MemoryDht::standalone(node));
            let sequencer: Arc<dyn SequenceTracker> = Arc::new(InMemorySequenceTracker::new());
            Ok((StoreAdapter::new(dht), sequencer))
        }
        StorageBackend::Sled => {
            std::fs::create_dir_all(&config.data_dir)?;
            let dht_path = config.data_dir.join("dht");
            let seq_path = config.data_dir.join("sequences");
            info!(data_dir = %config.data_dir.display(), "starting with sled storage");
            let dht: Arc<dyn DhtClient> = Arc::new(stickypub_dht::SledDht::open(node, dht_path)?);
            let sequencer: Arc<dyn SequenceTracker> = Arc::new(SledSequenceTracker::open(seq_path)?);
            Ok((StoreAdapter::new(dht), sequencer))
        }
    }
}

/// Accepts a 40-character hex `Id160`, falling back to hashing an arbitrary
/// human-readable phrase so `--topic chat-room` works as well as a raw ID.
fn parse_topic(s: &str) -> Id160 {
    Id160::from_hex(s).unwrap_or_else(|_| Id160::new(s.as_bytes()))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

async fn publish(
    client: &PubSubClient,
    keypair: &KeyPair,
    topic: &str,
    data: String,
    expires_in_secs: i64,
) -> anyhow::Result<()> {
    let topic_id = parse_topic(topic);
    let now = now_millis();
    let message_id = client
        .publish(topic_id, keypair, data.into_bytes(), now, now + expires_in_secs * 1000)
        .await?;
    info!(topic = %topic_id, message = %message_id, "published");
    println!("{}", message_id.to_hex());
    Ok(())
}

async fn subscribe_and_print(client: &PubSubClient, keypair: &KeyPair, topic: &str, ttl_secs: i64) -> anyhow::Result<()> {
    let topic_id = parse_topic(topic);
    let now = now_millis();
    let mut rx = client.subscribe(topic_id, keypair, now, ttl_secs * 1000).await?;
    info!(topic = %topic_id, "subscribed, waiting for messages (Ctrl-C to stop)");

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(message) => println!("{}", String::from_utf8_lossy(&message.data)),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    client.unsubscribe(topic_id, now_millis()).await.ok();
    Ok(())
}

async fn serve(client: &PubSubClient, keypair: &KeyPair, topics: &[String], ttl_secs: i64) -> anyhow::Result<()> {
    if topics.is_empty() {
        anyhow::bail!("serve requires at least one --topics entry");
    }

    let now = now_millis();
    let mut receivers = Vec::with_capacity(topics.len());
    for topic in topics {
        let topic_id = parse_topic(topic);
        match client.subscribe(topic_id, keypair, now, ttl_secs * 1000).await {
            Ok(rx) => receivers.push((topic_id, rx)),
            Err(ClientError::AlreadySubscribed(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    info!(topics = topics.len(), "serving, Ctrl-C to stop");

    let mut stats_ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = stats_ticker.tick() => {
                let stats = client.get_stats();
                info!(?stats, "stats");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    for (topic_id, mut rx) in receivers {
        rx.close();
        client.unsubscribe(topic_id, now_millis()).await.ok();
    }
    Ok(())
}
