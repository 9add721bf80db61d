//! Persistent `DhtClient` backed by `sled`, for a long-lived `stickypubd`
//! node. Modeled on the single-`sled::Db`-with-named-trees layout used
//! elsewhere in this workspace for local storage.

use std::path::Path;

use async_trait::async_trait;
use sled::{CompareAndSwapError, Db};
use stickypub_core::Id160;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::client::{DhtClient, NodeInfo, PushEnvelope};
use crate::error::{DhtError, Result};

/// A durable DHT client for a single local node. The `values` tree holds
/// every stored key (messages, collections, coordinators, snapshots);
/// coordinator writes additionally go through sled's native atomic
/// compare-and-swap rather than an application-level lock, so CAS
/// correctness doesn't depend on every writer living in this process.
pub struct SledDht {
    node: NodeInfo,
    db: Db,
    values: sled::Tree,
    /// Push envelopes addressed to this node. A real DHT node would accept
    /// these over the wire; a single-process `sled`-backed node has no
    /// peer to receive from, so this only ever holds self-addressed sends.
    inbox_tx: mpsc::UnboundedSender<PushEnvelope>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<PushEnvelope>>,
}

impl SledDht {
    pub fn open(node: NodeInfo, path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let values = db.open_tree("values")?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            node,
            db,
            values,
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DhtClient for SledDht {
    fn local_node(&self) -> NodeInfo {
        self.node.clone()
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.values.insert(key, value)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(key)?.map(|v| v.to_vec()))
    }

    async fn get_from_network(&self, key: &str) -> Result<Option<Vec<u8>>> {
        // A single local `sled::Tree` has no separate network round-trip;
        // this node's durable store is itself the source of truth it would
        // otherwise have to fetch fresh.
        self.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool> {
        let result = self
            .values
            .compare_and_swap(key, expected, Some(new))?;
        match result {
            Ok(()) => Ok(true),
            Err(CompareAndSwapError { .. }) => Ok(false),
        }
    }

    async fn find_node(&self, _id: Id160) -> Result<Vec<NodeInfo>> {
        warn!("find_node called on a single-node sled-backed dht, returning only self");
        Ok(vec![self.node.clone()])
    }

    async fn send_message(&self, to: &NodeInfo, payload: Vec<u8>) -> Result<()> {
        if to.node_id != self.node.node_id {
            return Err(DhtError::NodeUnreachable(to.address.clone()));
        }
        self.inbox_tx
            .send(PushEnvelope {
                from: self.node.clone(),
                payload,
            })
            .map_err(|_| DhtError::NodeUnreachable(to.address.clone()))
    }

    /// Blocks until a self-addressed push arrives.
    async fn recv_push(&self) -> Option<PushEnvelope> {
        self.inbox_rx.lock().await.recv().await
    }
}
