//! In-process `DhtClient`, backed by a shared map instead of a real
//! Kademlia network. Used by tests and by a single-node `stickypubd` run
//! started with `--storage memory`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use stickypub_core::Id160;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::client::{DhtClient, NodeInfo, PushEnvelope};
use crate::error::{DhtError, Result};

/// A shared, in-memory "network" that multiple [`MemoryDht`] handles join.
/// All handles see the same key/value store, approximating how every real
/// DHT node eventually converges on the same replicated values; each has
/// its own push inbox, approximating point-to-point delivery.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    nodes: Arc<Mutex<HashMap<Id160, NodeInfo>>>,
    senders: Arc<Mutex<HashMap<Id160, mpsc::UnboundedSender<PushEnvelope>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join this network as `node`, returning a client handle for it.
    pub fn join(&self, node: NodeInfo) -> MemoryDht {
        self.nodes.lock().insert(node.node_id, node.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(node.node_id, tx);
        MemoryDht {
            node,
            store: self.store.clone(),
            nodes: self.nodes.clone(),
            senders: self.senders.clone(),
            inbox: Arc::new(AsyncMutex::new(rx)),
        }
    }
}

pub struct MemoryDht {
    node: NodeInfo,
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    nodes: Arc<Mutex<HashMap<Id160, NodeInfo>>>,
    senders: Arc<Mutex<HashMap<Id160, mpsc::UnboundedSender<PushEnvelope>>>>,
    inbox: Arc<AsyncMutex<mpsc::UnboundedReceiver<PushEnvelope>>>,
}

impl MemoryDht {
    /// A single-node network, for tests that don't need multiple peers.
    pub fn standalone(node: NodeInfo) -> Self {
        MemoryNetwork::new().join(node)
    }
}

#[async_trait]
impl DhtClient for MemoryDht {
    fn local_node(&self) -> NodeInfo {
        self.node.clone()
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.lock().get(key).cloned())
    }

    async fn get_from_network(&self, key: &str) -> Result<Option<Vec<u8>>> {
        // A single shared map has no staleness to bypass; kept distinct
        // from `get` so callers exercise the right call site.
        self.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool> {
        let mut store = self.store.lock();
        let current = store.get(key).cloned();
        if current == expected {
            store.insert(key.to_string(), new);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn find_node(&self, id: Id160) -> Result<Vec<NodeInfo>> {
        let mut nodes: Vec<NodeInfo> = self.nodes.lock().values().cloned().collect();
        nodes.sort_by_key(|n| xor_distance(&n.node_id, &id));
        Ok(nodes)
    }

    async fn send_message(&self, to: &NodeInfo, payload: Vec<u8>) -> Result<()> {
        let sender = self.senders.lock().get(&to.node_id).cloned();
        let Some(sender) = sender else {
            return Err(DhtError::NodeUnreachable(to.address.clone()));
        };
        sender
            .send(PushEnvelope {
                from: self.node.clone(),
                payload,
            })
            .map_err(|_| DhtError::NodeUnreachable(to.address.clone()))
    }

    /// Blocks until an envelope arrives (or the network is torn down).
    /// Callers that need to race this against a ticker or a shutdown
    /// signal do so with `tokio::select!`, not by polling it.
    async fn recv_push(&self) -> Option<PushEnvelope> {
        self.inbox.lock().await.recv().await
    }
}

fn xor_distance(a: &Id160, b: &Id160) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a.as_bytes()[i] ^ b.as_bytes()[i];
    }
    out
}
