//! The external DHT interface contract. `stickypub-dht` treats the DHT as a
//! collaborator, not a subsystem it owns: this trait is the whole of what a
//! node needs from it.

use async_trait::async_trait;
use stickypub_core::Id160;

use crate::error::Result;

/// A reachable DHT participant, as returned by `findNode`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: Id160,
    pub address: String,
}

impl NodeInfo {
    pub fn new(node_id: Id160, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
        }
    }
}

/// An envelope pushed directly to this node by a peer, the push-delivery
/// hook used alongside polling.
#[derive(Clone, Debug)]
pub struct PushEnvelope {
    pub from: NodeInfo,
    pub payload: Vec<u8>,
}

/// The operations stickypub needs from the underlying Kademlia-style DHT.
///
/// Implementations are free to be as simple or as networked as they like;
/// stickypub only ever calls through this trait. `get` may answer from a
/// local cache, while `get_from_network` must bypass it and fetch the
/// current value from the network (used wherever the coordinator object is
/// read, since a stale coordinator silently reintroduces lost updates).
#[async_trait]
pub trait DhtClient: Send + Sync {
    /// This node's own identity, for slot/routing computations.
    fn local_node(&self) -> NodeInfo;

    /// `store(key, value)`
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// `get(key)`: may be served from a local cache.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `getFromNetwork(key)`: always bypasses any local cache.
    async fn get_from_network(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `compareAndSwapCoordinator(key, expected, new)`: atomically replaces
    /// `key`'s value with `new` iff its current value equals `expected`
    /// (`None` meaning "key absent"). Returns whether the swap took effect.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool>;

    /// `findNode(id)`: the nodes in the routing table closest to `id`.
    async fn find_node(&self, id: Id160) -> Result<Vec<NodeInfo>>;

    /// `sendMessage(node, envelope)`: best-effort push delivery, used for
    /// the low-latency push hook. Never blocks subscribe correctness --
    /// polling remains the source of truth.
    async fn send_message(&self, to: &NodeInfo, payload: Vec<u8>) -> Result<()>;

    /// Drain one push envelope addressed to this node, if any are queued.
    async fn recv_push(&self) -> Option<PushEnvelope>;
}
