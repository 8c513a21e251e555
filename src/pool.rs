//! Pinned node pool
//!
//! Access nodes are specialized to height ranges (sporks) and differ in
//! API coverage, so one block must be served end to end by one node.
//! `pin_by_height` picks that node; the fetcher reports back what it
//! learns (spork floors, missing bulk API) through monotone per-node
//! flags: `min_height` only rises, `no_bulk_api` only sticks to true.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::NodeError;
use crate::node_client::NodeClient;

struct NodeEntry {
    client: Arc<dyn NodeClient>,
    /// Lowest height this node is believed to serve.
    min_height: AtomicU64,
    /// Node rejected the bulk transaction/result RPCs.
    no_bulk_api: AtomicBool,
}

/// Pool of access nodes with per-height pinning.
pub struct PinnedPool {
    nodes: Vec<NodeEntry>,
}

/// A client pinned to one node for one height. All calls for that
/// height go through the same node for cross-call consistency.
#[derive(Clone)]
pub struct PinnedClient {
    client: Arc<dyn NodeClient>,
    node: String,
    node_index: usize,
    no_bulk_api: bool,
}

impl PinnedClient {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn no_bulk_api(&self) -> bool {
        self.no_bulk_api
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }
}

impl PinnedPool {
    pub fn new(clients: Vec<Arc<dyn NodeClient>>) -> Self {
        let nodes = clients
            .into_iter()
            .map(|client| NodeEntry {
                client,
                min_height: AtomicU64::new(0),
                no_bulk_api: AtomicBool::new(false),
            })
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pin a node for `height`. Candidates are nodes whose tracked
    /// floor allows the height; the pick is deterministic in
    /// (height, flags, attempt) so retries rotate through candidates
    /// instead of hammering one node.
    pub fn pin_by_height(&self, height: u64, attempt: u32) -> Result<PinnedClient, NodeError> {
        let candidates: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.min_height.load(Ordering::Acquire) <= height)
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return Err(NodeError::NoSuitableNode { height });
        }

        let pick = candidates[(height as usize + attempt as usize) % candidates.len()];
        let entry = &self.nodes[pick];
        debug!(
            height,
            attempt,
            node = entry.client.endpoint(),
            "pinned node"
        );
        Ok(PinnedClient {
            client: Arc::clone(&entry.client),
            node: entry.client.endpoint().to_string(),
            node_index: pick,
            no_bulk_api: entry.no_bulk_api.load(Ordering::Acquire),
        })
    }

    /// Raise a node's height floor. Only called when the remote
    /// explicitly signals a spork-root boundary; never lowers.
    pub fn mark_node_min_height(&self, node_index: usize, min_height: u64) {
        if let Some(entry) = self.nodes.get(node_index) {
            let prev = entry.min_height.fetch_max(min_height, Ordering::AcqRel);
            if min_height > prev {
                info!(
                    node = entry.client.endpoint(),
                    min_height, "raised node height floor"
                );
            }
        }
    }

    /// Record that a node rejects the bulk RPCs. Sticky.
    pub fn mark_no_bulk_api(&self, node_index: usize) {
        if let Some(entry) = self.nodes.get(node_index) {
            if !entry.no_bulk_api.swap(true, Ordering::AcqRel) {
                info!(node = entry.client.endpoint(), "node flagged: no bulk API");
            }
        }
    }

    /// Any healthy client, for latest-block script execution and other
    /// height-independent calls.
    pub fn any_client(&self) -> Option<Arc<dyn NodeClient>> {
        self.nodes.first().map(|n| Arc::clone(&n.client))
    }

    pub fn node_min_height(&self, node_index: usize) -> Option<u64> {
        self.nodes
            .get(node_index)
            .map(|n| n.min_height.load(Ordering::Acquire))
    }

    /// Latest sealed height, asking nodes in order until one answers.
    pub async fn get_latest_block_height(
        &self,
        cancel: &CancellationToken,
    ) -> Result<u64, NodeError> {
        let mut last_err = NodeError::NoSuitableNode { height: 0 };
        for entry in &self.nodes {
            match entry.client.get_latest_block_height(cancel).await {
                Ok(h) => return Ok(h),
                Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
                Err(e) => {
                    debug!(node = entry.client.endpoint(), error = %e, "latest height query failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
