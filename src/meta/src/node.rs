// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fleet membership: which worker nodes are alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;
// Virtual-clock aware, so TTL tests can pause time.
use tokio::time::Instant;

use crate::model::NodeId;
use crate::{MetaError, MetaResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: String,
    pub epoch: u64,
}

pub type NodeManagerRef = Arc<NodeManager>;

struct NodeManagerCore {
    nodes: HashMap<NodeId, NodeInfo>,
    expire_at: HashMap<NodeId, Instant>,
}

/// Registry of alive worker nodes, expired by missing heartbeats.
pub struct NodeManager {
    node_ttl: Duration,
    core: RwLock<NodeManagerCore>,
    removal_subscribers: Mutex<Vec<UnboundedSender<NodeId>>>,
}

impl NodeManager {
    pub fn new(node_ttl: Duration) -> Self {
        Self {
            node_ttl,
            core: RwLock::new(NodeManagerCore {
                nodes: HashMap::new(),
                expire_at: HashMap::new(),
            }),
            removal_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a node (or refreshes its address/epoch after a restart).
    pub fn register_node(&self, info: NodeInfo) {
        let mut core = self.core.write();
        let id = info.id.clone();
        core.expire_at
            .insert(id.clone(), Instant::now() + self.node_ttl);
        if core.nodes.insert(id.clone(), info).is_none() {
            tracing::info!(node = %id, "node registered");
        }
    }

    pub fn remove_node(&self, id: &NodeId) {
        let removed = {
            let mut core = self.core.write();
            core.expire_at.remove(id);
            core.nodes.remove(id).is_some()
        };
        if removed {
            tracing::warn!(node = %id, "node removed");
            self.notify_removed(id);
        }
    }

    /// Refreshes the TTL of a node on heartbeat.
    pub fn heartbeat(&self, id: &NodeId) -> MetaResult<()> {
        let mut core = self.core.write();
        if !core.nodes.contains_key(id) {
            return Err(MetaError::invalid_node(id.clone()));
        }
        let deadline = Instant::now() + self.node_ttl;
        let expire_at = core.expire_at.entry(id.clone()).or_insert(deadline);
        *expire_at = (*expire_at).max(deadline);
        Ok(())
    }

    pub fn alive_nodes(&self) -> Vec<NodeInfo> {
        self.core
            .read()
            .nodes
            .values()
            .cloned()
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.core.read().nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.core.read().nodes.len()
    }

    /// Node removals (eviction or explicit) are pushed to every subscriber.
    pub fn subscribe_removals(&self) -> UnboundedReceiver<NodeId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.removal_subscribers.lock().push(tx);
        rx
    }

    fn notify_removed(&self, id: &NodeId) {
        self.removal_subscribers
            .lock()
            .retain(|tx| tx.send(id.clone()).is_ok());
    }

    fn evict_expired(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let expired = {
            let core = self.core.read();
            core.expire_at
                .iter()
                .filter(|(_, deadline)| **deadline < now)
                .map(|(id, _)| id.clone())
                .collect_vec()
        };
        for id in &expired {
            self.remove_node(id);
        }
        expired
    }

    /// Spawns the background checker evicting nodes whose TTL lapsed.
    pub fn start_node_checker(
        node_manager: NodeManagerRef,
        check_interval: Duration,
    ) -> (JoinHandle<()>, Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    _ = &mut shutdown_rx => {
                        tracing::info!("node checker is shutting down");
                        return;
                    }
                }
                for id in node_manager.evict_expired() {
                    tracing::warn!(node = %id, "evicted expired node");
                }
            }
        });
        (join_handle, shutdown_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> NodeInfo {
        NodeInfo {
            id: NodeId::from(id),
            addr: format!("{id}:5690"),
            epoch: 1,
        }
    }

    #[test]
    fn test_register_and_heartbeat() {
        let mgr = NodeManager::new(Duration::from_secs(60));
        mgr.register_node(info("node1"));
        mgr.register_node(info("node2"));
        assert_eq!(mgr.node_count(), 2);
        assert!(mgr.heartbeat(&NodeId::from("node1")).is_ok());
        assert!(mgr.heartbeat(&NodeId::from("node3")).is_err());

        let ids = mgr.alive_nodes().into_iter().map(|n| n.id).collect_vec();
        assert_eq!(ids, vec![NodeId::from("node1"), NodeId::from("node2")]);
    }

    #[test]
    fn test_removal_notifies_subscribers() {
        let mgr = NodeManager::new(Duration::from_secs(60));
        let mut rx = mgr.subscribe_removals();
        mgr.register_node(info("node1"));
        mgr.remove_node(&NodeId::from("node1"));
        assert_eq!(rx.try_recv().unwrap(), NodeId::from("node1"));
        // Removing an unknown node does not notify.
        mgr.remove_node(&NodeId::from("node1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_checker_evicts_expired() {
        let mgr = Arc::new(NodeManager::new(Duration::from_millis(100)));
        mgr.register_node(info("node1"));
        mgr.register_node(info("node2"));
        let mut rx = mgr.subscribe_removals();

        let (handle, shutdown) =
            NodeManager::start_node_checker(mgr.clone(), Duration::from_millis(50));

        // Keep node1 alive past node2's TTL.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            mgr.heartbeat(&NodeId::from("node1")).unwrap();
        }

        assert_eq!(rx.recv().await.unwrap(), NodeId::from("node2"));
        assert!(mgr.contains(&NodeId::from("node1")));
        assert_eq!(mgr.node_count(), 1);

        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }
}
