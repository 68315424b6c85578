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

//! The coordinator: cluster-wide placement of maintainers on nodes.
//!
//! One coordinator exists per cluster. Maintainers are its inferiors and
//! nodes its captures; placement and churn handling reuse the generic
//! supervisor and its scheduler chain.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use spanstream_pb as pb;
use spanstream_pb::common::ComponentState;
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;

use crate::messaging::{Message, MessageSender, Payload};
use crate::model::{ChangefeedId, MaintainerId, NodeId, Ts};
use crate::node::NodeManagerRef;
use crate::supervisor::{
    BalanceSupervisorScheduler, BasicSupervisorScheduler, InferiorSpec, Supervisor,
};
use crate::{MetaConfig, MetaResult};

/// Durable side of changefeed management. The real store lives outside the
/// control plane; the coordinator only reads the last acknowledged
/// checkpoint on start and writes it back as it advances.
pub trait MetadataStore: Send + Sync {
    fn save_checkpoint(&self, changefeed_id: &ChangefeedId, ts: Ts) -> MetaResult<()>;

    fn load_checkpoint(&self, changefeed_id: &ChangefeedId) -> MetaResult<Option<Ts>>;
}

/// In-memory metadata store, for tests and single-process setups.
#[derive(Default)]
pub struct MemoryMetadataStore {
    checkpoints: Mutex<HashMap<ChangefeedId, Ts>>,
}

impl MetadataStore for MemoryMetadataStore {
    fn save_checkpoint(&self, changefeed_id: &ChangefeedId, ts: Ts) -> MetaResult<()> {
        let mut checkpoints = self.checkpoints.lock();
        let entry = checkpoints.entry(changefeed_id.clone()).or_insert(ts);
        *entry = (*entry).max(ts);
        Ok(())
    }

    fn load_checkpoint(&self, changefeed_id: &ChangefeedId) -> MetaResult<Option<Ts>> {
        Ok(self.checkpoints.lock().get(changefeed_id).copied())
    }
}

/// A changefeed definition as the coordinator sees it.
#[derive(Clone, Debug)]
pub struct ChangefeedInfo {
    pub id: ChangefeedId,
    pub config: Vec<u8>,
    pub start_ts: Ts,
}

/// Addressing of maintainers on the wire, fed to the generic supervisor.
struct MaintainerSpec {
    changefeeds: Arc<RwLock<HashMap<ChangefeedId, ChangefeedInfo>>>,
    metadata: Arc<dyn MetadataStore>,
}

impl InferiorSpec for MaintainerSpec {
    type Id = MaintainerId;

    fn new_add_message(&self, id: &MaintainerId, capture: &NodeId) -> Message {
        let (config, start_ts) = {
            let changefeeds = self.changefeeds.read();
            changefeeds
                .get(id)
                .map(|info| (info.config.clone(), info.start_ts))
                .unwrap_or_default()
        };
        let checkpoint_ts = self
            .metadata
            .load_checkpoint(id)
            .ok()
            .flatten()
            .unwrap_or(start_ts);
        Message::new(
            NodeId::default(),
            capture.clone(),
            pb::topic::MAINTAINER_MANAGER,
            Payload::AddMaintainerRequest(pb::AddMaintainerRequest {
                changefeed_id: id.to_string(),
                config,
                checkpoint_ts,
            }),
        )
    }

    fn new_remove_message(&self, id: &MaintainerId, capture: &NodeId) -> Message {
        Message::new(
            NodeId::default(),
            capture.clone(),
            pb::topic::MAINTAINER_MANAGER,
            Payload::RemoveMaintainerRequest(pb::RemoveMaintainerRequest {
                changefeed_id: id.to_string(),
                cascade: true,
            }),
        )
    }

    fn new_bootstrap_message(&self, capture: &NodeId) -> Message {
        Message::new(
            NodeId::default(),
            capture.clone(),
            pb::topic::MAINTAINER_MANAGER,
            Payload::CoordinatorBootstrapRequest(pb::CoordinatorBootstrapRequest { version: 1 }),
        )
    }
}

/// Cluster-wide controller over maintainers.
pub struct Coordinator {
    config: MetaConfig,
    supervisor: Mutex<Supervisor<MaintainerSpec>>,
    changefeeds: Arc<RwLock<HashMap<ChangefeedId, ChangefeedInfo>>>,
    metadata: Arc<dyn MetadataStore>,
    node_manager: NodeManagerRef,
    message_sender: Arc<dyn MessageSender>,
}

impl Coordinator {
    pub fn new(
        config: MetaConfig,
        node_manager: NodeManagerRef,
        message_sender: Arc<dyn MessageSender>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Arc<Self> {
        let changefeeds: Arc<RwLock<HashMap<ChangefeedId, ChangefeedInfo>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let spec = MaintainerSpec {
            changefeeds: changefeeds.clone(),
            metadata: metadata.clone(),
        };
        let supervisor = Supervisor::new(
            "coordinator",
            spec,
            vec![
                Box::<BasicSupervisorScheduler<MaintainerId>>::default(),
                Box::new(BalanceSupervisorScheduler::new(config.balance_interval())),
            ],
            config.max_task_concurrency,
        );
        Arc::new(Self {
            config,
            supervisor: Mutex::new(supervisor),
            changefeeds,
            metadata,
            node_manager,
            message_sender,
        })
    }

    /// Registers a changefeed; a maintainer for it is placed on the next
    /// scheduling pass.
    pub fn add_changefeed(&self, info: ChangefeedInfo) {
        tracing::info!(changefeed = %info.id, start_ts = info.start_ts, "changefeed added");
        self.changefeeds.write().insert(info.id.clone(), info);
        self.supervisor.lock().mark_need_add();
    }

    /// Unregisters a changefeed; its maintainer is torn down on the next
    /// scheduling pass.
    pub fn remove_changefeed(&self, id: &ChangefeedId) {
        tracing::info!(changefeed = %id, "changefeed removed");
        self.changefeeds.write().remove(id);
        self.supervisor.lock().mark_need_remove();
    }

    /// One pass of the coordinator loop.
    pub fn tick(&self) {
        let all = self
            .changefeeds
            .read()
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>();
        let msgs = self.supervisor.lock().schedule(&all);
        self.send_all(msgs);
    }

    pub fn handle_message(&self, msg: Message) {
        match msg.payload {
            Payload::MaintainerHeartbeat(heartbeat) => {
                self.on_maintainer_heartbeat(&msg.from, &heartbeat)
            }
            Payload::CoordinatorBootstrapResponse(resp) => {
                self.on_bootstrap_response(&msg.from, &resp)
            }
            other => {
                tracing::warn!(
                    topic = %msg.topic,
                    payload = ?other,
                    "unexpected message for coordinator",
                );
            }
        }
    }

    fn on_maintainer_heartbeat(&self, from: &NodeId, heartbeat: &pb::MaintainerHeartbeat) {
        let mut supervisor = self.supervisor.lock();
        for status in &heartbeat.statuses {
            let id = ChangefeedId::from(status.changefeed_id.as_str());
            supervisor.handle_inferior_status(from, &id, status.state());
            for err in &status.err {
                tracing::error!(
                    changefeed = %id,
                    node = %err.node,
                    code = %err.code,
                    message = %err.message,
                    "maintainer reported error",
                );
            }
            if status.checkpoint_ts > 0 {
                if let Err(err) = self.metadata.save_checkpoint(&id, status.checkpoint_ts) {
                    tracing::warn!(changefeed = %id, error = ?err, "checkpoint not persisted");
                }
            }
        }
    }

    fn on_bootstrap_response(&self, from: &NodeId, resp: &pb::CoordinatorBootstrapResponse) {
        let working = resp
            .statuses
            .iter()
            .filter(|status| status.state() == ComponentState::Working)
            .map(|status| ChangefeedId::from(status.changefeed_id.as_str()))
            .collect::<Vec<_>>();
        tracing::info!(
            node = %from,
            maintainers = working.len(),
            "coordinator bootstrap response",
        );
        self.supervisor
            .lock()
            .handle_capture_initialized(from, working);
    }

    /// A node joined the fleet.
    pub fn on_node_added(&self, node: &NodeId) {
        let msg = self.supervisor.lock().handle_capture_added(node.clone());
        if let Some(msg) = msg {
            self.send_all(vec![msg]);
        }
    }

    /// A node left the fleet; its maintainers are rescheduled elsewhere.
    pub fn on_node_removed(&self, node: &NodeId) {
        self.supervisor.lock().handle_capture_removed(node);
    }

    pub fn last_checkpoint(&self, id: &ChangefeedId) -> Option<Ts> {
        self.metadata.load_checkpoint(id).ok().flatten()
    }

    fn send_all(&self, messages: Vec<Message>) {
        for msg in messages {
            if let Err(err) = self.message_sender.send_command(msg) {
                tracing::warn!(error = ?err, "coordinator message not sent");
            }
        }
    }

    /// Spawns the coordinator loop: registers alive nodes as captures and
    /// schedules at the configured tick.
    pub fn start(
        coordinator: Arc<Self>,
        mut node_removals: tokio::sync::mpsc::UnboundedReceiver<NodeId>,
    ) -> (JoinHandle<()>, Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let interval = coordinator.config.schedule_tick_interval();
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    node = node_removals.recv() => {
                        if let Some(node) = node {
                            coordinator.on_node_removed(&node);
                        }
                        continue;
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("coordinator is shutting down");
                        return;
                    }
                }
                for node in coordinator.node_manager.alive_nodes() {
                    coordinator.on_node_added(&node.id);
                }
                coordinator.tick();
            }
        });
        (join_handle, shutdown_tx)
    }

    /// Interval at which nodes are expected to heartbeat their maintainer
    /// statuses.
    pub fn heartbeat_interval(&self) -> Duration {
        self.config.schedule_tick_interval()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::messaging::tests::CollectingSender;
    use crate::node::{NodeInfo, NodeManager};
    use crate::supervisor::SchedulerStatus;

    struct Fixture {
        coordinator: Arc<Coordinator>,
        sender: Arc<CollectingSender>,
    }

    fn setup(nodes: &[&str]) -> Fixture {
        let node_manager = Arc::new(NodeManager::new(Duration::from_secs(60)));
        for node in nodes {
            node_manager.register_node(NodeInfo {
                id: NodeId::from(*node),
                addr: format!("{node}:5690"),
                epoch: 1,
            });
        }
        let sender = CollectingSender::new();
        let coordinator = Coordinator::new(
            MetaConfig::default(),
            node_manager,
            sender.clone(),
            Arc::new(MemoryMetadataStore::default()),
        );
        for node in nodes {
            coordinator.on_node_added(&NodeId::from(*node));
            coordinator.handle_message(Message::new(
                NodeId::from(*node),
                NodeId::default(),
                pb::topic::MAINTAINER_MANAGER,
                Payload::CoordinatorBootstrapResponse(pb::CoordinatorBootstrapResponse {
                    statuses: vec![],
                }),
            ));
        }
        sender.take();
        Fixture {
            coordinator,
            sender,
        }
    }

    fn heartbeat(node: &str, changefeed: &str, state: ComponentState, checkpoint: Ts) -> Message {
        Message::new(
            NodeId::from(node),
            NodeId::default(),
            pb::topic::COORDINATOR,
            Payload::MaintainerHeartbeat(pb::MaintainerHeartbeat {
                statuses: vec![pb::MaintainerStatus {
                    changefeed_id: changefeed.into(),
                    feed_state: "normal".into(),
                    state: state as i32,
                    checkpoint_ts: checkpoint,
                    err: vec![],
                }],
            }),
        )
    }

    #[test]
    fn test_changefeed_placement() {
        let fx = setup(&["node1"]);
        fx.coordinator.add_changefeed(ChangefeedInfo {
            id: "cf-1".into(),
            config: vec![],
            start_ts: 100,
        });

        fx.coordinator.tick();
        let sent = fx.sender.take();
        assert_eq!(sent.len(), 1);
        let req = assert_matches!(&sent[0].payload, Payload::AddMaintainerRequest(req) => req);
        assert_eq!(req.changefeed_id, "cf-1");
        assert_eq!(req.checkpoint_ts, 100);

        fx.coordinator.handle_message(heartbeat(
            "node1",
            "cf-1",
            ComponentState::Working,
            150,
        ));
        assert_eq!(
            fx.coordinator
                .supervisor
                .lock()
                .state_of(&ChangefeedId::from("cf-1")),
            Some(SchedulerStatus::Working)
        );
        // The acknowledged checkpoint is persisted, monotonically.
        assert_eq!(
            fx.coordinator.last_checkpoint(&ChangefeedId::from("cf-1")),
            Some(150)
        );
        fx.coordinator
            .handle_message(heartbeat("node1", "cf-1", ComponentState::Working, 120));
        assert_eq!(
            fx.coordinator.last_checkpoint(&ChangefeedId::from("cf-1")),
            Some(150)
        );
    }

    #[test]
    fn test_restart_uses_persisted_checkpoint() {
        let fx = setup(&["node1"]);
        fx.coordinator.add_changefeed(ChangefeedInfo {
            id: "cf-1".into(),
            config: vec![],
            start_ts: 100,
        });
        fx.coordinator.tick();
        fx.sender.take();
        fx.coordinator.handle_message(heartbeat(
            "node1",
            "cf-1",
            ComponentState::Working,
            500,
        ));

        // The maintainer crashes; the re-add starts from the last
        // acknowledged checkpoint instead of the original start ts.
        fx.coordinator
            .handle_message(heartbeat("node1", "cf-1", ComponentState::Stopped, 0));
        fx.coordinator.tick();
        let resent = fx
            .sender
            .take()
            .into_iter()
            .filter_map(|msg| match msg.payload {
                Payload::AddMaintainerRequest(req) => Some(req),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].checkpoint_ts, 500);
    }

    #[test]
    fn test_node_loss_reschedules_maintainer() {
        let fx = setup(&["node1", "node2"]);
        fx.coordinator.add_changefeed(ChangefeedInfo {
            id: "cf-1".into(),
            config: vec![],
            start_ts: 100,
        });
        fx.coordinator.tick();
        let sent = fx.sender.take();
        assert_eq!(sent.len(), 1);
        let placed_on = sent[0].to.clone();
        fx.coordinator.handle_message(heartbeat(
            placed_on.as_str(),
            "cf-1",
            ComponentState::Working,
            100,
        ));

        fx.coordinator.on_node_removed(&placed_on);
        fx.coordinator.tick();
        let readd = fx
            .sender
            .take()
            .into_iter()
            .filter(|msg| matches!(msg.payload, Payload::AddMaintainerRequest(_)))
            .collect::<Vec<_>>();
        assert_eq!(readd.len(), 1);
        assert_ne!(readd[0].to, placed_on);
    }

    #[test]
    fn test_remove_changefeed_tears_maintainer_down() {
        let fx = setup(&["node1"]);
        fx.coordinator.add_changefeed(ChangefeedInfo {
            id: "cf-1".into(),
            config: vec![],
            start_ts: 100,
        });
        fx.coordinator.tick();
        fx.sender.take();
        fx.coordinator.handle_message(heartbeat(
            "node1",
            "cf-1",
            ComponentState::Working,
            100,
        ));

        fx.coordinator.remove_changefeed(&ChangefeedId::from("cf-1"));
        fx.coordinator.tick();
        let sent = fx.sender.take();
        assert!(sent
            .iter()
            .any(|msg| matches!(msg.payload, Payload::RemoveMaintainerRequest(_))));
    }
}
