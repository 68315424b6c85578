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

//! The maintainer: per-changefeed controller.
//!
//! It owns the replication db, the scheduler chain, the operator controller
//! and the barrier manager of one changefeed. Two loops drive it: the main
//! tick (scheduler chain, then operator controller, then barrier resends)
//! and the message dispatch loop; the balance pass rides the main tick on
//! its own slower cadence.

pub mod barrier;
mod bootstrap;
pub mod operator;
pub mod replication;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub use bootstrap::Bootstrapper;
use parking_lot::Mutex;
use spanstream_pb as pb;
use spanstream_pb::common::ComponentState;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;

use self::barrier::BarrierManager;
use self::operator::OperatorController;
use self::replication::{ReplicationDb, SpanReplication};
use self::scheduler::{BalanceScheduler, BasicScheduler, SchedulerChain, SplitScheduler};
use crate::config::MetaConfig;
use crate::messaging::{Message, MessageSender, Payload};
use crate::model::{span_for_table, ChangefeedId, DispatcherId, NodeId, Ts};
use crate::node::NodeManagerRef;
use crate::schema::SchemaStore;
use crate::MetaResult;

/// Changefeed-level watermarks, readable without any lock.
pub struct WatermarkCell {
    checkpoint_ts: AtomicU64,
    resolved_ts: AtomicU64,
}

impl WatermarkCell {
    pub fn new(start_ts: Ts) -> Self {
        Self {
            checkpoint_ts: AtomicU64::new(start_ts),
            resolved_ts: AtomicU64::new(start_ts),
        }
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.checkpoint_ts.load(Ordering::Acquire)
    }

    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }

    /// Monotonic: a lower candidate never wins.
    pub fn advance_checkpoint(&self, ts: Ts) {
        self.checkpoint_ts.fetch_max(ts, Ordering::AcqRel);
    }

    pub fn advance_resolved(&self, ts: Ts) {
        self.resolved_ts.fetch_max(ts, Ordering::AcqRel);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FeedState {
    Normal,
    Failed,
    Removing,
    Stopped,
}

impl FeedState {
    fn as_str(self) -> &'static str {
        match self {
            FeedState::Normal => "normal",
            FeedState::Failed => "failed",
            FeedState::Removing => "removing",
            FeedState::Stopped => "stopped",
        }
    }
}

/// Per-changefeed controller. One instance per changefeed, placed on some
/// node by the coordinator.
pub struct Maintainer {
    changefeed_id: ChangefeedId,
    config: MetaConfig,
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    scheduler: SchedulerChain,
    barrier: Arc<BarrierManager>,
    node_manager: NodeManagerRef,
    message_sender: Arc<dyn MessageSender>,
    schema_store: Option<Arc<dyn SchemaStore>>,
    watermark: Arc<WatermarkCell>,
    bootstrapper: Mutex<Bootstrapper>,
    errors: Mutex<Vec<pb::RunningError>>,
    failed: AtomicBool,
    removing: AtomicBool,
}

impl Maintainer {
    pub fn new(
        changefeed_id: ChangefeedId,
        config: MetaConfig,
        node_manager: NodeManagerRef,
        message_sender: Arc<dyn MessageSender>,
        schema_store: Option<Arc<dyn SchemaStore>>,
        checkpoint_ts: Ts,
    ) -> Arc<Self> {
        let db = Arc::new(ReplicationDb::new(changefeed_id.clone()));
        let operator_controller = Arc::new(OperatorController::new(
            changefeed_id.clone(),
            db.clone(),
            message_sender.clone(),
            config.operator_batch_size,
            config.operator_retry_interval(),
        ));
        let watermark = Arc::new(WatermarkCell::new(checkpoint_ts));
        let scheduler = SchedulerChain::new(vec![
            Box::new(BasicScheduler::new(
                changefeed_id.clone(),
                db.clone(),
                operator_controller.clone(),
                node_manager.clone(),
            )),
            Box::new(BalanceScheduler::new(
                changefeed_id.clone(),
                db.clone(),
                operator_controller.clone(),
                node_manager.clone(),
                config.balance_interval(),
            )),
            Box::new(SplitScheduler::new(
                changefeed_id.clone(),
                db.clone(),
                operator_controller.clone(),
                watermark.clone(),
                config.split_lag_threshold,
            )),
        ]);
        let barrier = Arc::new(BarrierManager::new(
            changefeed_id.clone(),
            db.clone(),
            operator_controller.clone(),
        ));
        Arc::new(Self {
            changefeed_id: changefeed_id.clone(),
            config,
            db,
            operator_controller,
            scheduler,
            barrier,
            node_manager,
            message_sender,
            schema_store,
            watermark,
            bootstrapper: Mutex::new(Bootstrapper::new(changefeed_id, checkpoint_ts)),
            errors: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            removing: AtomicBool::new(false),
        })
    }

    pub fn changefeed_id(&self) -> &ChangefeedId {
        &self.changefeed_id
    }

    pub fn replication_db(&self) -> &Arc<ReplicationDb> {
        &self.db
    }

    pub fn operator_controller(&self) -> &Arc<OperatorController> {
        &self.operator_controller
    }

    pub fn barrier_manager(&self) -> &Arc<BarrierManager> {
        &self.barrier
    }

    pub fn watermark(&self) -> &Arc<WatermarkCell> {
        &self.watermark
    }

    /// Asks every alive node for its bootstrap snapshot. Scheduling stays
    /// gated until all of them answered.
    pub fn start_bootstrap(&self) {
        let mut bootstrapper = self.bootstrapper.lock();
        let requests = self
            .node_manager
            .alive_nodes()
            .into_iter()
            .filter_map(|node| bootstrapper.add_node(node.id))
            .collect::<Vec<_>>();
        drop(bootstrapper);
        self.send_all(requests);
    }

    /// Registers a brand-new table of the changefeed.
    pub fn add_new_table(&self, table: pb::Table, start_ts: Ts) {
        if !self.db.get_tasks_by_table_ids(&[table.table_id]).is_empty() {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                table_id = table.table_id,
                "table already tracked, ignored",
            );
            return;
        }
        self.db.add_absent_replica_set(Arc::new(SpanReplication::new(
            self.changefeed_id.clone(),
            table.schema_id,
            span_for_table(table.table_id),
            start_ts,
        )));
    }

    /// One pass of the main loop: admit scheduling, run operators, push
    /// barrier resends, refresh the checkpoint.
    pub fn tick(&self) {
        if self.removing.load(Ordering::Acquire) {
            self.operator_controller.execute();
            return;
        }

        let bootstrap_requests = self.bootstrapper.lock().pending_requests();
        if !bootstrap_requests.is_empty() {
            self.send_all(bootstrap_requests);
        }

        if self.all_nodes_initialized() {
            let running = self.operator_controller.operator_size();
            let available = self.config.max_task_concurrency.saturating_sub(running);
            self.scheduler.schedule(available);
        }

        self.operator_controller.execute();
        let resends = self.barrier.resend();
        self.send_all(resends);

        if let Some(min_ts) = self.db.lowest_checkpoint_ts() {
            self.watermark.advance_checkpoint(min_ts);
        }
    }

    fn all_nodes_initialized(&self) -> bool {
        self.bootstrapper.lock().all_initialized()
    }

    /// Routes one inbound message.
    pub fn handle_message(&self, msg: Message) {
        match msg.payload {
            Payload::HeartBeatRequest(req) => self.on_heartbeat(&msg.from, &req),
            Payload::MaintainerBootstrapResponse(resp) => {
                self.on_bootstrap_response(&msg.from, &resp)
            }
            other => {
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    topic = %msg.topic,
                    payload = ?other,
                    "unexpected message for maintainer",
                );
            }
        }
    }

    fn on_heartbeat(&self, from: &NodeId, req: &pb::HeartBeatRequest) {
        if let Some(watermark) = &req.watermark {
            self.watermark.advance_resolved(watermark.resolved_ts);
        }
        let mut responses = Vec::new();
        for status in &req.statuses {
            let Some(id) = status.id.map(DispatcherId::from_pb) else {
                continue;
            };
            if let Some(span) = self.db.get_task_by_id(id) {
                span.update_status(status);
            }
            self.operator_controller
                .update_operator_status(id, from, status);
            if let Err(err) = self.check_block_state(status) {
                // The DDL references metadata gone at the barrier ts; the
                // changefeed cannot make progress past it.
                self.on_running_error(pb::RunningError {
                    node: from.to_string(),
                    code: err.error_code().to_string(),
                    message: err.to_string(),
                });
                continue;
            }
            responses.extend(self.barrier.handle_status(from, status));
        }
        self.send_all(responses);

        if let Some(err) = &req.err {
            self.on_running_error(err.clone());
        }
        if let Some(warning) = &req.warning {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                node = %from,
                code = %warning.code,
                message = %warning.message,
                "dispatcher warning",
            );
        }
    }

    /// A block event adding tables must find their metadata alive at the
    /// barrier ts. Failure here is the one error fatal to the changefeed.
    fn check_block_state(&self, status: &pb::TableSpanStatus) -> MetaResult<()> {
        let Some(store) = &self.schema_store else {
            return Ok(());
        };
        let Some(state) = &status.state else {
            return Ok(());
        };
        if !state.is_blocked {
            return Ok(());
        }
        for table in &state.need_added_tables {
            match store.get_table_info(table.table_id, state.block_ts) {
                Err(err) if err.is_schema_deleted() => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        changefeed = %self.changefeed_id,
                        table_id = table.table_id,
                        error = ?err,
                        "table info unavailable at block ts",
                    );
                }
                Ok(_) => {}
            }
        }
        Ok(())
    }

    fn on_running_error(&self, err: pb::RunningError) {
        tracing::error!(
            changefeed = %self.changefeed_id,
            node = %err.node,
            code = %err.code,
            message = %err.message,
            "dispatcher reported error",
        );
        if err.code == "SchemaDeleted" {
            self.failed.store(true, Ordering::Release);
        }
        let mut errors = self.errors.lock();
        if errors.len() < 16 {
            errors.push(err);
        }
    }

    fn on_bootstrap_response(&self, from: &NodeId, resp: &pb::MaintainerBootstrapResponse) {
        {
            let mut bootstrapper = self.bootstrapper.lock();
            if !bootstrapper.mark_responded(from) {
                tracing::info!(
                    changefeed = %self.changefeed_id,
                    node = %from,
                    "duplicate bootstrap response ignored",
                );
                return;
            }
        }
        for reported in &resp.spans {
            let (Some(span), Some(id)) = (&reported.span, reported.dispatcher_id) else {
                continue;
            };
            let id = DispatcherId::from_pb(id);
            if self.db.get_task_by_id(id).is_some() {
                continue;
            }
            let replica = Arc::new(SpanReplication::with_id(
                id,
                self.changefeed_id.clone(),
                reported.schema_id,
                span.clone(),
                reported.checkpoint_ts,
            ));
            self.db.add_absent_replica_set(replica.clone());
            if ComponentState::try_from(reported.component_status) == Ok(ComponentState::Working) {
                self.db.bind_span_to_node(None, from, &replica);
                self.db.mark_span_replicating(&replica);
                replica.update_status(&pb::TableSpanStatus {
                    id: Some(id.to_pb()),
                    component_status: reported.component_status,
                    state: None,
                    checkpoint_ts: reported.checkpoint_ts,
                    ack: None,
                });
            }
        }
        tracing::info!(
            changefeed = %self.changefeed_id,
            node = %from,
            spans = resp.spans.len(),
            "bootstrap response applied",
        );
    }

    /// A node joined the fleet: ask it for a bootstrap snapshot.
    pub fn on_node_added(&self, node: &NodeId) {
        let request = self.bootstrapper.lock().add_node(node.clone());
        if let Some(request) = request {
            self.send_all(vec![request]);
        }
    }

    /// A node left: operators react and orphaned spans fall back to absent.
    pub fn on_node_removed(&self, node: &NodeId) {
        self.bootstrapper.lock().remove_node(node);
        self.operator_controller.on_node_removed(node);
    }

    /// Starts draining the changefeed: every span gets a remove operator,
    /// possibly superseding in-flight work. The maintainer reports stopped
    /// once the operator map is empty.
    pub fn stop(&self) {
        if self.removing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(changefeed = %self.changefeed_id, "stopping changefeed");
        self.barrier.clear();
        self.operator_controller.remove_all_tasks();
    }

    pub fn is_stopped(&self) -> bool {
        self.removing.load(Ordering::Acquire) && self.operator_controller.operator_size() == 0
    }

    /// Status snapshot for the next heartbeat to the coordinator. Drains
    /// accumulated running errors.
    pub fn get_maintainer_status(&self) -> pb::MaintainerStatus {
        let state = if self.is_stopped() {
            ComponentState::Stopped
        } else {
            ComponentState::Working
        };
        let feed_state = if self.removing.load(Ordering::Acquire) {
            if self.is_stopped() {
                FeedState::Stopped
            } else {
                FeedState::Removing
            }
        } else if self.failed.load(Ordering::Acquire) {
            FeedState::Failed
        } else {
            FeedState::Normal
        };
        pb::MaintainerStatus {
            changefeed_id: self.changefeed_id.to_string(),
            feed_state: feed_state.as_str().to_string(),
            state: state as i32,
            checkpoint_ts: self.watermark.checkpoint_ts(),
            err: std::mem::take(&mut *self.errors.lock()),
        }
    }

    fn send_all(&self, messages: Vec<Message>) {
        for msg in messages {
            if let Err(err) = self.message_sender.send_command(msg) {
                // Congestion and lost peers resolve themselves; the next
                // tick or resend window retries.
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    error = ?err,
                    "maintainer message not sent",
                );
            }
        }
    }

    /// Spawns the main loop: scheduler chain plus operator controller at the
    /// configured tick.
    pub fn start_main_loop(maintainer: Arc<Self>) -> (JoinHandle<()>, Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let interval = maintainer.config.schedule_tick_interval();
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown_rx => {
                        tracing::info!(
                            changefeed = %maintainer.changefeed_id,
                            "maintainer main loop is shutting down",
                        );
                        return;
                    }
                }
                maintainer.tick();
            }
        });
        (join_handle, shutdown_tx)
    }

    /// Spawns the message dispatch loop over the maintainer's inbound queue
    /// and the node-removal feed.
    pub fn start_message_loop(
        maintainer: Arc<Self>,
        mut messages: tokio::sync::mpsc::Receiver<Message>,
        mut node_removals: UnboundedReceiver<NodeId>,
    ) -> (JoinHandle<()>, Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = messages.recv() => {
                        let Some(msg) = msg else { return };
                        maintainer.handle_message(msg);
                    }
                    node = node_removals.recv() => {
                        let Some(node) = node else { return };
                        maintainer.on_node_removed(&node);
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!(
                            changefeed = %maintainer.changefeed_id,
                            "maintainer message loop is shutting down",
                        );
                        return;
                    }
                }
            }
        });
        (join_handle, shutdown_tx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use itertools::Itertools;

    use super::*;
    use crate::messaging::tests::CollectingSender;
    use crate::node::{NodeInfo, NodeManager};

    struct Fixture {
        maintainer: Arc<Maintainer>,
        sender: Arc<CollectingSender>,
        node_manager: NodeManagerRef,
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
        let maintainer = Maintainer::new(
            "cf".into(),
            MetaConfig::default(),
            node_manager.clone(),
            sender.clone(),
            None,
            100,
        );
        Fixture {
            maintainer,
            sender,
            node_manager,
        }
    }

    fn table(table_id: i64) -> pb::Table {
        pb::Table {
            table_id,
            schema_id: 1,
        }
    }

    fn bootstrap_response(node: &str) -> Message {
        Message::new(
            NodeId::from(node),
            NodeId::default(),
            pb::topic::MAINTAINER_BOOTSTRAP_RESPONSE,
            Payload::MaintainerBootstrapResponse(pb::MaintainerBootstrapResponse {
                changefeed_id: "cf".into(),
                spans: vec![],
            }),
        )
    }

    #[test]
    fn test_scheduling_gated_on_bootstrap() {
        let fx = setup(&["node1"]);
        fx.maintainer.start_bootstrap();
        fx.maintainer.add_new_table(table(1), 100);

        fx.maintainer.tick();
        // Only the bootstrap request went out; nothing was scheduled.
        assert_eq!(fx.maintainer.replication_db().get_absent_size(), 1);
        let sent = fx.sender.take();
        assert!(sent
            .iter()
            .all(|msg| matches!(msg.payload, Payload::MaintainerBootstrapRequest(_))));

        fx.maintainer.handle_message(bootstrap_response("node1"));
        fx.maintainer.tick();
        assert_eq!(fx.maintainer.replication_db().get_absent_size(), 0);
        assert_eq!(fx.maintainer.replication_db().get_scheduling_size(), 1);
        let sent = fx.sender.take();
        assert!(sent
            .iter()
            .any(|msg| matches!(msg.payload, Payload::ScheduleDispatcherRequest(_))));
    }

    #[test]
    fn test_bootstrap_seeds_working_spans() {
        let fx = setup(&["node1"]);
        fx.maintainer.start_bootstrap();
        let id = DispatcherId::new();
        fx.maintainer.handle_message(Message::new(
            NodeId::from("node1"),
            NodeId::default(),
            pb::topic::MAINTAINER_BOOTSTRAP_RESPONSE,
            Payload::MaintainerBootstrapResponse(pb::MaintainerBootstrapResponse {
                changefeed_id: "cf".into(),
                spans: vec![pb::BootstrapTableSpan {
                    span: Some(span_for_table(7)),
                    schema_id: 1,
                    component_status: ComponentState::Working as i32,
                    checkpoint_ts: 140,
                    dispatcher_id: Some(id.to_pb()),
                }],
            }),
        ));

        let db = fx.maintainer.replication_db();
        assert_eq!(db.get_replicating_size(), 1);
        let span = db.get_task_by_id(id).unwrap();
        assert_eq!(span.node_id(), Some(NodeId::from("node1")));
        assert_eq!(span.checkpoint_ts(), 140);
        db.check_invariants();
    }

    #[test]
    fn test_heartbeat_advances_checkpoint_monotonically() {
        let fx = setup(&["node1"]);
        fx.maintainer.start_bootstrap();
        fx.maintainer.handle_message(bootstrap_response("node1"));
        fx.maintainer.add_new_table(table(1), 100);
        fx.maintainer.tick();

        let db = fx.maintainer.replication_db();
        let span = db.get_schedule_state(1).into_iter().next();
        assert!(span.is_none(), "span should be bound after the tick");
        let span = &db.get_task_by_node_id(&NodeId::from("node1"))[0];

        let heartbeat = |checkpoint_ts| {
            Message::new(
                NodeId::from("node1"),
                NodeId::default(),
                pb::topic::heartbeat_request("cf"),
                Payload::HeartBeatRequest(pb::HeartBeatRequest {
                    changefeed_id: "cf".into(),
                    watermark: Some(pb::common::Watermark {
                        checkpoint_ts,
                        resolved_ts: checkpoint_ts + 5,
                    }),
                    statuses: vec![pb::TableSpanStatus {
                        id: Some(span.id.to_pb()),
                        component_status: ComponentState::Working as i32,
                        state: None,
                        checkpoint_ts,
                        ack: None,
                    }],
                    complete_status: true,
                    warning: None,
                    err: None,
                }),
            )
        };

        fx.maintainer.handle_message(heartbeat(150));
        fx.maintainer.tick();
        let status = fx.maintainer.get_maintainer_status();
        assert_eq!(status.checkpoint_ts, 150);

        // A regressing report must not pull the checkpoint back.
        fx.maintainer.handle_message(heartbeat(120));
        fx.maintainer.tick();
        let status = fx.maintainer.get_maintainer_status();
        assert_eq!(status.checkpoint_ts, 150);
    }

    #[test]
    fn test_stop_drains_operators() {
        let fx = setup(&["node1"]);
        fx.maintainer.start_bootstrap();
        fx.maintainer.handle_message(bootstrap_response("node1"));
        fx.maintainer.add_new_table(table(1), 100);
        fx.maintainer.tick();
        assert_eq!(fx.maintainer.operator_controller().operator_size(), 1);

        fx.maintainer.stop();
        assert!(!fx.maintainer.is_stopped());
        assert_eq!(
            fx.maintainer.get_maintainer_status().feed_state,
            "removing"
        );
        // The remove operator supersedes the in-flight add.
        let db = fx.maintainer.replication_db();
        assert_eq!(db.task_size(), 0);

        // The dispatcher confirms the teardown.
        let span_op = fx
            .maintainer
            .operator_controller()
            .get_operator(
                fx.sender
                    .take()
                    .iter()
                    .find_map(|msg| match &msg.payload {
                        Payload::ScheduleDispatcherRequest(req) => req
                            .config
                            .as_ref()
                            .and_then(|config| config.dispatcher_id)
                            .map(DispatcherId::from_pb),
                        _ => None,
                    })
                    .unwrap(),
            )
            .unwrap();
        span_op.check(
            &NodeId::from("node1"),
            &pb::TableSpanStatus {
                id: None,
                component_status: ComponentState::Stopped as i32,
                state: None,
                checkpoint_ts: 0,
                ack: None,
            },
        );
        fx.maintainer.tick();
        assert!(fx.maintainer.is_stopped());
        assert_eq!(fx.maintainer.get_maintainer_status().feed_state, "stopped");
    }

    #[test]
    fn test_dropped_schema_fails_changefeed() {
        use crate::schema::{DdlEvent, DdlKind, MemorySchemaStore};

        let node_manager = Arc::new(crate::node::NodeManager::new(Duration::from_secs(60)));
        node_manager.register_node(crate::node::NodeInfo {
            id: NodeId::from("node1"),
            addr: "node1:5690".into(),
            epoch: 1,
        });
        let store = Arc::new(MemorySchemaStore::new());
        store.apply_ddl(DdlEvent {
            kind: DdlKind::CreateTable,
            table_id: 9,
            schema_id: 1,
            table_name: "t9".into(),
            finished_ts: 5,
        });
        store.apply_ddl(DdlEvent {
            kind: DdlKind::DropTable,
            table_id: 9,
            schema_id: 1,
            table_name: "t9".into(),
            finished_ts: 8,
        });

        let sender = CollectingSender::new();
        let maintainer = Maintainer::new(
            "cf".into(),
            MetaConfig::default(),
            node_manager,
            sender,
            Some(store),
            1,
        );
        maintainer.handle_message(Message::new(
            NodeId::from("node1"),
            NodeId::default(),
            pb::topic::heartbeat_request("cf"),
            Payload::HeartBeatRequest(pb::HeartBeatRequest {
                changefeed_id: "cf".into(),
                watermark: None,
                statuses: vec![pb::TableSpanStatus {
                    id: Some(DispatcherId::new().to_pb()),
                    component_status: ComponentState::Working as i32,
                    state: Some(pb::State {
                        is_blocked: true,
                        block_ts: 10,
                        block_tables: None,
                        need_dropped_tables: None,
                        need_added_tables: vec![pb::Table {
                            table_id: 9,
                            schema_id: 1,
                        }],
                        updated_schemas: vec![],
                    }),
                    checkpoint_ts: 9,
                    ack: None,
                }],
                complete_status: true,
                warning: None,
                err: None,
            }),
        ));

        let status = maintainer.get_maintainer_status();
        assert_eq!(status.feed_state, "failed");
        assert_eq!(status.err.len(), 1);
        assert_eq!(status.err[0].code, "SchemaDeleted");
        // The poisoned event never reached the barrier manager.
        assert_eq!(maintainer.barrier_manager().event_count(), 0);
    }

    #[test]
    fn test_node_churn_reassigns_spans() {
        let fx = setup(&["node1", "node2"]);
        fx.maintainer.start_bootstrap();
        fx.maintainer.handle_message(bootstrap_response("node1"));
        fx.maintainer.handle_message(bootstrap_response("node2"));
        for table_id in 1..=2 {
            fx.maintainer.add_new_table(table(table_id), 100);
        }
        fx.maintainer.tick();
        let db = fx.maintainer.replication_db();
        assert_eq!(db.get_scheduling_size(), 2);

        // Every add lands.
        for span in db.get_all_tasks() {
            let node = span.node_id().unwrap();
            fx.maintainer.operator_controller().update_operator_status(
                span.id,
                &node,
                &pb::TableSpanStatus {
                    id: Some(span.id.to_pb()),
                    component_status: ComponentState::Working as i32,
                    state: None,
                    checkpoint_ts: 101,
                    ack: None,
                },
            );
        }
        fx.maintainer.tick();
        assert_eq!(db.get_replicating_size(), 2);

        // node2 dies: its spans fall back to absent and get rescheduled to
        // node1.
        fx.node_manager.remove_node(&NodeId::from("node2"));
        fx.maintainer.on_node_removed(&NodeId::from("node2"));
        fx.maintainer.tick();
        fx.maintainer.tick();
        let sizes = db.get_task_size_per_node();
        assert_eq!(sizes.get(&NodeId::from("node2")), None);
        assert_eq!(db.get_absent_size(), 0);
        assert_eq!(sizes[&NodeId::from("node1")], 2);
        db.check_invariants();

        let spans = db.get_all_tasks();
        assert_eq!(
            spans
                .iter()
                .filter_map(|span| span.node_id())
                .unique()
                .collect_vec(),
            vec![NodeId::from("node1")]
        );
    }
}
