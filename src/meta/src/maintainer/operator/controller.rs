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

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use spanstream_pb as pb;
use tokio::time::Instant;

use super::{Operator, RemoveDispatcherOperator};
use crate::maintainer::replication::ReplicationDb;
use crate::messaging::MessageSender;
use crate::model::{ChangefeedId, DispatcherId, NodeId, SchemaId, TableId};

/// How long the controller sleeps when the queue is drained or the head
/// entry is not due yet.
const IDLE_INTERVAL: Duration = Duration::from_millis(200);
/// How long it sleeps after a full batch, to let heartbeats interleave.
const BATCH_INTERVAL: Duration = Duration::from_millis(50);

struct QueueItem {
    next_run: Instant,
    op: Arc<Operator>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.next_run == other.next_run
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earliest deadline at the top of the heap.
        other.next_run.cmp(&self.next_run)
    }
}

enum Poll {
    /// Queue drained or head not due.
    Idle,
    /// The popped entry needed no scheduling; keep polling.
    Skip,
    Ready(Arc<Operator>),
}

struct ControllerCore {
    operators: HashMap<DispatcherId, Arc<Operator>>,
    queue: BinaryHeap<QueueItem>,
}

/// Owns every live operator of one changefeed and drives them to completion
/// with a deadline queue.
pub struct OperatorController {
    changefeed_id: ChangefeedId,
    db: Arc<ReplicationDb>,
    message_sender: Arc<dyn MessageSender>,
    batch_size: usize,
    retry_interval: Duration,
    core: RwLock<ControllerCore>,
}

impl OperatorController {
    pub fn new(
        changefeed_id: ChangefeedId,
        db: Arc<ReplicationDb>,
        message_sender: Arc<dyn MessageSender>,
        batch_size: usize,
        retry_interval: Duration,
    ) -> Self {
        Self {
            changefeed_id,
            db,
            message_sender,
            batch_size,
            retry_interval,
            core: RwLock::new(ControllerCore {
                operators: HashMap::new(),
                queue: BinaryHeap::new(),
            }),
        }
    }

    /// Runs due operators, up to one batch, and returns when the next tick
    /// should happen.
    pub fn execute(&self) -> Instant {
        let mut executed = 0;
        loop {
            let op = match self.poll_queueing_operator() {
                Poll::Idle => return Instant::now() + IDLE_INTERVAL,
                Poll::Skip => continue,
                Poll::Ready(op) => op,
            };

            // Scheduling runs under the read lock so status updates from
            // heartbeats stay concurrent; the send happens with no lock held.
            let msg = {
                let _core = self.core.read();
                op.schedule()
            };
            if let Some(msg) = msg {
                if let Err(err) = self.message_sender.send_command(msg) {
                    // Dropped here; the queue retries on the next deadline.
                    tracing::warn!(
                        changefeed = %self.changefeed_id,
                        operator = %op,
                        error = ?err,
                        "operator message not sent",
                    );
                }
            }
            executed += 1;
            if executed >= self.batch_size {
                return Instant::now() + BATCH_INTERVAL;
            }
        }
    }

    /// Installs an operator. Rejects a duplicate owner for the dispatcher
    /// and a target unknown to the replication db.
    pub fn add_operator(&self, op: Operator) -> bool {
        let mut core = self.core.write();
        if core.operators.contains_key(&op.id()) {
            tracing::info!(
                changefeed = %self.changefeed_id,
                operator = %op,
                "add operator failed, operator already exists",
            );
            return false;
        }
        if self.db.get_task_by_id(op.id()).is_none() {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                operator = %op,
                "add operator failed, span not found",
            );
            return false;
        }
        tracing::info!(
            changefeed = %self.changefeed_id,
            operator = %op,
            "add operator to running queue",
        );
        let op = Arc::new(op);
        core.operators.insert(op.id(), op.clone());
        op.start();
        core.queue.push(QueueItem {
            next_run: Instant::now(),
            op,
        });
        true
    }

    /// Routes a dispatcher status to the operator owning it, if any.
    pub fn update_operator_status(
        &self,
        id: DispatcherId,
        from: &NodeId,
        status: &pb::TableSpanStatus,
    ) {
        let core = self.core.read();
        if let Some(op) = core.operators.get(&id) {
            op.check(from, status);
        }
    }

    /// A node went away: spans bound to it with no operator in flight fall
    /// back to absent, and every operator gets to react.
    pub fn on_node_removed(&self, node: &NodeId) {
        let core = self.core.read();
        for span in self.db.get_task_by_node_id(node) {
            if !core.operators.contains_key(&span.id) {
                self.db.mark_span_absent(&span);
            }
        }
        for op in core.operators.values() {
            op.on_node_remove(node);
        }
    }

    pub fn get_operator(&self, id: DispatcherId) -> Option<Arc<Operator>> {
        self.core.read().operators.get(&id).cloned()
    }

    pub fn operator_size(&self) -> usize {
        self.core.read().operators.len()
    }

    /// Drains the whole changefeed; called when it stops.
    pub fn remove_all_tasks(&self) {
        let mut core = self.core.write();
        for span in self.db.try_remove_all() {
            let op = RemoveDispatcherOperator::new(self.db.clone(), span);
            Self::install_remove(&self.changefeed_id, &mut core, op);
        }
    }

    /// Drains every span of a schema dropped by DDL.
    pub fn remove_tasks_by_schema_id(&self, schema_id: SchemaId) {
        let mut core = self.core.write();
        for span in self.db.try_remove_by_schema_id(schema_id) {
            let op = RemoveDispatcherOperator::new(self.db.clone(), span);
            Self::install_remove(&self.changefeed_id, &mut core, op);
        }
    }

    /// Drains every span of tables dropped by DDL.
    pub fn remove_tasks_by_table_ids(&self, table_ids: &[TableId]) {
        let mut core = self.core.write();
        for span in self.db.try_remove_by_table_ids(table_ids) {
            let op = RemoveDispatcherOperator::new(self.db.clone(), span);
            Self::install_remove(&self.changefeed_id, &mut core, op);
        }
    }

    /// A remove supersedes whatever operator currently owns the dispatcher:
    /// the displaced one gets `on_task_removed` and never `post_finish`.
    fn install_remove(
        changefeed_id: &ChangefeedId,
        core: &mut ControllerCore,
        op: RemoveDispatcherOperator,
    ) {
        if let Some(old) = core.operators.remove(&op.id()) {
            tracing::info!(
                changefeed = %changefeed_id,
                operator = %old,
                "replica set removed, replacing the live operator",
            );
            old.on_task_removed();
        }
        let op = Arc::new(Operator::Remove(op));
        core.operators.insert(op.id(), op.clone());
        op.start();
        core.queue.push(QueueItem {
            next_run: Instant::now(),
            op,
        });
    }

    fn poll_queueing_operator(&self) -> Poll {
        let mut core = self.core.write();
        let Some(item) = core.queue.pop() else {
            return Poll::Idle;
        };
        let op = item.op;
        let op_id = op.id();

        // A displaced operator may still sit in the queue; only the map says
        // who owns the dispatcher now.
        let owns = core
            .operators
            .get(&op_id)
            .is_some_and(|current| Arc::ptr_eq(current, &op));
        if !owns {
            return Poll::Skip;
        }
        if op.is_finished() {
            op.post_finish();
            core.operators.remove(&op_id);
            tracing::info!(
                changefeed = %self.changefeed_id,
                operator = %op,
                "operator finished",
            );
            return Poll::Skip;
        }
        let now = Instant::now();
        if now < item.next_run {
            core.queue.push(QueueItem {
                next_run: item.next_run,
                op,
            });
            return Poll::Idle;
        }
        core.queue.push(QueueItem {
            next_run: now + self.retry_interval,
            op: op.clone(),
        });
        Poll::Ready(op)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::maintainer::operator::AddDispatcherOperator;
    use crate::maintainer::replication::SpanReplication;
    use crate::messaging::tests::CollectingSender;
    use crate::messaging::Payload;
    use crate::model::span_for_table;
    use spanstream_pb::common::ComponentState;

    fn setup() -> (Arc<ReplicationDb>, Arc<CollectingSender>, OperatorController) {
        let db = Arc::new(ReplicationDb::new("cf".into()));
        let sender = CollectingSender::new();
        let controller = OperatorController::new(
            "cf".into(),
            db.clone(),
            sender.clone(),
            64,
            Duration::from_millis(500),
        );
        (db, sender, controller)
    }

    fn add_bound_span(db: &Arc<ReplicationDb>, table_id: TableId, node: &NodeId) -> Arc<SpanReplication> {
        let span = Arc::new(SpanReplication::new(
            "cf".into(),
            1,
            span_for_table(table_id),
            1,
        ));
        db.add_absent_replica_set(span.clone());
        db.bind_span_to_node(None, node, &span);
        span
    }

    fn working_status(span: &SpanReplication) -> pb::TableSpanStatus {
        pb::TableSpanStatus {
            id: Some(span.id.to_pb()),
            component_status: ComponentState::Working as i32,
            state: None,
            checkpoint_ts: 10,
            ack: None,
        }
    }

    #[test]
    fn test_add_operator_runs_to_completion() {
        let (db, sender, controller) = setup();
        let node = NodeId::from("node1");
        let span = add_bound_span(&db, 1, &node);

        assert!(controller.add_operator(Operator::Add(AddDispatcherOperator::new(
            db.clone(),
            span.clone(),
            node.clone(),
        ))));
        // Duplicate owner rejected.
        assert!(!controller.add_operator(Operator::Add(AddDispatcherOperator::new(
            db.clone(),
            span.clone(),
            node.clone(),
        ))));

        controller.execute();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_matches!(sent[0].payload, Payload::ScheduleDispatcherRequest(_));

        controller.update_operator_status(span.id, &node, &working_status(&span));
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        assert_eq!(db.get_replicating_size(), 1);
    }

    #[test]
    fn test_add_operator_rejects_unknown_span() {
        let (db, _sender, controller) = setup();
        let span = Arc::new(SpanReplication::new("cf".into(), 1, span_for_table(9), 1));
        assert!(!controller.add_operator(Operator::Add(AddDispatcherOperator::new(
            db,
            span,
            NodeId::from("node1"),
        ))));
    }

    #[test]
    fn test_remove_supersedes_live_operator() {
        let (db, sender, controller) = setup();
        let node = NodeId::from("node1");
        let span = add_bound_span(&db, 1, &node);

        controller.add_operator(Operator::Add(AddDispatcherOperator::new(
            db.clone(),
            span.clone(),
            node.clone(),
        )));
        controller.remove_all_tasks();
        assert_eq!(controller.operator_size(), 1);
        assert!(matches!(
            *controller.get_operator(span.id).unwrap(),
            Operator::Remove(_)
        ));
        // The span left the db with the drain.
        assert_eq!(db.task_size(), 0);

        controller.execute();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        let req =
            assert_matches!(&sent[0].payload, Payload::ScheduleDispatcherRequest(req) => req);
        assert_eq!(req.schedule_action(), pb::ScheduleAction::Remove);

        // The dispatcher acknowledges by reporting stopped.
        let mut status = working_status(&span);
        status.component_status = ComponentState::Stopped as i32;
        controller.update_operator_status(span.id, &node, &status);
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
    }

    #[test]
    fn test_node_removal_sweeps_unowned_spans() {
        let (db, _sender, controller) = setup();
        let node = NodeId::from("node1");
        let owned = add_bound_span(&db, 1, &node);
        let _unowned = add_bound_span(&db, 2, &node);

        controller.add_operator(Operator::Add(AddDispatcherOperator::new(
            db.clone(),
            owned.clone(),
            node.clone(),
        )));
        controller.on_node_removed(&node);

        // The span without an operator fell back to absent immediately; the
        // owned one goes through its operator's cancellation path.
        assert_eq!(db.get_absent_size(), 1);
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        assert_eq!(db.get_absent_size(), 2);
        db.check_invariants();
    }

    #[test]
    fn test_retry_cadence() {
        let (db, sender, controller) = setup();
        let node = NodeId::from("node1");
        let span = add_bound_span(&db, 1, &node);
        controller.add_operator(Operator::Add(AddDispatcherOperator::new(
            db.clone(),
            span,
            node,
        )));

        controller.execute();
        assert_eq!(sender.take().len(), 1);
        // Not due yet: nothing re-sent.
        controller.execute();
        assert_eq!(sender.take().len(), 0);
    }
}
