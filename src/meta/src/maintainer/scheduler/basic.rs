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

use std::collections::HashMap;
use std::sync::Arc;

use super::SpanScheduler;
use crate::maintainer::operator::{AddDispatcherOperator, Operator, OperatorController};
use crate::maintainer::replication::ReplicationDb;
use crate::model::{ChangefeedId, NodeId};
use crate::node::NodeManagerRef;

/// Assigns every absent span to some alive node: fewest bound spans first,
/// node id as the tie break.
pub struct BasicScheduler {
    changefeed_id: ChangefeedId,
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    node_manager: NodeManagerRef,
}

impl BasicScheduler {
    pub fn new(
        changefeed_id: ChangefeedId,
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        node_manager: NodeManagerRef,
    ) -> Self {
        Self {
            changefeed_id,
            db,
            operator_controller,
            node_manager,
        }
    }
}

impl SpanScheduler for BasicScheduler {
    fn name(&self) -> &'static str {
        "basic-scheduler"
    }

    fn schedule(&self, max_tasks: usize) -> usize {
        if self.db.get_absent_size() == 0 {
            return 0;
        }
        let nodes = self.node_manager.alive_nodes();
        if nodes.is_empty() {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                "no alive node to schedule absent spans",
            );
            return 0;
        }

        let sizes = self.db.get_task_size_per_node();
        let mut loads: HashMap<NodeId, usize> = nodes
            .iter()
            .map(|node| (node.id.clone(), sizes.get(&node.id).copied().unwrap_or(0)))
            .collect();

        let mut created = 0;
        for span in self.db.get_schedule_state(max_tasks) {
            let target = loads
                .iter()
                .min_by_key(|(node, load)| (**load, (*node).clone()))
                .map(|(node, _)| node.clone())
                .expect("at least one alive node");

            self.db.bind_span_to_node(None, &target, &span);
            if self.operator_controller.add_operator(Operator::Add(
                AddDispatcherOperator::new(self.db.clone(), span, target.clone()),
            )) {
                *loads.get_mut(&target).expect("target is alive") += 1;
                created += 1;
            }
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use itertools::Itertools;

    use super::*;
    use crate::maintainer::replication::SpanReplication;
    use crate::messaging::tests::CollectingSender;
    use crate::model::span_for_table;
    use crate::node::{NodeInfo, NodeManager};

    fn node_manager(nodes: &[&str]) -> NodeManagerRef {
        let mgr = Arc::new(NodeManager::new(Duration::from_secs(60)));
        for node in nodes {
            mgr.register_node(NodeInfo {
                id: NodeId::from(*node),
                addr: format!("{node}:5690"),
                epoch: 1,
            });
        }
        mgr
    }

    fn setup(nodes: &[&str]) -> (Arc<ReplicationDb>, Arc<OperatorController>, BasicScheduler) {
        let db = Arc::new(ReplicationDb::new("cf".into()));
        let controller = Arc::new(OperatorController::new(
            "cf".into(),
            db.clone(),
            CollectingSender::new(),
            64,
            Duration::from_millis(500),
        ));
        let scheduler = BasicScheduler::new(
            "cf".into(),
            db.clone(),
            controller.clone(),
            node_manager(nodes),
        );
        (db, controller, scheduler)
    }

    fn add_absent(db: &Arc<ReplicationDb>, table_id: i64) {
        db.add_absent_replica_set(Arc::new(SpanReplication::new(
            "cf".into(),
            1,
            span_for_table(table_id),
            1,
        )));
    }

    #[test]
    fn test_least_loaded_assignment() {
        let (db, controller, scheduler) = setup(&["node1", "node2"]);
        for table_id in 1..=4 {
            add_absent(&db, table_id);
        }

        assert_eq!(scheduler.schedule(100), 4);
        assert_eq!(db.get_absent_size(), 0);
        assert_eq!(db.get_scheduling_size(), 4);
        assert_eq!(controller.operator_size(), 4);

        let sizes = db.get_task_size_per_node();
        assert_eq!(sizes[&NodeId::from("node1")], 2);
        assert_eq!(sizes[&NodeId::from("node2")], 2);
        db.check_invariants();
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        let (db, _controller, scheduler) = setup(&["node2", "node1"]);
        add_absent(&db, 1);
        assert_eq!(scheduler.schedule(100), 1);
        let bound = db
            .get_task_size_per_node()
            .into_keys()
            .collect_vec();
        assert_eq!(bound, vec![NodeId::from("node1")]);
    }

    #[test]
    fn test_no_alive_nodes() {
        let (db, _controller, scheduler) = setup(&[]);
        add_absent(&db, 1);
        assert_eq!(scheduler.schedule(100), 0);
        assert_eq!(db.get_absent_size(), 1);
    }

    #[test]
    fn test_batch_limited() {
        let (db, _controller, scheduler) = setup(&["node1"]);
        for table_id in 1..=5 {
            add_absent(&db, table_id);
        }
        assert_eq!(scheduler.schedule(2), 2);
        assert_eq!(db.get_absent_size(), 3);
    }
}
