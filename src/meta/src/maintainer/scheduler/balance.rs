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
use std::time::Duration;

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::SpanScheduler;
use crate::maintainer::operator::{MoveDispatcherOperator, Operator, OperatorController};
use crate::maintainer::replication::{ReplicationDb, SpanReplication};
use crate::model::{ChangefeedId, NodeId};
use crate::node::NodeManagerRef;

/// Evens working spans out over the alive nodes.
///
/// With N working spans on K nodes, the first `N mod K` nodes (in id order)
/// get a quota of `⌈N/K⌉` spans and the rest `⌊N/K⌋`; any node above its
/// quota sheds its longest-bound spans to the node furthest below quota.
/// Runs only while nothing else is in flight, so at most one balance round
/// exists cluster-wide at a time.
pub struct BalanceScheduler {
    changefeed_id: ChangefeedId,
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    node_manager: NodeManagerRef,
    check_interval: Duration,
    last_check: Mutex<Option<Instant>>,
}

impl BalanceScheduler {
    pub fn new(
        changefeed_id: ChangefeedId,
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        node_manager: NodeManagerRef,
        check_interval: Duration,
    ) -> Self {
        Self {
            changefeed_id,
            db,
            operator_controller,
            node_manager,
            check_interval,
            last_check: Mutex::new(None),
        }
    }
}

impl SpanScheduler for BalanceScheduler {
    fn name(&self) -> &'static str {
        "balance-scheduler"
    }

    fn schedule(&self, max_tasks: usize) -> usize {
        {
            let mut last_check = self.last_check.lock();
            if let Some(last) = *last_check {
                if last.elapsed() < self.check_interval {
                    return 0;
                }
            }
            *last_check = Some(Instant::now());
        }
        // The previous round (or any other reconfiguration) must fully land
        // before new moves are planned.
        if self.db.get_absent_size() != 0
            || self.db.get_scheduling_size() != 0
            || self.operator_controller.operator_size() != 0
        {
            return 0;
        }
        let nodes = self
            .node_manager
            .alive_nodes()
            .into_iter()
            .map(|node| node.id)
            .collect_vec();
        if nodes.len() < 2 {
            return 0;
        }

        let mut per_node: HashMap<NodeId, Vec<Arc<SpanReplication>>> = HashMap::new();
        for span in self.db.get_replicating() {
            let Some(node) = span.node_id() else {
                continue;
            };
            // Spans stranded on a dead node are the basic scheduler's job.
            if !nodes.contains(&node) {
                continue;
            }
            per_node.entry(node).or_default().push(span);
        }

        let total: usize = per_node.values().map(Vec::len).sum();
        if total == 0 {
            return 0;
        }
        let quota_high = total.div_ceil(nodes.len());
        let high_count = if total % nodes.len() == 0 {
            nodes.len()
        } else {
            total % nodes.len()
        };
        let quotas: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(at, node)| {
                let quota = if at < high_count {
                    quota_high
                } else {
                    quota_high.saturating_sub(1)
                };
                (node.clone(), quota)
            })
            .collect();
        let mut loads: HashMap<NodeId, usize> = nodes
            .iter()
            .map(|node| (node.clone(), per_node.get(node).map_or(0, Vec::len)))
            .collect();

        let mut moved = 0;
        'donors: for node in &nodes {
            if loads[node] <= quotas[node] {
                continue;
            }
            // Longest-bound first, so fresh placements are not churned.
            let spans = per_node
                .remove(node)
                .unwrap_or_default()
                .into_iter()
                .sorted_by_key(|span| span.bind_seq())
                .collect_vec();
            for span in spans {
                if loads[node] <= quotas[node] {
                    break;
                }
                if moved >= max_tasks {
                    break 'donors;
                }
                let Some(dest) = nodes
                    .iter()
                    .filter(|candidate| loads[*candidate] < quotas[*candidate])
                    .max_by_key(|candidate| {
                        (
                            quotas[*candidate] - loads[*candidate],
                            std::cmp::Reverse((*candidate).clone()),
                        )
                    })
                    .cloned()
                else {
                    break 'donors;
                };
                tracing::info!(
                    changefeed = %self.changefeed_id,
                    dispatcher = %span.id,
                    from = %node,
                    to = %dest,
                    "balance: moving span",
                );
                if self.operator_controller.add_operator(Operator::Move(
                    MoveDispatcherOperator::new(
                        self.db.clone(),
                        span,
                        node.clone(),
                        dest.clone(),
                    ),
                )) {
                    moved += 1;
                    *loads.get_mut(node).expect("donor is alive") -= 1;
                    *loads.get_mut(&dest).expect("dest is alive") += 1;
                }
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spanstream_pb::common::ComponentState;

    use super::*;
    use crate::messaging::tests::CollectingSender;
    use crate::model::span_for_table;
    use crate::node::{NodeInfo, NodeManager};

    struct Fixture {
        db: Arc<ReplicationDb>,
        controller: Arc<OperatorController>,
        node_manager: NodeManagerRef,
        scheduler: BalanceScheduler,
    }

    fn setup(nodes: &[&str]) -> Fixture {
        let db = Arc::new(ReplicationDb::new("cf".into()));
        let controller = Arc::new(OperatorController::new(
            "cf".into(),
            db.clone(),
            CollectingSender::new(),
            64,
            Duration::from_millis(500),
        ));
        let node_manager = Arc::new(NodeManager::new(Duration::from_secs(60)));
        for node in nodes {
            node_manager.register_node(NodeInfo {
                id: NodeId::from(*node),
                addr: format!("{node}:5690"),
                epoch: 1,
            });
        }
        let scheduler = BalanceScheduler::new(
            "cf".into(),
            db.clone(),
            controller.clone(),
            node_manager.clone(),
            Duration::ZERO,
        );
        Fixture {
            db,
            controller,
            node_manager,
            scheduler,
        }
    }

    fn add_working(db: &Arc<ReplicationDb>, table_id: i64, node: &NodeId) -> Arc<SpanReplication> {
        let span = Arc::new(SpanReplication::new(
            "cf".into(),
            1,
            span_for_table(table_id),
            1,
        ));
        db.add_absent_replica_set(span.clone());
        db.bind_span_to_node(None, node, &span);
        db.mark_span_replicating(&span);
        span
    }

    /// Lets every pending move finish as the dispatchers would.
    fn settle_moves(fx: &Fixture) {
        loop {
            if fx.controller.operator_size() == 0 && fx.db.get_scheduling_size() == 0 {
                return;
            }
            for span in fx.db.get_replicating() {
                let Some(op) = fx.controller.get_operator(span.id) else {
                    continue;
                };
                let origin = span.node_id().unwrap();
                let mut status = spanstream_pb::TableSpanStatus {
                    id: Some(span.id.to_pb()),
                    component_status: ComponentState::Stopped as i32,
                    state: None,
                    checkpoint_ts: 0,
                    ack: None,
                };
                op.check(&origin, &status);
                let dest = span.node_id().unwrap();
                status.component_status = ComponentState::Working as i32;
                op.check(&dest, &status);
            }
            fx.controller.execute();
        }
    }

    #[test]
    fn test_balance_reaches_even_distribution() {
        let fx = setup(&["node1", "node2", "node3"]);
        let node1 = NodeId::from("node1");
        for table_id in 1..=4 {
            add_working(&fx.db, table_id, &node1);
        }

        // Run balance rounds to a fixed point.
        for _ in 0..4 {
            if fx.scheduler.schedule(100) == 0 {
                break;
            }
            settle_moves(&fx);
        }

        let sizes = fx.db.get_task_size_per_node();
        let loads = fx
            .node_manager
            .alive_nodes()
            .into_iter()
            .map(|node| sizes.get(&node.id).copied().unwrap_or(0))
            .collect::<Vec<_>>();
        let max = *loads.iter().max().unwrap();
        let min = *loads.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced loads: {loads:?}");
        assert_eq!(loads.iter().sum::<usize>(), 4);
        fx.db.check_invariants();
    }

    #[test]
    fn test_balance_waits_for_in_flight_work() {
        let fx = setup(&["node1", "node2"]);
        let node1 = NodeId::from("node1");
        add_working(&fx.db, 1, &node1);
        add_working(&fx.db, 2, &node1);
        // An absent span means the basic scheduler still has work to do.
        fx.db.add_absent_replica_set(Arc::new(SpanReplication::new(
            "cf".into(),
            1,
            span_for_table(3),
            1,
        )));
        assert_eq!(fx.scheduler.schedule(100), 0);
    }

    #[test]
    fn test_balance_noop_when_even() {
        let fx = setup(&["node1", "node2"]);
        add_working(&fx.db, 1, &NodeId::from("node1"));
        add_working(&fx.db, 2, &NodeId::from("node2"));
        assert_eq!(fx.scheduler.schedule(100), 0);
    }

    #[test]
    fn test_single_node_never_balances() {
        let fx = setup(&["node1"]);
        add_working(&fx.db, 1, &NodeId::from("node1"));
        add_working(&fx.db, 2, &NodeId::from("node1"));
        assert_eq!(fx.scheduler.schedule(100), 0);
    }
}
