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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;

use super::SpanReplication;
use crate::model::{ChangefeedId, DispatcherId, NodeId, SchemaId, TableId, Ts};

/// Authoritative in-memory index of every table span of one changefeed.
///
/// A span is in exactly one of three scheduling states:
/// - *absent*: not bound to any node;
/// - *scheduling*: bound, an operator is driving it towards its goal;
/// - *replicating*: bound and healthy.
///
/// All operations are atomic under one rw-lock; reverse indexes (by node, by
/// schema, by table) are consistent with the primary map whenever the lock
/// is released. The lock is never held across a message send.
pub struct ReplicationDb {
    changefeed_id: ChangefeedId,
    core: RwLock<ReplicationDbCore>,
}

#[derive(Default)]
struct ReplicationDbCore {
    tasks: HashMap<DispatcherId, Arc<SpanReplication>>,
    /// Ordered, so schedule candidates come out in a stable order across
    /// calls until one of them is bound.
    absent: BTreeMap<DispatcherId, Arc<SpanReplication>>,
    scheduling: HashMap<DispatcherId, Arc<SpanReplication>>,
    replicating: HashMap<DispatcherId, Arc<SpanReplication>>,

    node_tasks: HashMap<NodeId, HashSet<DispatcherId>>,
    schema_tasks: HashMap<SchemaId, HashSet<DispatcherId>>,
    table_tasks: HashMap<TableId, HashSet<DispatcherId>>,

    bind_counter: u64,
}

impl ReplicationDbCore {
    fn unlink_indexes(&mut self, span: &Arc<SpanReplication>) {
        if let Some(node) = span.node_id() {
            if let Some(set) = self.node_tasks.get_mut(&node) {
                set.remove(&span.id);
                if set.is_empty() {
                    self.node_tasks.remove(&node);
                }
            }
        }
        if let Some(set) = self.schema_tasks.get_mut(&span.schema_id()) {
            set.remove(&span.id);
            if set.is_empty() {
                self.schema_tasks.remove(&span.schema_id());
            }
        }
        if let Some(set) = self.table_tasks.get_mut(&span.span.table_id) {
            set.remove(&span.id);
            if set.is_empty() {
                self.table_tasks.remove(&span.span.table_id);
            }
        }
    }

    /// Detaches a span from every index. The node binding is kept on the
    /// span itself so a remove operator still knows where to address the
    /// teardown.
    fn remove_task(&mut self, id: DispatcherId) -> Option<Arc<SpanReplication>> {
        let span = self.tasks.remove(&id)?;
        self.absent.remove(&id);
        self.scheduling.remove(&id);
        self.replicating.remove(&id);
        self.unlink_indexes(&span);
        Some(span)
    }

    fn insert_absent(&mut self, span: Arc<SpanReplication>) {
        self.schema_tasks
            .entry(span.schema_id())
            .or_default()
            .insert(span.id);
        self.table_tasks
            .entry(span.span.table_id)
            .or_default()
            .insert(span.id);
        self.absent.insert(span.id, span.clone());
        self.tasks.insert(span.id, span);
    }
}

impl ReplicationDb {
    pub fn new(changefeed_id: ChangefeedId) -> Self {
        Self {
            changefeed_id,
            core: RwLock::new(ReplicationDbCore::default()),
        }
    }

    pub fn changefeed_id(&self) -> &ChangefeedId {
        &self.changefeed_id
    }

    /// Registers a new span with no node bound.
    pub fn add_absent_replica_set(&self, span: Arc<SpanReplication>) {
        let mut core = self.core.write();
        if core.tasks.contains_key(&span.id) {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                dispatcher = %span.id,
                "span already tracked, ignored",
            );
            return;
        }
        core.insert_absent(span);
    }

    /// Moves a span onto `new` and marks it scheduling. Legal from the
    /// absent state (`old` is `None`) or from a bound state (move).
    pub fn bind_span_to_node(
        &self,
        old: Option<&NodeId>,
        new: &NodeId,
        span: &Arc<SpanReplication>,
    ) {
        let mut core = self.core.write();
        if !core.tasks.contains_key(&span.id) {
            return;
        }
        core.absent.remove(&span.id);
        core.replicating.remove(&span.id);
        if let Some(old) = old {
            if let Some(set) = core.node_tasks.get_mut(old) {
                set.remove(&span.id);
                if set.is_empty() {
                    core.node_tasks.remove(old);
                }
            }
        }
        span.set_node(Some(new.clone()));
        core.bind_counter += 1;
        span.set_bind_seq(core.bind_counter);
        core.node_tasks
            .entry(new.clone())
            .or_default()
            .insert(span.id);
        core.scheduling.insert(span.id, span.clone());
    }

    /// scheduling → replicating, once the dispatcher reported working.
    pub fn mark_span_replicating(&self, span: &Arc<SpanReplication>) {
        let mut core = self.core.write();
        if core.scheduling.remove(&span.id).is_some() {
            core.replicating.insert(span.id, span.clone());
        }
    }

    /// Unbinds a span: working/scheduling → absent, node cleared.
    pub fn mark_span_absent(&self, span: &Arc<SpanReplication>) {
        let mut core = self.core.write();
        if !core.tasks.contains_key(&span.id) {
            return;
        }
        core.scheduling.remove(&span.id);
        core.replicating.remove(&span.id);
        if let Some(node) = span.node_id() {
            if let Some(set) = core.node_tasks.get_mut(&node) {
                set.remove(&span.id);
                if set.is_empty() {
                    core.node_tasks.remove(&node);
                }
            }
        }
        span.set_node(None);
        core.absent.insert(span.id, span.clone());
    }

    /// Up to `limit` absent spans, in stable order.
    pub fn get_schedule_state(&self, limit: usize) -> Vec<Arc<SpanReplication>> {
        self.core
            .read()
            .absent
            .values()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Bound-span count per node, over scheduling ∪ replicating.
    pub fn get_task_size_per_node(&self) -> HashMap<NodeId, usize> {
        self.core
            .read()
            .node_tasks
            .iter()
            .map(|(node, set)| (node.clone(), set.len()))
            .collect()
    }

    pub fn get_task_by_id(&self, id: DispatcherId) -> Option<Arc<SpanReplication>> {
        self.core.read().tasks.get(&id).cloned()
    }

    pub fn get_task_by_node_id(&self, node: &NodeId) -> Vec<Arc<SpanReplication>> {
        let core = self.core.read();
        core.node_tasks
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| core.tasks.get(id).cloned())
            .collect()
    }

    pub fn get_tasks_by_schema_id(&self, schema_id: SchemaId) -> Vec<Arc<SpanReplication>> {
        let core = self.core.read();
        core.schema_tasks
            .get(&schema_id)
            .into_iter()
            .flatten()
            .filter_map(|id| core.tasks.get(id).cloned())
            .collect()
    }

    pub fn get_tasks_by_table_ids(&self, table_ids: &[TableId]) -> Vec<Arc<SpanReplication>> {
        let core = self.core.read();
        table_ids
            .iter()
            .filter_map(|table_id| core.table_tasks.get(table_id))
            .flatten()
            .unique()
            .filter_map(|id| core.tasks.get(id).cloned())
            .collect()
    }

    /// Spans of the changefeed that are replicating on some node.
    pub fn get_replicating(&self) -> Vec<Arc<SpanReplication>> {
        self.core.read().replicating.values().cloned().collect()
    }

    /// Every span tracked for the changefeed, in any scheduling state.
    pub fn get_all_tasks(&self) -> Vec<Arc<SpanReplication>> {
        self.core.read().tasks.values().cloned().collect()
    }

    pub fn get_absent_size(&self) -> usize {
        self.core.read().absent.len()
    }

    pub fn get_scheduling_size(&self) -> usize {
        self.core.read().scheduling.len()
    }

    pub fn get_replicating_size(&self) -> usize {
        self.core.read().replicating.len()
    }

    pub fn task_size(&self) -> usize {
        self.core.read().tasks.len()
    }

    /// Drains the whole changefeed. Returns the spans that were bound to a
    /// node so the caller can attach remove operators; absent spans have no
    /// remote dispatcher and are dropped outright.
    pub fn try_remove_all(&self) -> Vec<Arc<SpanReplication>> {
        let ids = self.core.read().tasks.keys().copied().collect_vec();
        self.remove_ids(&ids)
    }

    /// Drains every span of one schema. Same return contract as
    /// [`Self::try_remove_all`].
    pub fn try_remove_by_schema_id(&self, schema_id: SchemaId) -> Vec<Arc<SpanReplication>> {
        let ids = {
            let core = self.core.read();
            core.schema_tasks
                .get(&schema_id)
                .into_iter()
                .flatten()
                .copied()
                .collect_vec()
        };
        self.remove_ids(&ids)
    }

    /// Drains every span of the given tables. Same return contract as
    /// [`Self::try_remove_all`].
    pub fn try_remove_by_table_ids(&self, table_ids: &[TableId]) -> Vec<Arc<SpanReplication>> {
        let ids = {
            let core = self.core.read();
            table_ids
                .iter()
                .filter_map(|table_id| core.table_tasks.get(table_id))
                .flatten()
                .copied()
                .unique()
                .collect_vec()
        };
        self.remove_ids(&ids)
    }

    fn remove_ids(&self, ids: &[DispatcherId]) -> Vec<Arc<SpanReplication>> {
        let mut bound = Vec::new();
        let mut core = self.core.write();
        for id in ids {
            let was_absent = core.absent.contains_key(id);
            if let Some(span) = core.remove_task(*id) {
                if !was_absent {
                    bound.push(span);
                }
            }
        }
        bound
    }

    /// Removes one span from every index, regardless of its state.
    pub fn force_remove(&self, id: DispatcherId) {
        self.core.write().remove_task(id);
    }

    /// Moves every span of `table_id` to `new_schema_id`, reindexing
    /// atomically.
    pub fn update_schema_id(&self, table_id: TableId, new_schema_id: SchemaId) {
        let mut core = self.core.write();
        let ids = core
            .table_tasks
            .get(&table_id)
            .into_iter()
            .flatten()
            .copied()
            .collect_vec();
        for id in ids {
            let Some(span) = core.tasks.get(&id).cloned() else {
                continue;
            };
            let old_schema_id = span.schema_id();
            if old_schema_id == new_schema_id {
                continue;
            }
            if let Some(set) = core.schema_tasks.get_mut(&old_schema_id) {
                set.remove(&id);
                if set.is_empty() {
                    core.schema_tasks.remove(&old_schema_id);
                }
            }
            span.set_schema_id(new_schema_id);
            core.schema_tasks.entry(new_schema_id).or_default().insert(id);
        }
    }

    /// Replaces a split parent with its children in one step: the parent
    /// leaves every index and the children enter bound to `node`, in the
    /// scheduling state.
    pub fn replace_replica_set(
        &self,
        old_id: DispatcherId,
        children: &[Arc<SpanReplication>],
        node: &NodeId,
    ) {
        let mut core = self.core.write();
        core.remove_task(old_id);
        for child in children {
            core.insert_absent(child.clone());
            core.absent.remove(&child.id);
            child.set_node(Some(node.clone()));
            core.bind_counter += 1;
            child.set_bind_seq(core.bind_counter);
            core.node_tasks
                .entry(node.clone())
                .or_default()
                .insert(child.id);
            core.scheduling.insert(child.id, child.clone());
        }
    }

    /// Minimum checkpoint over the non-absent (scheduling ∪ replicating)
    /// spans; `None` when no span is bound to a node. An absent span keeps
    /// its last reported checkpoint but no dispatcher is advancing it, so
    /// it must not pin the changefeed floor.
    pub fn lowest_checkpoint_ts(&self) -> Option<Ts> {
        let core = self.core.read();
        core.scheduling
            .values()
            .chain(core.replicating.values())
            .map(|span| span.checkpoint_ts())
            .min()
    }

    /// Asserts the partition and reverse-index invariants. Test builds only.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let core = self.core.read();
        for (id, span) in &core.tasks {
            let states = [
                core.absent.contains_key(id),
                core.scheduling.contains_key(id),
                core.replicating.contains_key(id),
            ];
            assert_eq!(
                states.iter().filter(|in_state| **in_state).count(),
                1,
                "span {id} must be in exactly one scheduling state"
            );
            if core.absent.contains_key(id) {
                assert_eq!(span.node_id(), None);
            } else {
                let node = span.node_id().expect("bound span must have a node");
                assert!(core.node_tasks[&node].contains(id));
            }
            assert!(core.schema_tasks[&span.schema_id()].contains(id));
            assert!(core.table_tasks[&span.span.table_id].contains(id));
        }
        let indexed: usize = core.node_tasks.values().map(HashSet::len).sum();
        assert_eq!(indexed, core.scheduling.len() + core.replicating.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::span_for_table;

    fn new_db() -> ReplicationDb {
        ReplicationDb::new("cf".into())
    }

    fn add_span(db: &ReplicationDb, schema_id: SchemaId, table_id: TableId) -> Arc<SpanReplication> {
        let span = Arc::new(SpanReplication::new(
            db.changefeed_id().clone(),
            schema_id,
            span_for_table(table_id),
            1,
        ));
        db.add_absent_replica_set(span.clone());
        span
    }

    #[test]
    fn test_lifecycle_absent_to_replicating() {
        let db = new_db();
        let span = add_span(&db, 1, 1);
        assert_eq!(db.get_absent_size(), 1);
        db.check_invariants();

        let node = NodeId::from("node1");
        db.bind_span_to_node(None, &node, &span);
        assert_eq!(db.get_absent_size(), 0);
        assert_eq!(db.get_scheduling_size(), 1);
        assert_eq!(span.node_id(), Some(node.clone()));
        db.check_invariants();

        db.mark_span_replicating(&span);
        assert_eq!(db.get_replicating_size(), 1);
        assert_eq!(db.get_task_size_per_node()[&node], 1);
        db.check_invariants();
    }

    #[test]
    fn test_bind_unbind_round_trip() {
        let db = new_db();
        let span = add_span(&db, 1, 1);
        db.bind_span_to_node(None, &NodeId::from("node1"), &span);
        db.mark_span_absent(&span);
        assert_eq!(db.get_absent_size(), 1);
        assert_eq!(span.node_id(), None);
        assert!(db.get_task_size_per_node().is_empty());
        db.check_invariants();
    }

    #[test]
    fn test_schedule_state_stable_until_bound() {
        let db = new_db();
        for table_id in 1..=4 {
            add_span(&db, 1, table_id);
        }
        let first = db.get_schedule_state(2);
        let second = db.get_schedule_state(2);
        assert_eq!(
            first.iter().map(|s| s.id).collect_vec(),
            second.iter().map(|s| s.id).collect_vec()
        );

        db.bind_span_to_node(None, &NodeId::from("node1"), &first[0]);
        let third = db.get_schedule_state(2);
        assert!(third.iter().all(|s| s.id != first[0].id));
    }

    #[test]
    fn test_try_remove_returns_only_bound_spans() {
        let db = new_db();
        let bound = add_span(&db, 1, 1);
        let _absent = add_span(&db, 1, 2);
        db.bind_span_to_node(None, &NodeId::from("node1"), &bound);

        let removed = db.try_remove_all();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, bound.id);
        assert_eq!(db.task_size(), 0);
        db.check_invariants();
    }

    #[test]
    fn test_remove_by_schema_and_table() {
        let db = new_db();
        add_span(&db, 1, 1);
        add_span(&db, 1, 2);
        add_span(&db, 2, 3);

        db.try_remove_by_schema_id(1);
        assert_eq!(db.task_size(), 1);
        assert_eq!(db.get_tasks_by_schema_id(2).len(), 1);

        db.try_remove_by_table_ids(&[3]);
        assert_eq!(db.task_size(), 0);
        db.check_invariants();
    }

    #[test]
    fn test_update_schema_id_reindexes() {
        let db = new_db();
        let span = add_span(&db, 1, 1);
        db.update_schema_id(1, 2);
        assert!(db.get_tasks_by_schema_id(1).is_empty());
        assert_eq!(db.get_tasks_by_schema_id(2).len(), 1);
        assert_eq!(span.schema_id(), 2);
        db.check_invariants();
    }

    #[test]
    fn test_replace_replica_set() {
        let db = new_db();
        let parent = add_span(&db, 1, 1);
        let node = NodeId::from("node1");
        db.bind_span_to_node(None, &node, &parent);

        let children = (0..2)
            .map(|_| {
                Arc::new(SpanReplication::new(
                    db.changefeed_id().clone(),
                    1,
                    span_for_table(1),
                    5,
                ))
            })
            .collect_vec();
        db.replace_replica_set(parent.id, &children, &node);

        assert!(db.get_task_by_id(parent.id).is_none());
        assert_eq!(db.get_scheduling_size(), 2);
        assert_eq!(db.get_task_size_per_node()[&node], 2);
        assert_eq!(db.get_tasks_by_table_ids(&[1]).len(), 2);
        db.check_invariants();
    }

    #[test]
    fn test_lowest_checkpoint_over_non_absent_spans() {
        let db = new_db();
        assert_eq!(db.lowest_checkpoint_ts(), None);
        let a = add_span(&db, 1, 1);
        let b = add_span(&db, 1, 2);
        // Absent spans do not contribute a floor.
        assert_eq!(db.lowest_checkpoint_ts(), None);

        db.bind_span_to_node(None, &NodeId::from("node1"), &a);
        db.bind_span_to_node(None, &NodeId::from("node1"), &b);
        a.update_status(&spanstream_pb::TableSpanStatus {
            id: Some(a.id.to_pb()),
            component_status: spanstream_pb::common::ComponentState::Working as i32,
            state: None,
            checkpoint_ts: 50,
            ack: None,
        });
        assert_eq!(db.lowest_checkpoint_ts(), Some(1));

        // A span falling back to absent stops pinning the floor at its last
        // reported checkpoint.
        db.mark_span_absent(&b);
        assert_eq!(db.lowest_checkpoint_ts(), Some(50));
    }

    #[test]
    fn test_move_rebinding_between_nodes() {
        let db = new_db();
        let span = add_span(&db, 1, 1);
        let node1 = NodeId::from("node1");
        let node2 = NodeId::from("node2");
        db.bind_span_to_node(None, &node1, &span);
        db.mark_span_replicating(&span);

        db.bind_span_to_node(Some(&node1), &node2, &span);
        let sizes = db.get_task_size_per_node();
        assert_eq!(sizes.get(&node1), None);
        assert_eq!(sizes[&node2], 1);
        assert_eq!(db.get_scheduling_size(), 1);
        db.check_invariants();
    }
}
