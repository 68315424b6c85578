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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spanstream_pb as pb;
use spanstream_pb::common::ComponentState;

use crate::maintainer::replication::{ReplicationDb, SpanReplication};
use crate::messaging::Message;
use crate::model::{DispatcherId, NodeId};

/// Decomposes one span into children at chosen keys: tear the parent down,
/// atomically replace it with the children in the db, then create the
/// children on the same node. Finished once every child reports working.
pub struct SplitDispatcherOperator {
    db: Arc<ReplicationDb>,
    parent: Arc<SpanReplication>,
    children: Vec<Arc<SpanReplication>>,
    node: NodeId,
    parent_removed: AtomicBool,
    canceled: AtomicBool,
    removed: AtomicBool,
}

impl SplitDispatcherOperator {
    pub fn new(
        db: Arc<ReplicationDb>,
        parent: Arc<SpanReplication>,
        children: Vec<Arc<SpanReplication>>,
        node: NodeId,
    ) -> Self {
        Self {
            db,
            parent,
            children,
            node,
            parent_removed: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.parent.id
    }

    pub fn children(&self) -> usize {
        self.children.len()
    }

    pub fn start(&self) {}

    pub fn schedule(&self) -> Option<Message> {
        if self.is_finished() {
            return None;
        }
        if !self.parent_removed.load(Ordering::Acquire) {
            return Some(self.parent.new_remove_message(&self.node));
        }
        self.children
            .iter()
            .find(|child| child.component_state() != ComponentState::Working)
            .map(|child| child.new_create_message(&self.node))
    }

    pub fn check(&self, from: &NodeId, status: &pb::TableSpanStatus) {
        if self.parent_removed.load(Ordering::Acquire) || from != &self.node {
            return;
        }
        if matches!(
            status.component_status(),
            ComponentState::Stopped | ComponentState::Absent
        ) {
            // The children inherit the parent's replication progress.
            self.db
                .replace_replica_set(self.parent.id, &self.children, &self.node);
            self.parent_removed.store(true, Ordering::Release);
        }
    }

    pub fn is_finished(&self) -> bool {
        if self.canceled.load(Ordering::Acquire) || self.removed.load(Ordering::Acquire) {
            return true;
        }
        self.parent_removed.load(Ordering::Acquire)
            && self
                .children
                .iter()
                .all(|child| child.component_state() == ComponentState::Working)
    }

    pub fn post_finish(&self) {
        if self.canceled.load(Ordering::Acquire) {
            if self.parent_removed.load(Ordering::Acquire) {
                for child in &self.children {
                    self.db.mark_span_absent(child);
                }
            } else {
                self.db.mark_span_absent(&self.parent);
            }
            return;
        }
        for child in &self.children {
            self.db.mark_span_replicating(child);
        }
    }

    pub fn on_node_remove(&self, node: &NodeId) {
        if node == &self.node {
            self.canceled.store(true, Ordering::Release);
        }
    }

    pub fn on_task_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}
