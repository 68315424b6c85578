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

/// Tears a dispatcher down. Finished once its node reports it stopped, or
/// the node itself is gone. Supersedes any other operator on the same
/// dispatcher.
pub struct RemoveDispatcherOperator {
    db: Arc<ReplicationDb>,
    span: Arc<SpanReplication>,
    /// Captured at creation: the span may already be detached from the db
    /// when the changefeed is being drained.
    node: Option<NodeId>,
    finished: AtomicBool,
    removed: AtomicBool,
}

impl RemoveDispatcherOperator {
    pub fn new(db: Arc<ReplicationDb>, span: Arc<SpanReplication>) -> Self {
        let node = span.node_id();
        Self {
            db,
            span,
            node,
            finished: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.span.id
    }

    pub fn start(&self) {}

    pub fn schedule(&self) -> Option<Message> {
        if self.is_finished() {
            return None;
        }
        let node = self.node.as_ref()?;
        Some(self.span.new_remove_message(node))
    }

    pub fn check(&self, from: &NodeId, status: &pb::TableSpanStatus) {
        if Some(from) == self.node.as_ref()
            && matches!(
                status.component_status(),
                ComponentState::Stopped | ComponentState::Absent
            )
        {
            self.finished.store(true, Ordering::Release);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.removed.load(Ordering::Acquire)
    }

    pub fn post_finish(&self) {
        // No-op when the span already left the db through a drain.
        self.db.force_remove(self.span.id);
    }

    pub fn on_node_remove(&self, node: &NodeId) {
        if Some(node) == self.node.as_ref() {
            self.finished.store(true, Ordering::Release);
        }
    }

    pub fn on_task_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}
