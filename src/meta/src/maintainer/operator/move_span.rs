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

/// Relocates a dispatcher: tear it down on the origin node, then recreate it
/// (same identity) on the destination. Finished once the destination reports
/// it working.
pub struct MoveDispatcherOperator {
    db: Arc<ReplicationDb>,
    span: Arc<SpanReplication>,
    origin: NodeId,
    dest: NodeId,
    origin_removed: AtomicBool,
    finished: AtomicBool,
    canceled: AtomicBool,
    removed: AtomicBool,
}

impl MoveDispatcherOperator {
    pub fn new(
        db: Arc<ReplicationDb>,
        span: Arc<SpanReplication>,
        origin: NodeId,
        dest: NodeId,
    ) -> Self {
        Self {
            db,
            span,
            origin,
            dest,
            origin_removed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.span.id
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    pub fn dest(&self) -> &NodeId {
        &self.dest
    }

    pub fn start(&self) {}

    pub fn schedule(&self) -> Option<Message> {
        if self.is_finished() {
            return None;
        }
        if self.origin_removed.load(Ordering::Acquire) {
            Some(self.span.new_create_message(&self.dest))
        } else {
            Some(self.span.new_remove_message(&self.origin))
        }
    }

    pub fn check(&self, from: &NodeId, status: &pb::TableSpanStatus) {
        if !self.origin_removed.load(Ordering::Acquire) {
            if from == &self.origin
                && matches!(
                    status.component_status(),
                    ComponentState::Stopped | ComponentState::Absent
                )
            {
                self.rebind_to_dest();
            }
            return;
        }
        if from == &self.dest && status.component_status() == ComponentState::Working {
            self.finished.store(true, Ordering::Release);
        }
    }

    fn rebind_to_dest(&self) {
        self.db
            .bind_span_to_node(Some(&self.origin), &self.dest, &self.span);
        self.origin_removed.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || self.canceled.load(Ordering::Acquire)
            || self.removed.load(Ordering::Acquire)
    }

    pub fn post_finish(&self) {
        if self.canceled.load(Ordering::Acquire) {
            self.db.mark_span_absent(&self.span);
        } else {
            self.db.mark_span_replicating(&self.span);
        }
    }

    pub fn on_node_remove(&self, node: &NodeId) {
        if node == &self.dest {
            // Nowhere to land; give the span back to the basic scheduler.
            self.canceled.store(true, Ordering::Release);
        } else if node == &self.origin && !self.origin_removed.load(Ordering::Acquire) {
            self.rebind_to_dest();
        }
    }

    pub fn on_task_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}
