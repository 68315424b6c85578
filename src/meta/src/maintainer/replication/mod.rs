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

mod db;

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};

pub use db::ReplicationDb;
use parking_lot::RwLock;
use spanstream_pb as pb;
use spanstream_pb::common::{ComponentState, TableSpan};

use crate::messaging::{Message, Payload};
use crate::model::{ChangefeedId, DispatcherId, NodeId, SchemaId, Ts};

/// One table span of a changefeed and everything the control plane knows
/// about its dispatcher.
///
/// Identity and span are immutable; the bound node, schema id and observed
/// status change over the span's lifetime. Scheduling state (absent /
/// scheduling / working) lives in [`ReplicationDb`], which is the only
/// writer of the mutable fields here.
pub struct SpanReplication {
    pub id: DispatcherId,
    pub changefeed_id: ChangefeedId,
    pub span: TableSpan,

    schema_id: AtomicI64,
    node: RwLock<Option<NodeId>>,
    component: AtomicI32,
    checkpoint_ts: AtomicU64,
    /// Assigned at bind time; orders spans by how long they have been on
    /// their current node.
    bind_seq: AtomicU64,
}

impl SpanReplication {
    pub fn new(
        changefeed_id: ChangefeedId,
        schema_id: SchemaId,
        span: TableSpan,
        start_ts: Ts,
    ) -> Self {
        Self::with_id(DispatcherId::new(), changefeed_id, schema_id, span, start_ts)
    }

    /// Used when the dispatcher already exists remotely (bootstrap, splits).
    pub fn with_id(
        id: DispatcherId,
        changefeed_id: ChangefeedId,
        schema_id: SchemaId,
        span: TableSpan,
        start_ts: Ts,
    ) -> Self {
        Self {
            id,
            changefeed_id,
            span,
            schema_id: AtomicI64::new(schema_id),
            node: RwLock::new(None),
            component: AtomicI32::new(ComponentState::Unknown as i32),
            checkpoint_ts: AtomicU64::new(start_ts),
            bind_seq: AtomicU64::new(0),
        }
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id.load(Ordering::Acquire)
    }

    pub(super) fn set_schema_id(&self, schema_id: SchemaId) {
        self.schema_id.store(schema_id, Ordering::Release);
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node.read().clone()
    }

    pub(super) fn set_node(&self, node: Option<NodeId>) {
        *self.node.write() = node;
    }

    pub fn component_state(&self) -> ComponentState {
        ComponentState::try_from(self.component.load(Ordering::Acquire))
            .unwrap_or(ComponentState::Unknown)
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.checkpoint_ts.load(Ordering::Acquire)
    }

    pub fn bind_seq(&self) -> u64 {
        self.bind_seq.load(Ordering::Acquire)
    }

    pub(super) fn set_bind_seq(&self, seq: u64) {
        self.bind_seq.store(seq, Ordering::Release);
    }

    /// Folds a dispatcher report into the span. A regressing checkpoint is a
    /// duplicate or reordered report and is ignored.
    pub fn update_status(&self, status: &pb::TableSpanStatus) {
        self.component
            .store(status.component_status, Ordering::Release);
        if status.checkpoint_ts > 0 {
            self.checkpoint_ts
                .fetch_max(status.checkpoint_ts, Ordering::AcqRel);
        }
    }

    /// Command creating this dispatcher on `node`, starting from the span's
    /// current checkpoint.
    pub fn new_create_message(&self, node: &NodeId) -> Message {
        self.new_schedule_message(node, pb::ScheduleAction::Create)
    }

    /// Command tearing this dispatcher down on `node`.
    pub fn new_remove_message(&self, node: &NodeId) -> Message {
        self.new_schedule_message(node, pb::ScheduleAction::Remove)
    }

    fn new_schedule_message(&self, node: &NodeId, action: pb::ScheduleAction) -> Message {
        Message::new(
            NodeId::default(),
            node.clone(),
            pb::topic::dispatcher_manager(self.changefeed_id.as_str()),
            Payload::ScheduleDispatcherRequest(pb::ScheduleDispatcherRequest {
                changefeed_id: self.changefeed_id.to_string(),
                config: Some(pb::DispatcherConfig {
                    span: Some(self.span.clone()),
                    start_ts: self.checkpoint_ts(),
                    dispatcher_id: Some(self.id.to_pb()),
                    schema_id: self.schema_id(),
                }),
                schedule_action: action as i32,
            }),
        )
    }
}

impl std::fmt::Debug for SpanReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanReplication")
            .field("id", &self.id)
            .field("table_id", &self.span.table_id)
            .field("schema_id", &self.schema_id())
            .field("node", &self.node_id())
            .field("component", &self.component_state())
            .field("checkpoint_ts", &self.checkpoint_ts())
            .finish()
    }
}
