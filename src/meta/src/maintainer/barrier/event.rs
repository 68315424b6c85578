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
use spanstream_pb as pb;
use spanstream_pb::common::ComponentState;
use spanstream_pb::InfluenceType;
use tokio::time::Instant;

use crate::maintainer::operator::OperatorController;
use crate::maintainer::replication::{ReplicationDb, SpanReplication};
use crate::messaging::{Message, Payload};
use crate::model::{span_for_table, ChangefeedId, DispatcherId, NodeId, Ts};

/// Unacked actions are re-pushed at this cadence.
const RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// One cluster-wide DDL barrier at a commit timestamp, driven through two
/// phases: gather every influenced dispatcher's block report, then let one
/// *writer* dispatcher execute the event and *pass* everyone else over it.
pub struct BarrierEvent {
    pub changefeed_id: ChangefeedId,
    pub block_ts: Ts,
    inner: Mutex<EventInner>,
}

struct EventInner {
    block_tables: Option<pb::InfluencedTables>,
    need_dropped_tables: Option<pb::InfluencedTables>,
    need_added_tables: Vec<pb::Table>,
    updated_schemas: Vec<pb::SchemaIdChange>,

    /// Dispatchers that reported blocked at this ts.
    reported: Vec<DispatcherId>,
    /// Structural changes were applied to the replication db.
    scheduled: bool,
    /// Phase 1 done: the writer is chosen.
    selected: bool,
    writer: Option<DispatcherId>,
    /// The writer acked its write action.
    writer_advanced: bool,
    /// Passers that still owe an ack. Frozen when the pass is first sent.
    pending_acks: Option<Vec<DispatcherId>>,
    last_resend: Option<Instant>,
}

impl BarrierEvent {
    pub fn new(changefeed_id: ChangefeedId, state: &pb::State) -> Self {
        Self {
            changefeed_id,
            block_ts: state.block_ts,
            inner: Mutex::new(EventInner {
                block_tables: state.block_tables.clone(),
                need_dropped_tables: state.need_dropped_tables.clone(),
                need_added_tables: state.need_added_tables.clone(),
                updated_schemas: state.updated_schemas.clone(),
                reported: Vec::new(),
                scheduled: false,
                selected: false,
                writer: None,
                writer_advanced: false,
                pending_acks: None,
                last_resend: None,
            }),
        }
    }

    /// Folds in a repeated report for the same ts. The first report defines
    /// the event; later ones only extend the reporter set.
    pub fn mark_reported(&self, dispatcher: DispatcherId) {
        let mut inner = self.inner.lock();
        if !inner.reported.contains(&dispatcher) {
            inner.reported.push(dispatcher);
        }
    }

    pub fn is_selected(&self) -> bool {
        self.inner.lock().selected
    }

    pub fn writer(&self) -> Option<DispatcherId> {
        self.inner.lock().writer
    }

    /// Dispatchers this event blocks, resolved against the current db.
    fn influenced_spans(
        influence: Option<&pb::InfluencedTables>,
        db: &ReplicationDb,
    ) -> Vec<Arc<SpanReplication>> {
        let Some(influence) = influence else {
            return Vec::new();
        };
        match influence.influence_type() {
            InfluenceType::All => db.get_all_tasks(),
            InfluenceType::Db => db.get_tasks_by_schema_id(influence.schema_id),
            InfluenceType::Normal => db.get_tasks_by_table_ids(&influence.table_ids),
        }
    }

    /// Phase 1 completion check plus phase 2 entry. Returns the write
    /// action to send, if the event just got (or already was) selected with
    /// an unacked writer.
    pub fn maybe_advance(
        &self,
        db: &ReplicationDb,
        operator_controller: &OperatorController,
    ) -> Vec<Message> {
        let mut inner = self.inner.lock();
        if inner.selected {
            return Vec::new();
        }
        let influenced = Self::influenced_spans(inner.block_tables.as_ref(), db);
        if influenced.is_empty() {
            return Vec::new();
        }
        let all_reported = influenced
            .iter()
            .all(|span| inner.reported.contains(&span.id));
        if !all_reported {
            return Vec::new();
        }

        // Structural changes land before any write action goes out.
        self.schedule_block_event_locked(&mut inner, db, operator_controller);

        // Deterministic writer: the smallest working dispatcher id among the
        // influenced set. With none working yet, selection retries on the
        // next report.
        let writer = influenced
            .iter()
            .filter(|span| span.component_state() == ComponentState::Working)
            .map(|span| span.id)
            .min();
        let Some(writer) = writer else {
            return Vec::new();
        };
        inner.writer = Some(writer);
        inner.selected = true;
        inner.last_resend = Some(Instant::now());
        tracing::info!(
            changefeed = %self.changefeed_id,
            block_ts = self.block_ts,
            writer = %writer,
            "barrier selected writer",
        );
        self.write_action_messages(&inner, db)
    }

    /// Applies the event's structural side effects exactly once: drops
    /// first, then added tables, then schema reindexing.
    pub fn schedule_block_event(
        &self,
        db: &ReplicationDb,
        operator_controller: &OperatorController,
    ) {
        let mut inner = self.inner.lock();
        self.schedule_block_event_locked(&mut inner, db, operator_controller);
    }

    fn schedule_block_event_locked(
        &self,
        inner: &mut EventInner,
        db: &ReplicationDb,
        operator_controller: &OperatorController,
    ) {
        if inner.scheduled {
            return;
        }
        inner.scheduled = true;

        if let Some(dropped) = &inner.need_dropped_tables {
            match dropped.influence_type() {
                InfluenceType::All => operator_controller.remove_all_tasks(),
                InfluenceType::Db => {
                    operator_controller.remove_tasks_by_schema_id(dropped.schema_id)
                }
                InfluenceType::Normal => {
                    operator_controller.remove_tasks_by_table_ids(&dropped.table_ids)
                }
            }
        }
        for table in &inner.need_added_tables {
            db.add_absent_replica_set(Arc::new(SpanReplication::new(
                self.changefeed_id.clone(),
                table.schema_id,
                span_for_table(table.table_id),
                self.block_ts,
            )));
        }
        for change in &inner.updated_schemas {
            db.update_schema_id(change.table_id, change.new_schema_id);
        }
    }

    /// The dispatcher acked the action at this ts. Returns the pass
    /// broadcast when the writer just advanced, and reports completion.
    pub fn handle_ack(&self, dispatcher: DispatcherId, db: &ReplicationDb) -> AckOutcome {
        let mut inner = self.inner.lock();
        if Some(dispatcher) == inner.writer && !inner.writer_advanced {
            inner.writer_advanced = true;
            let msgs = self.pass_action_messages(&mut inner, db);
            inner.last_resend = Some(Instant::now());
            return AckOutcome {
                messages: msgs,
                finished: inner.pending_acks.as_ref().is_some_and(|acks| acks.is_empty()),
            };
        }
        if let Some(pending) = &mut inner.pending_acks {
            pending.retain(|id| *id != dispatcher);
        }
        AckOutcome {
            messages: Vec::new(),
            finished: inner.writer_advanced
                && inner.pending_acks.as_ref().is_some_and(|acks| acks.is_empty()),
        }
    }

    /// Periodic resend of whichever action is still unacked.
    pub fn resend(&self, db: &ReplicationDb) -> Vec<Message> {
        let mut inner = self.inner.lock();
        if !inner.selected {
            return Vec::new();
        }
        if let Some(last) = inner.last_resend {
            if last.elapsed() < RESEND_INTERVAL {
                return Vec::new();
            }
        }
        inner.last_resend = Some(Instant::now());
        if inner.writer_advanced {
            self.pass_action_messages(&mut inner, db)
        } else {
            self.write_action_messages(&inner, db)
        }
    }

    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.writer_advanced && inner.pending_acks.as_ref().is_some_and(|acks| acks.is_empty())
    }

    fn write_action_messages(&self, inner: &EventInner, db: &ReplicationDb) -> Vec<Message> {
        let Some(writer) = inner.writer else {
            return Vec::new();
        };
        let Some(span) = db.get_task_by_id(writer) else {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                block_ts = self.block_ts,
                writer = %writer,
                "writer span left the db before the write action",
            );
            return Vec::new();
        };
        let Some(node) = span.node_id() else {
            return Vec::new();
        };
        vec![self.new_response(
            node,
            pb::DispatcherStatus {
                influenced_dispatchers: Some(pb::InfluencedDispatchers {
                    influence_type: InfluenceType::Normal as i32,
                    dispatcher_ids: vec![writer.to_pb()],
                    schema_id: 0,
                    exclude_dispatcher_id: None,
                }),
                action: Some(pb::DispatcherAction {
                    action: pb::Action::Write as i32,
                    commit_ts: self.block_ts,
                }),
                ack: None,
            },
        )]
    }

    /// One pass message per involved node, reusing the original influence
    /// type instead of enumerating dispatchers where possible.
    fn pass_action_messages(&self, inner: &mut EventInner, db: &ReplicationDb) -> Vec<Message> {
        let influenced = Self::influenced_spans(inner.block_tables.as_ref(), db);
        let passers = influenced
            .iter()
            .filter(|span| Some(span.id) != inner.writer && span.node_id().is_some())
            .collect_vec();
        if inner.pending_acks.is_none() {
            inner.pending_acks = Some(passers.iter().map(|span| span.id).collect());
        }

        let influence_type = inner
            .block_tables
            .as_ref()
            .map(|tables| tables.influence_type())
            .unwrap_or(InfluenceType::Normal);
        let action = pb::DispatcherAction {
            action: pb::Action::Pass as i32,
            commit_ts: self.block_ts,
        };

        let mut by_node: HashMap<NodeId, Vec<DispatcherId>> = HashMap::new();
        for span in &passers {
            let node = span.node_id().expect("passers are bound");
            by_node.entry(node).or_default().push(span.id);
        }

        by_node
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(node, dispatchers)| {
                let influenced_dispatchers = match influence_type {
                    InfluenceType::All => pb::InfluencedDispatchers {
                        influence_type: InfluenceType::All as i32,
                        dispatcher_ids: vec![],
                        schema_id: 0,
                        exclude_dispatcher_id: inner.writer.map(DispatcherId::to_pb),
                    },
                    InfluenceType::Db => pb::InfluencedDispatchers {
                        influence_type: InfluenceType::Db as i32,
                        dispatcher_ids: vec![],
                        schema_id: inner
                            .block_tables
                            .as_ref()
                            .map(|tables| tables.schema_id)
                            .unwrap_or_default(),
                        exclude_dispatcher_id: inner.writer.map(DispatcherId::to_pb),
                    },
                    InfluenceType::Normal => pb::InfluencedDispatchers {
                        influence_type: InfluenceType::Normal as i32,
                        dispatcher_ids: dispatchers.iter().map(|id| id.to_pb()).collect(),
                        schema_id: 0,
                        exclude_dispatcher_id: None,
                    },
                };
                self.new_response(
                    node,
                    pb::DispatcherStatus {
                        influenced_dispatchers: Some(influenced_dispatchers),
                        action: Some(action),
                        ack: None,
                    },
                )
            })
            .collect()
    }

    fn new_response(&self, node: NodeId, status: pb::DispatcherStatus) -> Message {
        Message::new(
            NodeId::default(),
            node,
            pb::topic::dispatcher_manager(self.changefeed_id.as_str()),
            Payload::HeartBeatResponse(pb::HeartBeatResponse {
                changefeed_id: self.changefeed_id.to_string(),
                dispatcher_statuses: vec![status],
            }),
        )
    }

    #[cfg(test)]
    pub(crate) fn force_phase(
        &self,
        selected: bool,
        writer: Option<DispatcherId>,
        writer_advanced: bool,
        last_resend: Option<Instant>,
    ) {
        let mut inner = self.inner.lock();
        inner.selected = selected;
        inner.writer = writer;
        inner.writer_advanced = writer_advanced;
        inner.last_resend = last_resend;
    }
}

/// Result of folding an ack into an event.
pub struct AckOutcome {
    pub messages: Vec<Message>,
    pub finished: bool,
}
