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

//! Barrier coordination: cluster-wide DDL events executed in commit-ts
//! order across the influenced dispatchers.

mod event;

use std::collections::HashMap;
use std::sync::Arc;

pub use event::BarrierEvent;
use parking_lot::Mutex;
use spanstream_pb as pb;

use crate::maintainer::operator::OperatorController;
use crate::maintainer::replication::ReplicationDb;
use crate::messaging::Message;
use crate::model::{ChangefeedId, DispatcherId, NodeId, Ts};

/// Tracks every in-flight block event of one changefeed, keyed by its
/// commit ts. Repeated reports coalesce into one event.
pub struct BarrierManager {
    changefeed_id: ChangefeedId,
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    events: Mutex<HashMap<Ts, Arc<BarrierEvent>>>,
}

impl BarrierManager {
    pub fn new(
        changefeed_id: ChangefeedId,
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
    ) -> Self {
        Self {
            changefeed_id,
            db,
            operator_controller,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Folds one dispatcher status into the barrier state. Returns the
    /// messages to push to dispatchers (write action, pass broadcast).
    pub fn handle_status(&self, _from: &NodeId, status: &pb::TableSpanStatus) -> Vec<Message> {
        let Some(dispatcher) = status.id.map(DispatcherId::from_pb) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if let Some(ack) = &status.ack {
            out.extend(self.handle_ack(dispatcher, ack.commit_ts));
        }

        if let Some(state) = &status.state {
            if state.is_blocked {
                let event = {
                    let mut events = self.events.lock();
                    events
                        .entry(state.block_ts)
                        .or_insert_with(|| {
                            tracing::info!(
                                changefeed = %self.changefeed_id,
                                block_ts = state.block_ts,
                                "new block event",
                            );
                            Arc::new(BarrierEvent::new(self.changefeed_id.clone(), state))
                        })
                        .clone()
                };
                event.mark_reported(dispatcher);
                out.extend(event.maybe_advance(&self.db, &self.operator_controller));
            }
        }
        out
    }

    fn handle_ack(&self, dispatcher: DispatcherId, commit_ts: Ts) -> Vec<Message> {
        let event = {
            let events = self.events.lock();
            events.get(&commit_ts).cloned()
        };
        let Some(event) = event else {
            return Vec::new();
        };
        let outcome = event.handle_ack(dispatcher, &self.db);
        if outcome.finished {
            self.events.lock().remove(&commit_ts);
            tracing::info!(
                changefeed = %self.changefeed_id,
                block_ts = commit_ts,
                "block event finished",
            );
        }
        outcome.messages
    }

    /// Periodic pass over all events, re-pushing unacked actions.
    pub fn resend(&self) -> Vec<Message> {
        let events = {
            let events = self.events.lock();
            events.values().cloned().collect::<Vec<_>>()
        };
        let mut out = Vec::new();
        for event in events {
            if event.is_finished() {
                self.events.lock().remove(&event.block_ts);
                continue;
            }
            out.extend(event.resend(&self.db));
        }
        out
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// The changefeed is stopping; pending events are moot.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
