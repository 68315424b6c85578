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

use std::sync::Arc;

use spanstream_pb::common::TableSpan;

use super::SpanScheduler;
use crate::maintainer::operator::{Operator, OperatorController, SplitDispatcherOperator};
use crate::maintainer::replication::{ReplicationDb, SpanReplication};
use crate::maintainer::WatermarkCell;
use crate::model::{span_split_key, ChangefeedId};

/// Splits a span whose dispatcher cannot keep up: when its checkpoint lags
/// the changefeed resolved ts by more than the threshold, the span is cut at
/// its midpoint key and the children take over. Disabled when the threshold
/// is zero.
pub struct SplitScheduler {
    changefeed_id: ChangefeedId,
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    watermark: Arc<WatermarkCell>,
    lag_threshold: u64,
}

impl SplitScheduler {
    pub fn new(
        changefeed_id: ChangefeedId,
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        watermark: Arc<WatermarkCell>,
        lag_threshold: u64,
    ) -> Self {
        Self {
            changefeed_id,
            db,
            operator_controller,
            watermark,
            lag_threshold,
        }
    }

    fn split_spans(parent: &SpanReplication, split_key: Vec<u8>) -> Vec<TableSpan> {
        vec![
            TableSpan {
                table_id: parent.span.table_id,
                start_key: parent.span.start_key.clone(),
                end_key: split_key.clone(),
            },
            TableSpan {
                table_id: parent.span.table_id,
                start_key: split_key,
                end_key: parent.span.end_key.clone(),
            },
        ]
    }
}

impl SpanScheduler for SplitScheduler {
    fn name(&self) -> &'static str {
        "split-scheduler"
    }

    fn schedule(&self, _max_tasks: usize) -> usize {
        if self.lag_threshold == 0 {
            return 0;
        }
        let resolved_ts = self.watermark.resolved_ts();
        if resolved_ts == 0 {
            return 0;
        }

        for parent in self.db.get_replicating() {
            let lag = resolved_ts.saturating_sub(parent.checkpoint_ts());
            if lag <= self.lag_threshold {
                continue;
            }
            if self.operator_controller.get_operator(parent.id).is_some() {
                continue;
            }
            let Some(split_key) = span_split_key(&parent.span) else {
                continue;
            };
            let Some(node) = parent.node_id() else {
                continue;
            };
            let children = Self::split_spans(&parent, split_key)
                .into_iter()
                .map(|span| {
                    Arc::new(SpanReplication::new(
                        self.changefeed_id.clone(),
                        parent.schema_id(),
                        span,
                        parent.checkpoint_ts(),
                    ))
                })
                .collect::<Vec<_>>();
            tracing::info!(
                changefeed = %self.changefeed_id,
                dispatcher = %parent.id,
                lag,
                "splitting lagging span",
            );
            if self.operator_controller.add_operator(Operator::Split(
                SplitDispatcherOperator::new(self.db.clone(), parent, children, node),
            )) {
                // One split in flight at a time keeps the disruption small.
                return 1;
            }
        }
        0
    }
}
