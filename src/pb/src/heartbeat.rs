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

//! Messages exchanged between maintainers, dispatchers and the coordinator.

use crate::common::{ComponentState, DispatcherId, TableSpan, Watermark};

/// How a barrier or a structural change addresses its audience.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum InfluenceType {
    All = 0,
    Db = 1,
    Normal = 2,
}

/// Barrier action pushed to a dispatcher.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum Action {
    Write = 0,
    Pass = 1,
}

/// Dispatcher lifecycle command.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ScheduleAction {
    Create = 0,
    Remove = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Table {
    #[prost(int64, tag = "1")]
    pub table_id: i64,
    #[prost(int64, tag = "2")]
    pub schema_id: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct SchemaIdChange {
    #[prost(int64, tag = "1")]
    pub table_id: i64,
    #[prost(int64, tag = "2")]
    pub old_schema_id: i64,
    #[prost(int64, tag = "3")]
    pub new_schema_id: i64,
}

/// Table-level audience of a block event, reported by a dispatcher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfluencedTables {
    #[prost(enumeration = "InfluenceType", tag = "1")]
    pub influence_type: i32,
    #[prost(int64, repeated, tag = "2")]
    pub table_ids: Vec<i64>,
    #[prost(int64, tag = "3")]
    pub schema_id: i64,
}

/// Dispatcher-level audience of a control action, sent by the maintainer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfluencedDispatchers {
    #[prost(enumeration = "InfluenceType", tag = "1")]
    pub influence_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub dispatcher_ids: Vec<DispatcherId>,
    #[prost(int64, tag = "3")]
    pub schema_id: i64,
    #[prost(message, optional, tag = "4")]
    pub exclude_dispatcher_id: Option<DispatcherId>,
}

/// Block payload of a `TableSpanStatus`: the dispatcher reached a barrier at
/// `block_ts` and waits for the control plane to resolve it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct State {
    #[prost(bool, tag = "1")]
    pub is_blocked: bool,
    #[prost(uint64, tag = "2")]
    pub block_ts: u64,
    #[prost(message, optional, tag = "3")]
    pub block_tables: Option<InfluencedTables>,
    #[prost(message, optional, tag = "4")]
    pub need_dropped_tables: Option<InfluencedTables>,
    #[prost(message, repeated, tag = "5")]
    pub need_added_tables: Vec<Table>,
    #[prost(message, repeated, tag = "6")]
    pub updated_schemas: Vec<SchemaIdChange>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Ack {
    #[prost(uint64, tag = "1")]
    pub commit_ts: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct DispatcherAction {
    #[prost(enumeration = "Action", tag = "1")]
    pub action: i32,
    #[prost(uint64, tag = "2")]
    pub commit_ts: u64,
}

/// Per-dispatcher status report, carried on heartbeats.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableSpanStatus {
    #[prost(message, optional, tag = "1")]
    pub id: Option<DispatcherId>,
    #[prost(enumeration = "ComponentState", tag = "2")]
    pub component_status: i32,
    #[prost(message, optional, tag = "3")]
    pub state: Option<State>,
    #[prost(uint64, tag = "4")]
    pub checkpoint_ts: u64,
    /// Acknowledges the last barrier action executed by this dispatcher.
    #[prost(message, optional, tag = "5")]
    pub ack: Option<Ack>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunningError {
    #[prost(string, tag = "1")]
    pub node: String,
    #[prost(string, tag = "2")]
    pub code: String,
    #[prost(string, tag = "3")]
    pub message: String,
}

/// Dispatcher → maintainer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartBeatRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(message, optional, tag = "2")]
    pub watermark: Option<Watermark>,
    #[prost(message, repeated, tag = "3")]
    pub statuses: Vec<TableSpanStatus>,
    #[prost(bool, tag = "4")]
    pub complete_status: bool,
    #[prost(message, optional, tag = "5")]
    pub warning: Option<RunningError>,
    #[prost(message, optional, tag = "6")]
    pub err: Option<RunningError>,
}

/// A control action addressed at one or more dispatchers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatcherStatus {
    #[prost(message, optional, tag = "1")]
    pub influenced_dispatchers: Option<InfluencedDispatchers>,
    #[prost(message, optional, tag = "2")]
    pub action: Option<DispatcherAction>,
    #[prost(message, optional, tag = "3")]
    pub ack: Option<Ack>,
}

/// Maintainer → dispatcher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartBeatResponse {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(message, repeated, tag = "2")]
    pub dispatcher_statuses: Vec<DispatcherStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatcherConfig {
    #[prost(message, optional, tag = "1")]
    pub span: Option<TableSpan>,
    #[prost(uint64, tag = "2")]
    pub start_ts: u64,
    #[prost(message, optional, tag = "3")]
    pub dispatcher_id: Option<DispatcherId>,
    #[prost(int64, tag = "4")]
    pub schema_id: i64,
}

/// Maintainer → dispatcher manager: create or tear down one dispatcher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleDispatcherRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(message, optional, tag = "2")]
    pub config: Option<DispatcherConfig>,
    #[prost(enumeration = "ScheduleAction", tag = "3")]
    pub schedule_action: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerBootstrapRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub config: Vec<u8>,
    /// The changefeed checkpoint the maintainer starts from.
    #[prost(uint64, tag = "3")]
    pub checkpoint_ts: u64,
}

/// One working dispatcher reported back during bootstrap.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BootstrapTableSpan {
    #[prost(message, optional, tag = "1")]
    pub span: Option<TableSpan>,
    #[prost(int64, tag = "2")]
    pub schema_id: i64,
    #[prost(enumeration = "ComponentState", tag = "3")]
    pub component_status: i32,
    #[prost(uint64, tag = "4")]
    pub checkpoint_ts: u64,
    #[prost(message, optional, tag = "5")]
    pub dispatcher_id: Option<DispatcherId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerBootstrapResponse {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(message, repeated, tag = "2")]
    pub spans: Vec<BootstrapTableSpan>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerStatus {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(string, tag = "2")]
    pub feed_state: String,
    #[prost(enumeration = "ComponentState", tag = "3")]
    pub state: i32,
    #[prost(uint64, tag = "4")]
    pub checkpoint_ts: u64,
    #[prost(message, repeated, tag = "5")]
    pub err: Vec<RunningError>,
}

/// Node → coordinator: statuses of every maintainer hosted on the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerHeartbeat {
    #[prost(message, repeated, tag = "1")]
    pub statuses: Vec<MaintainerStatus>,
}

/// Coordinator → node: launch a maintainer for the changefeed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddMaintainerRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub config: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub checkpoint_ts: u64,
}

/// Coordinator → node: stop a maintainer. `cascade` also tears down every
/// dispatcher of the changefeed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveMaintainerRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: String,
    #[prost(bool, tag = "2")]
    pub cascade: bool,
}

/// Coordinator → node, on coordinator start or node join: report every
/// maintainer the node currently hosts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinatorBootstrapRequest {
    #[prost(uint64, tag = "1")]
    pub version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinatorBootstrapResponse {
    #[prost(message, repeated, tag = "1")]
    pub statuses: Vec<MaintainerStatus>,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn heartbeat_request_round_trip() {
        let req = HeartBeatRequest {
            changefeed_id: "cf".into(),
            watermark: Some(Watermark {
                checkpoint_ts: 100,
                resolved_ts: 120,
            }),
            statuses: vec![TableSpanStatus {
                id: Some(DispatcherId { high: 1, low: 2 }),
                component_status: ComponentState::Working as i32,
                state: None,
                checkpoint_ts: 99,
                ack: None,
            }],
            complete_status: true,
            warning: None,
            err: None,
        };
        let buf = req.encode_to_vec();
        assert_eq!(HeartBeatRequest::decode(buf.as_slice()).unwrap(), req);
    }

    #[test]
    fn block_state_round_trip() {
        let state = State {
            is_blocked: true,
            block_ts: 10,
            block_tables: Some(InfluencedTables {
                influence_type: InfluenceType::Db as i32,
                table_ids: vec![],
                schema_id: 1,
            }),
            need_dropped_tables: None,
            need_added_tables: vec![Table {
                table_id: 4,
                schema_id: 1,
            }],
            updated_schemas: vec![SchemaIdChange {
                table_id: 1,
                old_schema_id: 1,
                new_schema_id: 2,
            }],
        };
        let buf = state.encode_to_vec();
        let decoded = State::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(
            decoded.block_tables.unwrap().influence_type(),
            InfluenceType::Db
        );
    }
}
