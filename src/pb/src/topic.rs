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

//! Message topic keys.
//!
//! The bootstrap topics keep their historical (misspelled) spelling; peers
//! match on the exact string.

pub const MAINTAINER_BOOTSTRAP_REQUEST: &str = "maintainerBoostrapRequest";
pub const MAINTAINER_BOOTSTRAP_RESPONSE: &str = "maintainerBoostrapResponse";
pub const MAINTAINER_MANAGER: &str = "maintainerManager";
pub const COORDINATOR: &str = "coordinator";

/// Topic on which dispatchers of `changefeed_id` send heartbeats to the
/// maintainer.
pub fn heartbeat_request(changefeed_id: &str) -> String {
    format!("heartbeatRequest/{changefeed_id}")
}

/// Topic on which a maintainer pushes responses and commands to the
/// dispatcher manager of `changefeed_id` on one node.
pub fn dispatcher_manager(changefeed_id: &str) -> String {
    format!("dispatcherManager/{changefeed_id}")
}
