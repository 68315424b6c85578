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
use std::time::Duration;

use spanstream_pb as pb;
use tokio::time::Instant;

use crate::messaging::{Message, Payload};
use crate::model::{ChangefeedId, NodeId};

const REQUEST_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Tracks which nodes have answered the maintainer's bootstrap request.
/// Scheduling is admitted only once every registered node responded, so the
/// maintainer never double-creates dispatchers it just has not heard about.
pub struct Bootstrapper {
    changefeed_id: ChangefeedId,
    checkpoint_ts: u64,
    responded: HashMap<NodeId, bool>,
    last_request: Option<Instant>,
}

impl Bootstrapper {
    pub fn new(changefeed_id: ChangefeedId, checkpoint_ts: u64) -> Self {
        Self {
            changefeed_id,
            checkpoint_ts,
            responded: HashMap::new(),
            last_request: None,
        }
    }

    /// Registers a node; returns the request to send when it is new.
    pub fn add_node(&mut self, node: NodeId) -> Option<Message> {
        if self.responded.contains_key(&node) {
            return None;
        }
        self.responded.insert(node.clone(), false);
        Some(self.new_request(node))
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        self.responded.remove(node);
    }

    /// Marks a response; returns whether this response was still awaited.
    pub fn mark_responded(&mut self, node: &NodeId) -> bool {
        match self.responded.get_mut(node) {
            Some(responded) if !*responded => {
                *responded = true;
                true
            }
            _ => false,
        }
    }

    pub fn all_initialized(&self) -> bool {
        self.responded.values().all(|responded| *responded)
    }

    /// Requests to re-push to nodes that have not answered yet.
    pub fn pending_requests(&mut self) -> Vec<Message> {
        if self.all_initialized() {
            return Vec::new();
        }
        if let Some(last) = self.last_request {
            if last.elapsed() < REQUEST_RESEND_INTERVAL {
                return Vec::new();
            }
        }
        self.last_request = Some(Instant::now());
        self.responded
            .iter()
            .filter(|(_, responded)| !**responded)
            .map(|(node, _)| node.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .map(|node| self.new_request(node))
            .collect()
    }

    fn new_request(&self, node: NodeId) -> Message {
        Message::new(
            NodeId::default(),
            node,
            pb::topic::MAINTAINER_BOOTSTRAP_REQUEST,
            Payload::MaintainerBootstrapRequest(pb::MaintainerBootstrapRequest {
                changefeed_id: self.changefeed_id.to_string(),
                config: Vec::new(),
                checkpoint_ts: self.checkpoint_ts,
            }),
        )
    }
}
