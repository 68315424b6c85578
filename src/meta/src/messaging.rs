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

//! Narrow seam between the control plane and the message transport.
//!
//! The transport itself (streams, reconnection with backoff, handshakes) is
//! external; the core only needs typed envelopes, non-blocking sends that
//! surface congestion, and epoch filtering on delivery. [`MessageCenter`] is
//! the in-process implementation backing both local routing and tests.

use std::collections::HashMap;

use parking_lot::RwLock;
use spanstream_pb as pb;
use tokio::sync::mpsc;

use crate::model::NodeId;
use crate::{MetaError, MetaResult};

/// Decoded payload of one message.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    HeartBeatRequest(pb::HeartBeatRequest),
    HeartBeatResponse(pb::HeartBeatResponse),
    ScheduleDispatcherRequest(pb::ScheduleDispatcherRequest),
    MaintainerBootstrapRequest(pb::MaintainerBootstrapRequest),
    MaintainerBootstrapResponse(pb::MaintainerBootstrapResponse),
    MaintainerHeartbeat(pb::MaintainerHeartbeat),
    AddMaintainerRequest(pb::AddMaintainerRequest),
    RemoveMaintainerRequest(pb::RemoveMaintainerRequest),
    CoordinatorBootstrapRequest(pb::CoordinatorBootstrapRequest),
    CoordinatorBootstrapResponse(pb::CoordinatorBootstrapResponse),
}

/// A typed envelope addressed to one node.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    pub topic: String,
    pub epoch: u64,
    pub payload: Payload,
}

impl Message {
    pub fn new(from: NodeId, to: NodeId, topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            from,
            to,
            topic: topic.into(),
            epoch: 0,
            payload,
        }
    }
}

/// Outbound side of the transport. Sends never block: a full queue surfaces
/// as a congestion error and the caller retries on its next tick.
pub trait MessageSender: Send + Sync {
    /// Control-plane commands. Dropped with an error when congested.
    fn send_command(&self, msg: Message) -> MetaResult<()>;

    /// Data-path events. Same congestion contract as commands.
    fn send_event(&self, msg: Message) -> MetaResult<()>;
}

struct TargetQueue {
    epoch: u64,
    tx: mpsc::Sender<Message>,
}

struct MessageCenterCore {
    targets: HashMap<NodeId, TargetQueue>,
    dropped: u64,
}

/// In-process message router: one bounded queue per known peer, stamped with
/// the local epoch on send and filtered by the peer's recorded epoch on
/// delivery registration.
pub struct MessageCenter {
    node_id: NodeId,
    epoch: u64,
    queue_size: usize,
    core: RwLock<MessageCenterCore>,
}

impl MessageCenter {
    pub fn new(node_id: NodeId, epoch: u64, queue_size: usize) -> Self {
        Self {
            node_id,
            epoch,
            queue_size,
            core: RwLock::new(MessageCenterCore {
                targets: HashMap::new(),
                dropped: 0,
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Registers a peer and returns the receiving end of its queue. A peer
    /// re-registering with a higher epoch replaces its old queue; a lower
    /// epoch is stale and rejected.
    pub fn add_target(&self, node: NodeId, epoch: u64) -> MetaResult<mpsc::Receiver<Message>> {
        let mut core = self.core.write();
        if let Some(existing) = core.targets.get(&node) {
            if existing.epoch > epoch {
                return Err(MetaError::connection_failed(
                    node,
                    format!("stale epoch {epoch}, current {}", existing.epoch),
                ));
            }
        }
        let (tx, rx) = mpsc::channel(self.queue_size);
        tracing::info!(node = %node, epoch, "message target registered");
        core.targets.insert(node, TargetQueue { epoch, tx });
        Ok(rx)
    }

    pub fn remove_target(&self, node: &NodeId) {
        if self.core.write().targets.remove(node).is_some() {
            tracing::info!(node = %node, "message target removed");
        }
    }

    /// Messages dropped at the send site so far.
    pub fn dropped_count(&self) -> u64 {
        self.core.read().dropped
    }

    fn send(&self, mut msg: Message) -> MetaResult<()> {
        msg.from = self.node_id.clone();
        msg.epoch = self.epoch;
        let core = self.core.read();
        let Some(target) = core.targets.get(&msg.to) else {
            return Err(MetaError::connection_not_found(msg.to));
        };
        if msg.epoch < target.epoch {
            // A peer restarted with a newer epoch than ours; the message
            // would be discarded on arrival, so drop it here.
            tracing::warn!(
                to = %msg.to,
                msg_epoch = msg.epoch,
                target_epoch = target.epoch,
                "dropping message with stale epoch",
            );
            return Ok(());
        }
        match target.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                drop(core);
                self.core.write().dropped += 1;
                tracing::warn!(to = %msg.to, topic = %msg.topic, "send queue congested");
                Err(MetaError::message_congested(msg.to))
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                Err(MetaError::connection_not_found(msg.to))
            }
        }
    }
}

impl MessageSender for MessageCenter {
    fn send_command(&self, msg: Message) -> MetaResult<()> {
        self.send(msg)
    }

    fn send_event(&self, msg: Message) -> MetaResult<()> {
        self.send(msg)
    }
}
