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

//! Operators: in-flight reconfigurations of a single span.
//!
//! An operator exclusively owns its target dispatcher id for its lifetime,
//! emits at most one scheduling message per tick, and is finished once the
//! observed dispatcher status matches its goal. `post_finish` runs exactly
//! once, on finish; a displaced operator gets `on_task_removed` instead.

mod add;
mod controller;
mod move_span;
mod remove;
mod split;

pub use add::AddDispatcherOperator;
pub use controller::OperatorController;
pub use move_span::MoveDispatcherOperator;
pub use remove::RemoveDispatcherOperator;
pub use split::SplitDispatcherOperator;

use spanstream_pb as pb;

use crate::messaging::Message;
use crate::model::{DispatcherId, NodeId};

/// The four span transitions, dispatched as a tagged variant.
pub enum Operator {
    Add(AddDispatcherOperator),
    Remove(RemoveDispatcherOperator),
    Move(MoveDispatcherOperator),
    Split(SplitDispatcherOperator),
}

impl Operator {
    /// The dispatcher this operator exclusively owns.
    pub fn id(&self) -> DispatcherId {
        match self {
            Operator::Add(op) => op.id(),
            Operator::Remove(op) => op.id(),
            Operator::Move(op) => op.id(),
            Operator::Split(op) => op.id(),
        }
    }

    /// Called once when the operator is installed.
    pub fn start(&self) {
        match self {
            Operator::Add(op) => op.start(),
            Operator::Remove(op) => op.start(),
            Operator::Move(op) => op.start(),
            Operator::Split(op) => op.start(),
        }
    }

    /// Produces the outbound message for this tick, if any.
    pub fn schedule(&self) -> Option<Message> {
        match self {
            Operator::Add(op) => op.schedule(),
            Operator::Remove(op) => op.schedule(),
            Operator::Move(op) => op.schedule(),
            Operator::Split(op) => op.schedule(),
        }
    }

    /// Folds in a status report for the owned dispatcher.
    pub fn check(&self, from: &NodeId, status: &pb::TableSpanStatus) {
        match self {
            Operator::Add(op) => op.check(from, status),
            Operator::Remove(op) => op.check(from, status),
            Operator::Move(op) => op.check(from, status),
            Operator::Split(op) => op.check(from, status),
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Operator::Add(op) => op.is_finished(),
            Operator::Remove(op) => op.is_finished(),
            Operator::Move(op) => op.is_finished(),
            Operator::Split(op) => op.is_finished(),
        }
    }

    /// Runs the final state transition. Called exactly once, by the
    /// controller, when the operator leaves the map through `is_finished`.
    pub fn post_finish(&self) {
        match self {
            Operator::Add(op) => op.post_finish(),
            Operator::Remove(op) => op.post_finish(),
            Operator::Move(op) => op.post_finish(),
            Operator::Split(op) => op.post_finish(),
        }
    }

    pub fn on_node_remove(&self, node: &NodeId) {
        match self {
            Operator::Add(op) => op.on_node_remove(node),
            Operator::Remove(op) => op.on_node_remove(node),
            Operator::Move(op) => op.on_node_remove(node),
            Operator::Split(op) => op.on_node_remove(node),
        }
    }

    /// The operator was displaced by a remove operator; `post_finish` will
    /// never run.
    pub fn on_task_removed(&self) {
        match self {
            Operator::Add(op) => op.on_task_removed(),
            Operator::Remove(op) => op.on_task_removed(),
            Operator::Move(op) => op.on_task_removed(),
            Operator::Split(op) => op.on_task_removed(),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Add(op) => write!(f, "add dispatcher {} to {}", op.id(), op.dest()),
            Operator::Remove(op) => write!(f, "remove dispatcher {}", op.id()),
            Operator::Move(op) => write!(
                f,
                "move dispatcher {} from {} to {}",
                op.id(),
                op.origin(),
                op.dest()
            ),
            Operator::Split(op) => {
                write!(f, "split dispatcher {} into {} spans", op.id(), op.children())
            }
        }
    }
}
