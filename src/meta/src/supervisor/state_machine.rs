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

use std::fmt;

use spanstream_pb::common::ComponentState;

use crate::model::NodeId;

/// Scheduling state of one inferior, driven by observed heartbeats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerStatus {
    Absent,
    Commit,
    Working,
    Removing,
}

/// Per-inferior state machine.
///
/// The transitions: `Absent → Commit` on assignment, `Commit → Working` once
/// the capture reports the inferior working, `→ Removing` on removal, and
/// gone after the capture confirms the stop. A move is a removal with a
/// queued destination.
#[derive(Debug)]
pub struct StateMachine<I> {
    pub id: I,
    pub state: SchedulerStatus,
    /// The capture the inferior runs (or is being placed) on.
    pub primary: Option<NodeId>,
    /// Destination of an in-flight move, applied once the removal lands.
    pending_dest: Option<NodeId>,
    removed: bool,
}

impl<I: Clone + fmt::Display> StateMachine<I> {
    pub fn new(id: I) -> Self {
        Self {
            id,
            state: SchedulerStatus::Absent,
            primary: None,
            pending_dest: None,
            removed: false,
        }
    }

    /// Seeds a machine for an inferior discovered during bootstrap.
    pub fn new_working(id: I, capture: NodeId) -> Self {
        Self {
            id,
            state: SchedulerStatus::Working,
            primary: Some(capture),
            pending_dest: None,
            removed: false,
        }
    }

    /// Assigns the inferior to `capture`. Legal from Absent only.
    pub fn handle_add(&mut self, capture: NodeId) -> bool {
        if self.state != SchedulerStatus::Absent {
            tracing::warn!(
                inferior = %self.id,
                state = ?self.state,
                "ignored add in non-absent state",
            );
            return false;
        }
        self.state = SchedulerStatus::Commit;
        self.primary = Some(capture);
        true
    }

    /// Starts tearing the inferior down.
    pub fn handle_remove(&mut self) -> bool {
        match self.state {
            SchedulerStatus::Commit | SchedulerStatus::Working => {
                self.state = SchedulerStatus::Removing;
                true
            }
            SchedulerStatus::Absent => {
                self.removed = true;
                false
            }
            SchedulerStatus::Removing => false,
        }
    }

    /// Starts relocating the inferior to `dest`: remove from the current
    /// primary, then add on `dest` once the removal is confirmed.
    pub fn handle_move(&mut self, dest: NodeId) -> bool {
        if self.state != SchedulerStatus::Working {
            return false;
        }
        self.state = SchedulerStatus::Removing;
        self.pending_dest = Some(dest);
        true
    }

    /// Folds in a status report from `from`. Reports from captures other
    /// than the primary are stale and ignored.
    pub fn handle_inferior_status(&mut self, from: &NodeId, status: ComponentState) {
        if self.primary.as_ref() != Some(from) {
            return;
        }
        match (self.state, status) {
            (SchedulerStatus::Commit, ComponentState::Working) => {
                self.state = SchedulerStatus::Working;
            }
            (SchedulerStatus::Working, ComponentState::Stopped) => {
                // The inferior died under us; reschedule.
                self.state = SchedulerStatus::Absent;
                self.primary = None;
            }
            (SchedulerStatus::Removing, ComponentState::Stopped | ComponentState::Absent) => {
                self.finish_removal();
            }
            _ => {}
        }
    }

    /// The capture vanished. Anything placed on it is gone with it.
    pub fn handle_capture_shutdown(&mut self, capture: &NodeId) {
        if self.primary.as_ref() != Some(capture) {
            return;
        }
        match self.state {
            SchedulerStatus::Removing => self.finish_removal(),
            _ => {
                self.state = SchedulerStatus::Absent;
                self.primary = None;
            }
        }
    }

    fn finish_removal(&mut self) {
        match self.pending_dest.take() {
            Some(dest) => {
                // Second leg of a move.
                self.state = SchedulerStatus::Commit;
                self.primary = Some(dest);
            }
            None => {
                self.state = SchedulerStatus::Absent;
                self.primary = None;
                self.removed = true;
            }
        }
    }

    /// The machine can be dropped: the inferior is gone for good.
    pub fn has_removed(&self) -> bool {
        self.removed
    }
}
