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

//! Generic coordination of *inferiors* over *captures*.
//!
//! The supervisor does not know what it schedules: the coordinator
//! instantiates it with maintainers as inferiors and nodes as captures. It
//! owns one state machine per inferior, admits new work only after every
//! capture returned its bootstrap, and runs an ordered scheduler chain where
//! the first policy producing tasks wins.

mod state_machine;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

use itertools::Itertools;
pub use state_machine::{SchedulerStatus, StateMachine};

use crate::messaging::Message;
use crate::model::NodeId;

/// How a concrete inferior type is addressed on the wire.
pub trait InferiorSpec: Send + Sync {
    type Id: Clone + Eq + Hash + Ord + fmt::Display + Send + Sync;

    fn new_add_message(&self, id: &Self::Id, capture: &NodeId) -> Message;
    fn new_remove_message(&self, id: &Self::Id, capture: &NodeId) -> Message;
    fn new_bootstrap_message(&self, capture: &NodeId) -> Message;
}

/// A scheduling decision produced by one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleTask<I> {
    Add { id: I, target: NodeId },
    Remove { id: I },
    Move { id: I, dest: NodeId },
}

/// Inputs every scheduling policy sees.
pub struct ScheduleContext<'a, I> {
    /// Everything that should exist.
    pub all_inferiors: &'a BTreeSet<I>,
    /// Alive captures, with their current inferior count.
    pub capture_loads: &'a HashMap<NodeId, usize>,
    pub state_machines: &'a HashMap<I, StateMachine<I>>,
    pub max_task_count: usize,
    /// Armed when inferiors may be missing (new changefeed, capture churn,
    /// an inferior falling back to absent).
    pub need_add: bool,
    /// Armed when tracked inferiors may no longer be wanted.
    pub need_remove: bool,
}

/// One scheduling policy of the supervisor chain.
pub trait SupervisorScheduler<I>: Send {
    fn name(&self) -> &'static str;

    fn schedule(&mut self, ctx: &ScheduleContext<'_, I>) -> Vec<ScheduleTask<I>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Uninitialized,
    Initialized,
}

pub struct Supervisor<S: InferiorSpec> {
    name: String,
    spec: S,
    max_task_concurrency: usize,
    schedulers: Vec<Box<dyn SupervisorScheduler<S::Id>>>,
    state_machines: HashMap<S::Id, StateMachine<S::Id>>,
    running_tasks: BTreeSet<S::Id>,
    captures: HashMap<NodeId, CaptureState>,
    need_add: bool,
    need_remove: bool,
}

impl<S: InferiorSpec> Supervisor<S> {
    pub fn new(
        name: impl Into<String>,
        spec: S,
        schedulers: Vec<Box<dyn SupervisorScheduler<S::Id>>>,
        max_task_concurrency: usize,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            max_task_concurrency,
            schedulers,
            state_machines: HashMap::new(),
            running_tasks: BTreeSet::new(),
            captures: HashMap::new(),
            need_add: true,
            need_remove: true,
        }
    }

    /// Arms the basic scheduler to look for missing inferiors.
    pub fn mark_need_add(&mut self) {
        self.need_add = true;
    }

    /// Arms the basic scheduler to look for stale inferiors.
    pub fn mark_need_remove(&mut self) {
        self.need_remove = true;
    }

    /// A capture joined; returns the bootstrap request for it.
    pub fn handle_capture_added(&mut self, capture: NodeId) -> Option<Message> {
        if self.captures.contains_key(&capture) {
            return None;
        }
        let msg = self.spec.new_bootstrap_message(&capture);
        self.captures.insert(capture, CaptureState::Uninitialized);
        Some(msg)
    }

    /// A capture's bootstrap response arrived, possibly reporting inferiors
    /// it already runs.
    pub fn handle_capture_initialized(
        &mut self,
        capture: &NodeId,
        working_inferiors: Vec<S::Id>,
    ) {
        if let Some(state) = self.captures.get_mut(capture) {
            *state = CaptureState::Initialized;
        }
        for id in working_inferiors {
            self.state_machines
                .entry(id.clone())
                .or_insert_with(|| StateMachine::new_working(id, capture.clone()));
        }
        self.need_add = true;
        self.need_remove = true;
    }

    /// A capture left; its inferiors fall back to absent.
    pub fn handle_capture_removed(&mut self, capture: &NodeId) {
        self.captures.remove(capture);
        for machine in self.state_machines.values_mut() {
            machine.handle_capture_shutdown(capture);
        }
        self.state_machines.retain(|_, machine| !machine.has_removed());
        self.need_add = true;
    }

    pub fn check_all_captures_initialized(&self) -> bool {
        !self.captures.is_empty()
            && self
                .captures
                .values()
                .all(|state| *state == CaptureState::Initialized)
    }

    /// Drives one inferior status into its machine and re-emits the pending
    /// command when the machine is still mid-transition.
    pub fn handle_inferior_status(
        &mut self,
        from: &NodeId,
        id: &S::Id,
        status: spanstream_pb::common::ComponentState,
    ) {
        let Some(machine) = self.state_machines.get_mut(id) else {
            tracing::info!(
                supervisor = %self.name,
                inferior = %id,
                "status for unknown inferior ignored",
            );
            return;
        };
        machine.handle_inferior_status(from, status);
        if machine.state == SchedulerStatus::Absent {
            // The inferior died under its capture; re-place it.
            self.need_add = true;
        }
        if machine.has_removed() {
            self.state_machines.remove(id);
        }
    }

    /// One scheduling pass: prune finished running tasks and re-emit their
    /// in-flight commands, then admit new tasks if every capture is ready.
    pub fn schedule(&mut self, all_inferiors: &BTreeSet<S::Id>) -> Vec<Message> {
        let mut msgs = self.check_running_tasks();

        if !self.check_all_captures_initialized() {
            tracing::info!(
                supervisor = %self.name,
                captures = self.captures.len(),
                "skip scheduling until every capture is initialized",
            );
            return msgs;
        }
        let max_task_count = self
            .max_task_concurrency
            .saturating_sub(self.running_tasks.len());
        if max_task_count == 0 {
            tracing::warn!(
                supervisor = %self.name,
                running = self.running_tasks.len(),
                "skip scheduling, too many running tasks",
            );
            return msgs;
        }

        let capture_loads = self.capture_loads();
        let ctx = ScheduleContext {
            all_inferiors,
            capture_loads: &capture_loads,
            state_machines: &self.state_machines,
            max_task_count,
            need_add: self.need_add,
            need_remove: self.need_remove,
        };
        let tasks = self
            .schedulers
            .iter_mut()
            .find_map(|scheduler| {
                let tasks = scheduler.schedule(&ctx);
                (!tasks.is_empty()).then_some(tasks)
            })
            .unwrap_or_default();
        self.need_add = false;
        self.need_remove = false;
        msgs.extend(self.handle_schedule_tasks(tasks));
        msgs
    }

    fn capture_loads(&self) -> HashMap<NodeId, usize> {
        let mut loads: HashMap<NodeId, usize> =
            self.captures.keys().map(|node| (node.clone(), 0)).collect();
        for machine in self.state_machines.values() {
            if let Some(primary) = &machine.primary {
                if let Some(load) = loads.get_mut(primary) {
                    *load += 1;
                }
            }
        }
        loads
    }

    fn handle_schedule_tasks(&mut self, tasks: Vec<ScheduleTask<S::Id>>) -> Vec<Message> {
        let mut msgs = Vec::new();
        for task in tasks {
            match task {
                ScheduleTask::Add { id, target } => {
                    let machine = self
                        .state_machines
                        .entry(id.clone())
                        .or_insert_with(|| StateMachine::new(id.clone()));
                    if machine.handle_add(target.clone()) {
                        msgs.push(self.spec.new_add_message(&id, &target));
                        self.running_tasks.insert(id);
                    }
                }
                ScheduleTask::Remove { id } => {
                    let Some(machine) = self.state_machines.get_mut(&id) else {
                        continue;
                    };
                    let primary = machine.primary.clone();
                    if machine.handle_remove() {
                        if let Some(primary) = primary {
                            msgs.push(self.spec.new_remove_message(&id, &primary));
                        }
                        self.running_tasks.insert(id);
                    } else if machine.has_removed() {
                        self.state_machines.remove(&id);
                    }
                }
                ScheduleTask::Move { id, dest } => {
                    let Some(machine) = self.state_machines.get_mut(&id) else {
                        continue;
                    };
                    let primary = machine.primary.clone();
                    if machine.handle_move(dest) {
                        if let Some(primary) = primary {
                            msgs.push(self.spec.new_remove_message(&id, &primary));
                        }
                        self.running_tasks.insert(id);
                    }
                }
            }
        }
        msgs
    }

    /// Prunes running tasks that reached a terminal state and re-pushes the
    /// command of every task still in flight.
    fn check_running_tasks(&mut self) -> Vec<Message> {
        let mut msgs = Vec::new();
        let mut finished = Vec::new();
        for id in &self.running_tasks {
            let Some(machine) = self.state_machines.get(id) else {
                finished.push(id.clone());
                continue;
            };
            match machine.state {
                // Working: the task landed. Absent: the attempt died with
                // its capture and the basic scheduler owns the retry.
                SchedulerStatus::Working | SchedulerStatus::Absent => finished.push(id.clone()),
                SchedulerStatus::Commit => {
                    if let Some(primary) = &machine.primary {
                        msgs.push(self.spec.new_add_message(id, primary));
                    }
                }
                SchedulerStatus::Removing => {
                    if let Some(primary) = &machine.primary {
                        msgs.push(self.spec.new_remove_message(id, primary));
                    }
                }
            }
        }
        for id in finished {
            tracing::info!(
                supervisor = %self.name,
                inferior = %id,
                "schedule finished, removing running task",
            );
            self.running_tasks.remove(&id);
        }
        self.state_machines.retain(|_, machine| !machine.has_removed());
        msgs
    }

    pub fn state_of(&self, id: &S::Id) -> Option<SchedulerStatus> {
        self.state_machines.get(id).map(|machine| machine.state)
    }

    pub fn primary_of(&self, id: &S::Id) -> Option<NodeId> {
        self.state_machines
            .get(id)
            .and_then(|machine| machine.primary.clone())
    }

    pub fn running_task_count(&self) -> usize {
        self.running_tasks.len()
    }
}

/// Assigns inferiors that should exist but have no machine (or are absent)
/// to the least-loaded capture, and removes machines whose inferior should
/// no longer exist. Runs only when the supervisor armed the need-add or
/// need-remove flag.
pub struct BasicSupervisorScheduler<I> {
    _inferior: std::marker::PhantomData<fn() -> I>,
}

impl<I> Default for BasicSupervisorScheduler<I> {
    fn default() -> Self {
        Self {
            _inferior: std::marker::PhantomData,
        }
    }
}

impl<I: Clone + Eq + Hash + Ord + fmt::Display + Send> SupervisorScheduler<I>
    for BasicSupervisorScheduler<I>
{
    fn name(&self) -> &'static str {
        "basic-scheduler"
    }

    fn schedule(&mut self, ctx: &ScheduleContext<'_, I>) -> Vec<ScheduleTask<I>> {
        if !ctx.need_add && !ctx.need_remove {
            return Vec::new();
        }
        let mut tasks = Vec::new();
        let mut loads = ctx.capture_loads.clone();

        if ctx.need_remove {
            tasks.extend(
                ctx.state_machines
                    .keys()
                    .filter(|id| !ctx.all_inferiors.contains(id))
                    .sorted()
                    .take(ctx.max_task_count)
                    .map(|id| ScheduleTask::Remove { id: id.clone() }),
            );
        }

        if ctx.need_add {
            let absent = ctx
                .all_inferiors
                .iter()
                .filter(|id| {
                    ctx.state_machines
                        .get(id)
                        .map_or(true, |machine| machine.state == SchedulerStatus::Absent)
                })
                .take(ctx.max_task_count.saturating_sub(tasks.len()))
                .collect_vec();
            for id in absent {
                let Some(target) = loads
                    .iter()
                    .min_by_key(|(node, load)| (**load, (*node).clone()))
                    .map(|(node, _)| node.clone())
                else {
                    break;
                };
                *loads.get_mut(&target).expect("target is alive") += 1;
                tasks.push(ScheduleTask::Add {
                    id: id.clone(),
                    target,
                });
            }
        }
        tasks
    }
}

/// Periodically moves inferiors off overloaded captures, mirroring the
/// span-level balance policy at the fleet level.
pub struct BalanceSupervisorScheduler<I> {
    check_interval: std::time::Duration,
    last_check: Option<tokio::time::Instant>,
    _inferior: std::marker::PhantomData<fn() -> I>,
}

impl<I> BalanceSupervisorScheduler<I> {
    pub fn new(check_interval: std::time::Duration) -> Self {
        Self {
            check_interval,
            last_check: None,
            _inferior: std::marker::PhantomData,
        }
    }
}

impl<I: Clone + Eq + Hash + Ord + fmt::Display + Send> SupervisorScheduler<I>
    for BalanceSupervisorScheduler<I>
{
    fn name(&self) -> &'static str {
        "balance-scheduler"
    }

    fn schedule(&mut self, ctx: &ScheduleContext<'_, I>) -> Vec<ScheduleTask<I>> {
        if let Some(last) = self.last_check {
            if last.elapsed() < self.check_interval {
                return Vec::new();
            }
        }
        self.last_check = Some(tokio::time::Instant::now());

        // Only balance a quiet fleet.
        if ctx
            .state_machines
            .values()
            .any(|machine| machine.state != SchedulerStatus::Working)
        {
            return Vec::new();
        }
        let captures = ctx.capture_loads.keys().sorted().collect_vec();
        if captures.len() < 2 {
            return Vec::new();
        }
        let total: usize = ctx.capture_loads.values().sum();
        let quota_high = total.div_ceil(captures.len());
        let high_count = if total % captures.len() == 0 {
            captures.len()
        } else {
            total % captures.len()
        };
        let mut loads = ctx.capture_loads.clone();
        let quotas: HashMap<&NodeId, usize> = captures
            .iter()
            .enumerate()
            .map(|(at, node)| {
                (
                    *node,
                    if at < high_count {
                        quota_high
                    } else {
                        quota_high.saturating_sub(1)
                    },
                )
            })
            .collect();

        let mut tasks = Vec::new();
        for node in &captures {
            while loads[*node] > quotas[*node] && tasks.len() < ctx.max_task_count {
                let Some(dest) = captures
                    .iter()
                    .filter(|candidate| loads[**candidate] < quotas[**candidate])
                    .max_by_key(|candidate| {
                        (
                            quotas[**candidate] - loads[**candidate],
                            std::cmp::Reverse((**candidate).clone()),
                        )
                    })
                    .map(|candidate| (*candidate).clone())
                else {
                    return tasks;
                };
                let Some(id) = ctx
                    .state_machines
                    .values()
                    .filter(|machine| machine.primary.as_ref() == Some(*node))
                    .map(|machine| machine.id.clone())
                    .filter(|id| {
                        !tasks
                            .iter()
                            .any(|task| matches!(task, ScheduleTask::Move { id: moved, .. } if moved == id))
                    })
                    .sorted()
                    .next()
                else {
                    break;
                };
                *loads.get_mut(*node).expect("donor is alive") -= 1;
                *loads.get_mut(&dest).expect("dest is alive") += 1;
                tasks.push(ScheduleTask::Move { id, dest });
            }
        }
        tasks
    }
}
