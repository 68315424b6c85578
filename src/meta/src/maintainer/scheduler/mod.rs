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

//! Span scheduling policies of one maintainer.
//!
//! Policies form an ordered chain; each tick the first policy that produces
//! tasks wins. Basic assignment of unbound spans always takes precedence
//! over balancing, which takes precedence over splitting.

mod balance;
mod basic;
mod split;

pub use balance::BalanceScheduler;
pub use basic::BasicScheduler;
pub use split::SplitScheduler;

/// One scheduling policy. Returns how many tasks (operators) it created.
pub trait SpanScheduler: Send + Sync {
    fn name(&self) -> &'static str;

    fn schedule(&self, max_tasks: usize) -> usize;
}

/// Ordered chain of policies; first non-empty result wins.
pub struct SchedulerChain {
    schedulers: Vec<Box<dyn SpanScheduler>>,
}

impl SchedulerChain {
    pub fn new(schedulers: Vec<Box<dyn SpanScheduler>>) -> Self {
        Self { schedulers }
    }

    pub fn schedule(&self, max_tasks: usize) -> usize {
        if max_tasks == 0 {
            return 0;
        }
        for scheduler in &self.schedulers {
            let tasks = scheduler.schedule(max_tasks);
            if tasks != 0 {
                tracing::debug!(
                    scheduler = scheduler.name(),
                    tasks,
                    "scheduler produced tasks"
                );
                return tasks;
            }
        }
        0
    }
}
