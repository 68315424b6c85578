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

use std::time::Duration;

use serde::Deserialize;

/// Tunables of the control plane. All intervals are in milliseconds in the
/// serialized form.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetaConfig {
    /// Cadence of the maintainer main loop (scheduler + operators).
    pub schedule_tick_interval_ms: u64,

    /// Cadence of the balance pass.
    pub balance_interval_ms: u64,

    /// Upper bound on concurrently running schedule tasks per supervisor.
    pub max_task_concurrency: usize,

    /// Operators polled per controller tick.
    pub operator_batch_size: usize,

    /// Retry cadence of an unfinished operator.
    pub operator_retry_interval_ms: u64,

    /// A node missing heartbeats for this long is evicted.
    pub node_ttl_ms: u64,

    /// Capacity of each per-target outbound message queue.
    pub message_queue_size: usize,

    /// Checkpoint lag (in timestamp units) beyond which a span becomes a
    /// split candidate. Zero disables splitting.
    pub split_lag_threshold: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schedule_tick_interval_ms: 100,
            balance_interval_ms: 1000,
            max_task_concurrency: 1000,
            operator_batch_size: 64,
            operator_retry_interval_ms: 500,
            node_ttl_ms: 60_000,
            message_queue_size: 1024,
            split_lag_threshold: 0,
        }
    }
}

impl MetaConfig {
    pub fn schedule_tick_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_tick_interval_ms)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(self.balance_interval_ms)
    }

    pub fn operator_retry_interval(&self) -> Duration {
        Duration::from_millis(self.operator_retry_interval_ms)
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_millis(self.node_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_partial_override() {
        let cfg = MetaConfig::default();
        assert_eq!(cfg.operator_retry_interval(), Duration::from_millis(500));

        let cfg: MetaConfig =
            serde_json::from_str(r#"{"balance_interval_ms": 2000}"#).unwrap();
        assert_eq!(cfg.balance_interval(), Duration::from_millis(2000));
        assert_eq!(cfg.operator_batch_size, 64);
    }
}
