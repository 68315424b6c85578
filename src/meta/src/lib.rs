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

//! Control plane of the changefeed replication system.
//!
//! A *coordinator* places one *maintainer* per changefeed on the node fleet;
//! each maintainer owns the scheduling of that changefeed's table spans over
//! per-span *dispatchers* hosted by the nodes, drives barrier (DDL) events to
//! completion, and advances the changefeed checkpoint from dispatcher
//! heartbeats.

#![warn(clippy::dbg_macro)]
#![warn(clippy::explicit_into_iter_loop)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::map_flatten)]
#![warn(clippy::await_holding_lock)]
#![deny(unused_must_use)]
#![deny(rustdoc::broken_intra_doc_links)]

mod config;
pub mod coordinator;
mod error;
pub mod maintainer;
pub mod messaging;
pub mod model;
pub mod node;
pub mod schema;
pub mod supervisor;

pub use config::MetaConfig;
pub use error::{MetaError, MetaResult};
