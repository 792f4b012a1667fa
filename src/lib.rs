/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! A graph-based workflow execution engine with incremental
//! re-execution.
//!
//! The pieces, in the order a caller touches them:
//!
//! - [`graph`] — build an immutable [`graph::Graph`] out of
//!   [`graph::NodeBuilder`]s.
//! - [`target`] — select a [`target::Target`], a subset of the graph,
//!   via [`graph::Graph::whole`] or [`target::Target::starting_from`] /
//!   [`target::Target::stopping_after`].
//! - [`analyzer`] — ask the [`analyzer::OutputAnalyzer`] which nodes
//!   in a target are stale given current output timestamps.
//! - [`execution`] — construct an [`execution::Execution`] against a
//!   caller-supplied [`scheduler::TaskScheduler`] and call `run()`.
//! - [`frozen`] — snapshot a running [`execution::Execution`] and
//!   later thaw it back into a new one.
//!
//! The engine never touches the filesystem or spawns threads itself;
//! [`task::Task`], [`task::Output`] and [`scheduler::TaskScheduler`]
//! are the three collaborators a caller must supply.

pub mod analyzer;
pub mod error;
pub mod execution;
pub mod frozen;
pub mod graph;
pub mod metrics;
pub mod remover;
pub mod scheduler;
pub mod status;
pub mod target;
pub mod task;

pub use error::{ConstructionError, ExecutionException, RunError};
pub use graph::{Graph, NodeBuilder, NodeKey};
pub use status::{ExecutionState, NodeState, NodeStatus};
pub use target::Target;
