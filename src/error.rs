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

//! The error taxonomy of spec.md §7, expressed as real types.

use thiserror::Error;

use crate::graph::NodeKey;

/// Raised eagerly by `Graph::create`, `Target` constructors, or
/// `FrozenExecution` validation. Never returned by `run()`.
#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("a graph must contain at least one node")]
    EmptyGraph,
    #[error("duplicate builder supplied for key '{0}'")]
    DuplicateBuilder(NodeKey),
    #[error("duplicate key '{0}'")]
    DuplicateKey(NodeKey),
    #[error("key '{0}' does not match the required format")]
    InvalidKeyFormat(NodeKey),
    #[error("structure node '{0}' may not carry a task")]
    TaskOnStructureNode(NodeKey),
    #[error("node '{0}' references dependency '{1}' which is not in this graph")]
    MissingDependency(NodeKey, NodeKey),
    #[error("graph contains a cycle")]
    Cycle,
    #[error("key '{0}' is not a member of this target")]
    NotInTarget(NodeKey),
    #[error("a target must contain at least one node")]
    EmptyTarget,
    #[error("frozen status map is missing an entry for key '{0}'")]
    MissingStatus(NodeKey),
    #[error("frozen status map has an entry for unknown key '{0}'")]
    UnknownStatus(NodeKey),
    #[error("structure node '{0}' may not be frozen as SCHEDULED")]
    StructureNodeScheduled(NodeKey),
    #[error("scheduler rejected token for node '{0}' on thaw: {1}")]
    InvalidToken(NodeKey, #[source] InvalidTokenError),
    #[error("frozen snapshot's graph shape does not match the supplied graph")]
    GraphMismatch,
}

/// Returned by [`crate::execution::Execution::run`]. Kept distinct
/// from [`ExecutionException`] because re-entrancy is a usage error,
/// not an outcome of the run itself (spec.md §4.6: "run() is not
/// re-entrant").
#[derive(Error, Debug)]
pub enum RunError {
    #[error("run() is already in progress on this execution")]
    AlreadyRunning,
    #[error(transparent)]
    Failed(#[from] ExecutionException),
}

/// Returned by [`crate::scheduler::TaskScheduler::register_callback`]
/// when the token is unknown to the scheduler (spec.md §6.1).
#[derive(Error, Debug)]
#[error("token is not recognized by this scheduler")]
pub struct InvalidTokenError;

/// One of the reasons `run()` can end abnormally (spec.md §7). The
/// primary exception plus any suppressed causes are both represented
/// by this type; [`ExecutionException::suppressed`] holds the latter.
#[derive(Error, Debug)]
pub enum ExecutionException {
    #[error("task for node '{node}' failed{}", format_message(.message))]
    TaskFailure {
        node: NodeKey,
        message: Option<String>,
        #[source]
        source: Option<anyhow::Error>,
        suppressed: Vec<ExecutionException>,
    },
    #[error("I/O error while removing outputs of node '{node}'")]
    OutputIoError {
        node: NodeKey,
        #[source]
        source: std::io::Error,
    },
    #[error("execution was interrupted")]
    Interrupted,
    #[error("unexpected error")]
    Unexpected(#[source] anyhow::Error),
}

fn format_message(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {}", m),
        None => String::new(),
    }
}

impl ExecutionException {
    /// Priority used to pick the primary exception out of a batch
    /// (spec.md §7/§8): Unexpected > TaskFailure > OutputIoError >
    /// Interrupted. Lower number sorts first (higher priority).
    fn priority(&self) -> u8 {
        match self {
            ExecutionException::Unexpected(_) => 0,
            ExecutionException::TaskFailure { .. } => 1,
            ExecutionException::OutputIoError { .. } => 2,
            ExecutionException::Interrupted => 3,
        }
    }

    /// Picks the highest-priority exception as primary and attaches
    /// the rest as suppressed causes on it. Panics if `exceptions` is
    /// empty; callers only reach for this when they already know at
    /// least one exception was stored.
    pub fn aggregate(mut exceptions: Vec<ExecutionException>) -> ExecutionException {
        assert!(!exceptions.is_empty());
        exceptions.sort_by_key(|e| e.priority());
        let mut iter = exceptions.into_iter();
        let mut primary = iter.next().unwrap();
        let rest: Vec<ExecutionException> = iter.collect();
        match &mut primary {
            ExecutionException::TaskFailure { suppressed, .. } => suppressed.extend(rest),
            _ => {
                // Only TaskFailure is specified to carry suppressed causes in
                // practice (OutputIoError is always suppressed *under* a
                // TaskFailure, never the other way around), but if a batch
                // somehow has no TaskFailure we still must not drop the rest.
                if !rest.is_empty() {
                    return ExecutionException::TaskFailure {
                        node: NodeKey::from(String::new()),
                        message: None,
                        source: Some(anyhow::Error::msg(primary.to_string())),
                        suppressed: rest,
                    };
                }
            }
        }
        primary
    }

    pub fn suppressed(&self) -> &[ExecutionException] {
        match self {
            ExecutionException::TaskFailure { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}
