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

//! [`NodeState`], [`NodeStatus`] and [`ExecutionState`] (spec.md §3).

use serde::{Deserialize, Serialize};

/// The state of a single node within a run. See spec.md §3 for the
/// full transition table; [`NodeState::can_transition_to`] enforces
/// it everywhere a status is mutated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Outside the target of this run; never scheduled.
    Irrelevant,
    NotReady,
    Ready,
    Scheduled,
    Succeeded,
    Failed,
}

impl NodeState {
    /// Whether a node in this state satisfies a dependent, i.e.
    /// downstream nodes may proceed.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Irrelevant)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Irrelevant | NodeState::Succeeded | NodeState::Failed
        )
    }

    /// Validates a single edge of the transition graph in spec.md §3.
    /// `is_task` distinguishes the two different `READY ->` edges.
    pub fn can_transition_to(self, next: NodeState, is_task: bool) -> bool {
        use NodeState::*;
        matches!(
            (self, next, is_task),
            (NotReady, Ready, _)
                | (Ready, Scheduled, true)
                | (Ready, Succeeded, false)
                | (Scheduled, Succeeded, _)
                | (Scheduled, Failed, _)
        )
    }
}

/// Either a bare [`NodeState`], or `Scheduled` carrying a
/// scheduler-issued token identifying the in-flight task instance.
/// Only `TaskNode`s may carry a token (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "Token: Serialize + for<'d> Deserialize<'d>")]
pub enum NodeStatus<Token> {
    Bare(NodeState),
    Scheduled(Token),
}

impl<Token> NodeStatus<Token> {
    pub fn state(&self) -> NodeState {
        match self {
            NodeStatus::Bare(s) => *s,
            NodeStatus::Scheduled(_) => NodeState::Scheduled,
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            NodeStatus::Scheduled(t) => Some(t),
            NodeStatus::Bare(_) => None,
        }
    }

    pub fn bare(state: NodeState) -> Self {
        NodeStatus::Bare(state)
    }
}

/// The driver's overall lifecycle (spec.md §3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ExecutionState {
    Idle,
    Running,
    ShuttingDown,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn task_node_transitions() {
        assert!(NodeState::NotReady.can_transition_to(NodeState::Ready, true));
        assert!(NodeState::Ready.can_transition_to(NodeState::Scheduled, true));
        assert!(!NodeState::Ready.can_transition_to(NodeState::Succeeded, true));
        assert!(NodeState::Scheduled.can_transition_to(NodeState::Succeeded, true));
        assert!(NodeState::Scheduled.can_transition_to(NodeState::Failed, true));
    }

    #[test]
    fn structure_node_transitions() {
        assert!(NodeState::Ready.can_transition_to(NodeState::Succeeded, false));
        assert!(!NodeState::Ready.can_transition_to(NodeState::Scheduled, false));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for terminal in [NodeState::Irrelevant, NodeState::Succeeded, NodeState::Failed] {
            for next in [
                NodeState::Irrelevant,
                NodeState::NotReady,
                NodeState::Ready,
                NodeState::Scheduled,
                NodeState::Succeeded,
                NodeState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next, true));
                assert!(!terminal.can_transition_to(next, false));
            }
        }
    }

    #[test]
    fn satisfying_states() {
        assert!(NodeState::Succeeded.satisfies_dependency());
        assert!(NodeState::Irrelevant.satisfies_dependency());
        assert!(!NodeState::Ready.satisfies_dependency());
        assert!(!NodeState::Failed.satisfies_dependency());
    }
}
