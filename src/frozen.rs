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

//! [`FrozenExecution`]: a serializable snapshot of a run in progress
//! (spec.md §4.7, §6.5).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConstructionError,
    graph::{Graph, NodeKey},
    status::{NodeState, NodeStatus},
};

/// The serializable shape of a [`Graph`] — keys, task/structure kind,
/// and dependency sets — without the opaque `Task`/`Output` payload
/// those keys carry at runtime. A thawed execution is always handed
/// the live `Graph` it came from; this snapshot exists only so a
/// deserialized [`FrozenExecution`] can be checked against it before
/// trusting the status map (spec.md §6.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    nodes: BTreeMap<NodeKey, (bool, BTreeSet<NodeKey>)>,
}

impl GraphSnapshot {
    pub fn of(graph: &Graph) -> GraphSnapshot {
        let nodes = graph
            .nodes()
            .values()
            .map(|n| (n.key.clone(), (n.is_task(), n.dependencies.clone())))
            .collect();
        GraphSnapshot { nodes }
    }

    fn is_task(&self, key: &NodeKey) -> Option<bool> {
        self.nodes.get(key).map(|(is_task, _)| *is_task)
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.keys()
    }
}

/// A value snapshot of an execution's status map, suitable for
/// serialization and later reconstruction via
/// [`crate::execution::Execution::thaw`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "Token: Serialize + for<'d> Deserialize<'d>")]
pub struct FrozenExecution<Token> {
    graph: GraphSnapshot,
    statuses: HashMap<NodeKey, NodeStatus<Token>>,
}

impl<Token> FrozenExecution<Token> {
    /// Validates and builds a snapshot (spec.md §4.7). Downgrades any
    /// `TaskNode` stored as `SCHEDULED` without a token to `READY`,
    /// since the in-flight token may have been lost to a crash
    /// between `submit()` returning and the driver capturing it.
    pub fn new(
        graph: GraphSnapshot,
        mut statuses: HashMap<NodeKey, NodeStatus<Token>>,
    ) -> Result<FrozenExecution<Token>, ConstructionError> {
        for key in graph.keys() {
            if !statuses.contains_key(key) {
                return Err(ConstructionError::MissingStatus(key.clone()));
            }
        }
        for key in statuses.keys() {
            if graph.is_task(key).is_none() {
                return Err(ConstructionError::UnknownStatus(key.clone()));
            }
        }
        for key in graph.keys() {
            let is_task = graph.is_task(key).unwrap();
            let state = statuses[key].state();
            if !is_task && state == NodeState::Scheduled {
                return Err(ConstructionError::StructureNodeScheduled(key.clone()));
            }
        }
        for key in graph.keys() {
            let downgrade = matches!(
                statuses.get(key),
                Some(NodeStatus::Bare(NodeState::Scheduled))
            );
            if downgrade {
                statuses.insert(key.clone(), NodeStatus::Bare(NodeState::Ready));
            }
        }
        Ok(FrozenExecution { graph, statuses })
    }

    pub fn graph_snapshot(&self) -> &GraphSnapshot {
        &self.graph
    }

    pub fn statuses(&self) -> &HashMap<NodeKey, NodeStatus<Token>> {
        &self.statuses
    }

    pub fn into_statuses(self) -> HashMap<NodeKey, NodeStatus<Token>> {
        self.statuses
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::NodeBuilder;
    use crate::task::test_support::StubTask;
    use std::rc::Rc;

    fn graph() -> std::sync::Arc<Graph> {
        let a = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("a"));
        let b = Rc::new(NodeBuilder::structure_node().with_key("b"));
        b.depends_on(&a);
        Graph::create(vec![a, b]).unwrap()
    }

    #[test]
    fn missing_status_is_rejected() {
        let g = graph();
        let snapshot = GraphSnapshot::of(&g);
        let statuses: HashMap<NodeKey, NodeStatus<()>> = HashMap::new();
        assert!(matches!(
            FrozenExecution::new(snapshot, statuses),
            Err(ConstructionError::MissingStatus(_))
        ));
    }

    #[test]
    fn structure_node_scheduled_is_rejected() {
        let g = graph();
        let snapshot = GraphSnapshot::of(&g);
        let mut statuses: HashMap<NodeKey, NodeStatus<()>> = HashMap::new();
        statuses.insert(NodeKey::from("a".to_string()), NodeStatus::Bare(NodeState::Ready));
        statuses.insert(NodeKey::from("b".to_string()), NodeStatus::Bare(NodeState::Scheduled));
        assert!(matches!(
            FrozenExecution::new(snapshot, statuses),
            Err(ConstructionError::StructureNodeScheduled(_))
        ));
    }

    #[test]
    fn scheduled_without_token_downgrades_to_ready() {
        let g = graph();
        let snapshot = GraphSnapshot::of(&g);
        let mut statuses: HashMap<NodeKey, NodeStatus<()>> = HashMap::new();
        statuses.insert(NodeKey::from("a".to_string()), NodeStatus::Bare(NodeState::Scheduled));
        statuses.insert(NodeKey::from("b".to_string()), NodeStatus::Bare(NodeState::NotReady));
        let frozen = FrozenExecution::new(snapshot, statuses).unwrap();
        assert_eq!(
            frozen.statuses()[&NodeKey::from("a".to_string())].state(),
            NodeState::Ready
        );
    }
}
