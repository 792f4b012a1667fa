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

//! The immutable DAG (spec.md §3 "Graph", §4.1 "Graph construction").

use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    rc::Rc,
    sync::Arc,
};

use petgraph::{algo::tarjan_scc, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};

use crate::{error::ConstructionError, target::Target, task::Task};

/// A validated node identifier: `[A-Za-z0-9]([A-Za-z0-9_-]{0,254}[A-Za-z0-9])?`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_format(s: &str) -> bool {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() > 256 {
            return false;
        }
        let is_alnum = |b: u8| b.is_ascii_alphanumeric();
        if !is_alnum(bytes[0]) || !is_alnum(*bytes.last().unwrap()) {
            return false;
        }
        bytes[1..bytes.len() - 1]
            .iter()
            .all(|&b| is_alnum(b) || b == b'_' || b == b'-')
    }

    pub fn validated(s: impl Into<String>) -> Result<NodeKey, ConstructionError> {
        let s = s.into();
        if !Self::is_valid_format(&s) {
            return Err(ConstructionError::InvalidKeyFormat(NodeKey(s.into())));
        }
        Ok(NodeKey(s.into()))
    }
}

impl From<String> for NodeKey {
    /// Does not check the key format. Used internally (tests, and
    /// error messages that merely echo a caller-supplied label back)
    /// where the string is either already known-valid or is only
    /// ever going to be displayed, never inserted into a graph.
    fn from(s: String) -> Self {
        NodeKey(s.into())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two node variants (spec.md §3, §9 "Two node variants").
/// A sum type rather than an inheritance chain, the same way
/// `ninja-tasks`' `Task` enum distinguishes `Retrieve` from `Command`
/// tasks.
#[derive(Debug, Clone)]
pub enum NodeVariant {
    TaskNode(Arc<dyn Task>),
    StructureNode,
}

impl NodeVariant {
    pub fn is_task(&self) -> bool {
        matches!(self, NodeVariant::TaskNode(_))
    }

    pub fn task(&self) -> Option<&Arc<dyn Task>> {
        match self {
            NodeVariant::TaskNode(t) => Some(t),
            NodeVariant::StructureNode => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub key: NodeKey,
    pub variant: NodeVariant,
    pub dependencies: BTreeSet<NodeKey>,
    pub dependents: BTreeSet<NodeKey>,
}

impl Node {
    pub fn is_task(&self) -> bool {
        self.variant.is_task()
    }
}

/// A caller-assembled description of a future [`Node`]. Builders are
/// wired into a dependency DAG by reference before being handed, as a
/// flat collection, to [`Graph::create`]; identity (not content) is
/// what `Graph::create` uses to detect duplicates and missing
/// dependencies (spec.md §4.1).
#[derive(Debug)]
pub struct NodeBuilder {
    key: Option<String>,
    task: Option<Arc<dyn Task>>,
    is_structure: bool,
    dependencies: RefCell<Vec<Rc<NodeBuilder>>>,
}

impl NodeBuilder {
    pub fn task_node(task: Arc<dyn Task>) -> NodeBuilder {
        NodeBuilder {
            key: None,
            task: Some(task),
            is_structure: false,
            dependencies: RefCell::new(Vec::new()),
        }
    }

    pub fn structure_node() -> NodeBuilder {
        NodeBuilder {
            key: None,
            task: None,
            is_structure: true,
            dependencies: RefCell::new(Vec::new()),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Wires a dependency onto an already-constructed (`Rc`-wrapped)
    /// builder. Taking `&self` rather than consuming the builder lets
    /// a builder depend on itself (for testing cycle detection) and
    /// lets dependency wiring happen after the builder has been
    /// shared with other builders.
    pub fn depends_on(self: &Rc<Self>, dependency: &Rc<NodeBuilder>) {
        self.dependencies.borrow_mut().push(Rc::clone(dependency));
    }

    fn label(&self) -> String {
        self.key.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }
}

/// The immutable DAG. Constructed once via [`Graph::create`]; every
/// invariant in spec.md §3 is checked there, never re-checked later.
#[derive(Debug)]
pub struct Graph {
    nodes: HashMap<NodeKey, Node>,
    /// Topological order (dependencies before dependents).
    topo_order: Vec<NodeKey>,
}

impl Graph {
    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn nodes(&self) -> &HashMap<NodeKey, Node> {
        &self.nodes
    }

    pub fn topo_order(&self) -> &[NodeKey] {
        &self.topo_order
    }

    pub fn contains_key(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// The whole graph, viewed as a [`Target`] over itself
    /// (spec.md §3: "The Graph itself is a Target equal to its
    /// entire node set.").
    pub fn whole(self: &Arc<Self>) -> Target {
        let keys: HashSet<NodeKey> = self.nodes.keys().cloned().collect();
        Target::new_unchecked(Arc::clone(self), keys)
    }

    fn next_generated_key(counter: &mut u64, used: &HashSet<String>) -> String {
        loop {
            let candidate = format!("{:08x}", *counter);
            *counter += 1;
            if !used.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Builds and validates a [`Graph`] from a flat collection of
    /// [`NodeBuilder`]s (spec.md §4.1).
    pub fn create(builders: Vec<Rc<NodeBuilder>>) -> Result<Arc<Graph>, ConstructionError> {
        if builders.is_empty() {
            return Err(ConstructionError::EmptyGraph);
        }

        // Step 2: duplicate element detection, and membership set used
        // for the "missing referenced dependency" check in step 3.
        let mut members: HashMap<usize, &Rc<NodeBuilder>> = HashMap::new();
        for b in &builders {
            let ptr = Rc::as_ptr(b) as usize;
            if members.insert(ptr, b).is_some() {
                return Err(ConstructionError::DuplicateBuilder(NodeKey::from(
                    b.label(),
                )));
            }
        }

        // Step 1: assign effective keys.
        let mut used_keys: HashSet<String> = HashSet::new();
        for b in &builders {
            if let Some(k) = &b.key {
                if !used_keys.insert(k.clone()) {
                    return Err(ConstructionError::DuplicateKey(NodeKey::from(k.clone())));
                }
            }
        }
        let mut ptr_to_key: HashMap<usize, NodeKey> = HashMap::new();
        let mut counter: u64 = 0;
        for b in &builders {
            let ptr = Rc::as_ptr(b) as usize;
            let key = match &b.key {
                Some(k) => NodeKey::validated(k.clone())?,
                None => {
                    let generated = Self::next_generated_key(&mut counter, &used_keys);
                    used_keys.insert(generated.clone());
                    NodeKey::from(generated)
                }
            };
            ptr_to_key.insert(ptr, key);
        }

        // Step 2 (task/structure invariant) and step 3 (dependency
        // membership).
        for b in &builders {
            let ptr = Rc::as_ptr(b) as usize;
            let key = ptr_to_key[&ptr].clone();
            if b.is_structure && b.task.is_some() {
                return Err(ConstructionError::TaskOnStructureNode(key));
            }
            for dep in b.dependencies.borrow().iter() {
                let dep_ptr = Rc::as_ptr(dep) as usize;
                if !members.contains_key(&dep_ptr) {
                    return Err(ConstructionError::MissingDependency(
                        key,
                        NodeKey::from(dep.label()),
                    ));
                }
            }
        }

        // Step 4: wire dependencies/dependents.
        let mut nodes: HashMap<NodeKey, Node> = HashMap::new();
        for b in &builders {
            let ptr = Rc::as_ptr(b) as usize;
            let key = ptr_to_key[&ptr].clone();
            let dependencies: BTreeSet<NodeKey> = b
                .dependencies
                .borrow()
                .iter()
                .map(|dep| ptr_to_key[&(Rc::as_ptr(dep) as usize)].clone())
                .collect();
            let variant = match &b.task {
                Some(task) => NodeVariant::TaskNode(Arc::clone(task)),
                None => NodeVariant::StructureNode,
            };
            nodes.insert(
                key.clone(),
                Node {
                    key,
                    variant,
                    dependencies,
                    dependents: BTreeSet::new(),
                },
            );
        }
        let inverse: Vec<(NodeKey, NodeKey)> = nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(move |d| (d.clone(), n.key.clone())))
            .collect();
        for (dep_key, dependent_key) in inverse {
            nodes.get_mut(&dep_key).unwrap().dependents.insert(dependent_key);
        }

        // Step 5: cycle detection (Tarjan SCC) + topological order.
        let mut pg: DiGraphMap<&str, ()> = DiGraphMap::new();
        for key in nodes.keys() {
            pg.add_node(key.as_str());
        }
        for node in nodes.values() {
            for dep in &node.dependencies {
                pg.add_edge(node.key.as_str(), dep.as_str(), ());
            }
        }
        for scc in tarjan_scc(&pg) {
            if scc.len() > 1 || (scc.len() == 1 && pg.contains_edge(scc[0], scc[0])) {
                return Err(ConstructionError::Cycle);
            }
        }
        // Acyclic now: a plain iterative post-order DFS over the
        // dependency edges gives dependencies before dependents, the
        // same shape as petgraph's `DfsPostOrder`, chosen over
        // recursion so pathological inputs can't blow the stack.
        let topo_order = Self::iterative_topo_order(&nodes);

        Ok(Arc::new(Graph { nodes, topo_order }))
    }

    fn iterative_topo_order(nodes: &HashMap<NodeKey, Node>) -> Vec<NodeKey> {
        let mut finished: Vec<NodeKey> = Vec::with_capacity(nodes.len());
        let mut done: HashSet<NodeKey> = HashSet::new();
        let mut keys: Vec<&NodeKey> = nodes.keys().collect();
        keys.sort();
        for start in keys {
            if done.contains(start) {
                continue;
            }
            // (node, next-dependency-index-to-visit)
            let mut stack: Vec<(NodeKey, usize)> = vec![(start.clone(), 0)];
            let mut on_stack: HashSet<NodeKey> = vec![start.clone()].into_iter().collect();
            while let Some(&mut (ref key, ref mut idx)) = stack.last_mut() {
                let deps: Vec<&NodeKey> = nodes[key].dependencies.iter().collect();
                if *idx < deps.len() {
                    let dep = deps[*idx].clone();
                    *idx += 1;
                    if !done.contains(&dep) && !on_stack.contains(&dep) {
                        on_stack.insert(dep.clone());
                        stack.push((dep, 0));
                    }
                } else {
                    let (finished_key, _) = stack.pop().unwrap();
                    on_stack.remove(&finished_key);
                    done.insert(finished_key.clone());
                    finished.push(finished_key);
                }
            }
        }
        finished
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::test_support::StubTask;

    fn task_builder(key: &str) -> Rc<NodeBuilder> {
        Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key(key))
    }

    #[test]
    fn empty_graph_fails() {
        assert!(matches!(
            Graph::create(vec![]),
            Err(ConstructionError::EmptyGraph)
        ));
    }

    #[test]
    fn self_loop_fails() {
        let a = task_builder("a");
        a.depends_on(&a);
        assert!(matches!(
            Graph::create(vec![a]),
            Err(ConstructionError::Cycle)
        ));
    }

    #[test]
    fn two_node_cycle_fails() {
        let a = task_builder("a");
        let b = task_builder("b");
        a.depends_on(&b);
        b.depends_on(&a);
        assert!(matches!(
            Graph::create(vec![a, b]),
            Err(ConstructionError::Cycle)
        ));
    }

    #[test]
    fn duplicate_key_fails() {
        let a = task_builder("dup");
        let b = task_builder("dup");
        assert!(matches!(
            Graph::create(vec![a, b]),
            Err(ConstructionError::DuplicateKey(_))
        ));
    }

    #[test]
    fn duplicate_builder_fails() {
        let a = task_builder("a");
        assert!(matches!(
            Graph::create(vec![a.clone(), a]),
            Err(ConstructionError::DuplicateBuilder(_))
        ));
    }

    #[test]
    fn missing_dependency_fails() {
        let outside = task_builder("outside");
        let inside = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])));
        inside.depends_on(&outside);
        assert!(matches!(
            Graph::create(vec![inside]),
            Err(ConstructionError::MissingDependency(_, _))
        ));
    }

    #[test]
    fn invalid_key_format_fails() {
        let a = task_builder("-leading-dash");
        assert!(matches!(
            Graph::create(vec![a]),
            Err(ConstructionError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn generated_keys_do_not_collide_with_supplied_keys() {
        let collider = task_builder("00000000");
        let anon = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])));
        let graph = Graph::create(vec![collider, anon]).unwrap();
        assert_eq!(graph.nodes().len(), 2);
        assert!(graph.nodes().keys().any(|k| k.as_str() != "00000000"));
    }

    #[test]
    fn dependents_is_exact_inverse_of_dependencies() {
        let a = task_builder("a");
        let b = task_builder("b");
        b.depends_on(&a);
        let graph = Graph::create(vec![a, b]).unwrap();
        let a_key = NodeKey::from("a".to_string());
        let b_key = NodeKey::from("b".to_string());
        assert!(graph.node(&a_key).unwrap().dependents.contains(&b_key));
        assert!(graph.node(&b_key).unwrap().dependencies.contains(&a_key));
    }

    #[test]
    fn topo_order_respects_edges() {
        let a = task_builder("a");
        let b = task_builder("b");
        b.depends_on(&a);
        let graph = Graph::create(vec![a, b]).unwrap();
        let pos_a = graph.topo_order().iter().position(|k| k.as_str() == "a").unwrap();
        let pos_b = graph.topo_order().iter().position(|k| k.as_str() == "b").unwrap();
        assert!(pos_a < pos_b);
    }
}
