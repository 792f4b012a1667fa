//! [`Target`]: a non-empty subset of a [`Graph`] (spec.md §3, §4.2).

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use crate::{
    error::ConstructionError,
    graph::{Graph, Node, NodeKey},
};

/// A non-empty subset of a [`Graph`]'s nodes, used as the scope for a
/// run or for output operations. The whole graph is itself a target
/// (see [`Graph::whole`]).
#[derive(Clone)]
pub struct Target {
    parent_graph: Arc<Graph>,
    node_set: HashSet<NodeKey>,
}

impl Target {
    pub(crate) fn new_unchecked(parent_graph: Arc<Graph>, node_set: HashSet<NodeKey>) -> Target {
        Target {
            parent_graph,
            node_set,
        }
    }

    /// Builds a target from an explicit key set, validating
    /// non-emptiness and that every key belongs to `graph`.
    pub fn new(graph: &Arc<Graph>, keys: HashSet<NodeKey>) -> Result<Target, ConstructionError> {
        if keys.is_empty() {
            return Err(ConstructionError::EmptyTarget);
        }
        for key in &keys {
            if !graph.contains_key(key) {
                return Err(ConstructionError::NotInTarget(key.clone()));
            }
        }
        Ok(Target {
            parent_graph: Arc::clone(graph),
            node_set: keys,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.parent_graph
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.node_set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.node_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_set.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.node_set.iter()
    }

    /// The target's nodes, keyed by node key (spec.md §3: "A Target
    /// exposes `nodes` as a mapping keyed by node key.").
    pub fn nodes(&self) -> HashMap<NodeKey, &Node> {
        self.node_set
            .iter()
            .map(|k| (k.clone(), self.parent_graph.node(k).expect("target invariant")))
            .collect()
    }

    fn validate_inputs<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a NodeKey>,
    ) -> Result<Vec<NodeKey>, ConstructionError> {
        let mut out = Vec::new();
        for key in keys {
            if !self.contains(key) {
                return Err(ConstructionError::NotInTarget(key.clone()));
            }
            out.push(key.clone());
        }
        Ok(out)
    }

    /// Forward closure of `from` over `dependents`, restricted to this
    /// target (spec.md §4.2). Restricting the neighbor function to
    /// the target *before* expanding is what makes scenario 5 in
    /// spec.md §8 (a discontinuous target) behave correctly; a
    /// "traverse then filter" implementation would wrongly pull in
    /// out-of-target neighbors.
    pub fn starting_from<'a>(
        &self,
        from: impl IntoIterator<Item = &'a NodeKey>,
    ) -> Result<Target, ConstructionError> {
        let roots = self.validate_inputs(from)?;
        let closure = self.closure(&roots, |node| &node.dependents);
        if closure.len() == self.node_set.len() {
            return Ok(self.clone());
        }
        Ok(Target {
            parent_graph: Arc::clone(&self.parent_graph),
            node_set: closure,
        })
    }

    /// Reverse closure of `after` over `dependencies`, restricted to
    /// this target (spec.md §4.2).
    pub fn stopping_after<'a>(
        &self,
        after: impl IntoIterator<Item = &'a NodeKey>,
    ) -> Result<Target, ConstructionError> {
        let roots = self.validate_inputs(after)?;
        let closure = self.closure(&roots, |node| &node.dependencies);
        if closure.len() == self.node_set.len() {
            return Ok(self.clone());
        }
        Ok(Target {
            parent_graph: Arc::clone(&self.parent_graph),
            node_set: closure,
        })
    }

    fn closure(
        &self,
        roots: &[NodeKey],
        neighbors: impl Fn(&Node) -> &std::collections::BTreeSet<NodeKey>,
    ) -> HashSet<NodeKey> {
        let mut seen: HashSet<NodeKey> = HashSet::new();
        let mut queue: VecDeque<NodeKey> = VecDeque::new();
        for root in roots {
            if seen.insert(root.clone()) {
                queue.push_back(root.clone());
            }
        }
        while let Some(key) = queue.pop_front() {
            let node = self.parent_graph.node(&key).expect("target invariant");
            for next in neighbors(node) {
                // Restrict to the parent target *before* expanding.
                if self.node_set.contains(next) && seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::NodeBuilder;
    use crate::task::test_support::StubTask;
    use std::rc::Rc;

    /// The canonical graph from spec.md §8: `0->1->2->3->4` plus
    /// `5->6->7` with extra edges `1->6`, `6->3`.
    fn canonical_graph() -> Arc<Graph> {
        let n0 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("0"));
        let n1 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("1"));
        let n2 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("2"));
        let n3 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("3"));
        let n4 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("4"));
        let n5 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("5"));
        let n6 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("6"));
        let n7 = Rc::new(NodeBuilder::task_node(StubTask::new(vec![])).with_key("7"));
        n1.depends_on(&n0);
        n2.depends_on(&n1);
        n3.depends_on(&n2);
        n4.depends_on(&n3);
        n6.depends_on(&n5);
        n7.depends_on(&n6);
        n6.depends_on(&n1);
        n3.depends_on(&n6);
        Graph::create(vec![n0, n1, n2, n3, n4, n5, n6, n7]).unwrap()
    }

    fn key(s: &str) -> NodeKey {
        NodeKey::from(s.to_string())
    }

    #[test]
    fn stopping_after_2_covers_0_1_2() {
        let graph = canonical_graph();
        let whole = graph.whole();
        let t = whole.stopping_after(&[key("2")]).unwrap();
        let mut keys: Vec<&str> = t.keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["0", "1", "2"]);
    }

    #[test]
    fn discontinuous_target_does_not_cross_the_boundary() {
        // Scenario 5: starting from Target {5, 7} with
        // startingFrom({5}), the result must be {5} because 6 (and
        // therefore 7) are not in the parent target.
        let graph = canonical_graph();
        let mut keys = HashSet::new();
        keys.insert(key("5"));
        keys.insert(key("7"));
        let restricted = Target::new(&graph, keys).unwrap();
        let result = restricted.starting_from(&[key("5")]).unwrap();
        let mut result_keys: Vec<&str> = result.keys().map(|k| k.as_str()).collect();
        result_keys.sort();
        assert_eq!(result_keys, vec!["5"]);
    }

    #[test]
    fn starting_from_unknown_key_fails() {
        let graph = canonical_graph();
        let whole = graph.whole();
        assert!(matches!(
            whole.starting_from(&[key("nope")]),
            Err(ConstructionError::NotInTarget(_))
        ));
    }

    #[test]
    fn closure_equal_to_whole_returns_identity() {
        let graph = canonical_graph();
        let whole = graph.whole();
        let result = whole.starting_from(&[key("0"), key("5")]).unwrap();
        assert_eq!(result.len(), whole.len());
    }
}
