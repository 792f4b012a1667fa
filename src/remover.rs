//! [`OutputRemover`]: deletes the outputs of a set of nodes (spec.md
//! §4.4, §6.4).

use std::{collections::HashMap, io, sync::Arc};

use crate::{
    graph::{Graph, NodeKey},
    task::Output,
};

/// Why a batch of outputs is being removed. Carried through to the
/// optional [`OutputRemovalFilter`] hook and used in error messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RemovalReason {
    ExecutionFailed,
    RemovalRequested,
    PredatesDependency,
}

/// Optional caller hook (spec.md §6.4) that may drop some outputs from
/// a removal batch before deletion — e.g. to preserve artifacts the
/// caller wants kept around for inspection. Called at most once per
/// batch; not required to be thread-safe.
pub trait OutputRemovalFilter {
    fn filter(&self, outputs: &mut HashMap<NodeKey, Vec<Arc<dyn Output>>>, reason: RemovalReason);
}

/// Deletes outputs for a set of nodes, collecting failures rather than
/// stopping at the first one (spec.md §4.4: "a single failure must not
/// prevent attempting the remaining deletions").
pub struct OutputRemover;

impl OutputRemover {
    pub fn remove<'a>(
        graph: &Graph,
        keys: impl IntoIterator<Item = &'a NodeKey>,
        reason: RemovalReason,
        filter: Option<&dyn OutputRemovalFilter>,
    ) -> Vec<io::Error> {
        let mut batch: HashMap<NodeKey, Vec<Arc<dyn Output>>> = HashMap::new();
        for key in keys {
            let node = match graph.node(key) {
                Some(n) => n,
                None => continue,
            };
            if let Some(task) = node.variant.task() {
                batch.insert(key.clone(), task.outputs());
            }
        }

        if let Some(filter) = filter {
            filter.filter(&mut batch, reason);
        }

        let mut errors = Vec::new();
        for outputs in batch.values() {
            for output in outputs {
                if let Err(e) = output.delete() {
                    errors.push(e);
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{Graph, NodeBuilder};
    use crate::task::test_support::{CellOutput, StubTask};
    use std::rc::Rc;
    use std::time::SystemTime;

    #[test]
    fn removes_outputs_of_named_node_only() {
        let out_a = CellOutput::new();
        out_a.touch(SystemTime::now());
        let out_b = CellOutput::new();
        out_b.touch(SystemTime::now());
        let a = Rc::new(NodeBuilder::task_node(StubTask::new(vec![out_a.clone()])).with_key("a"));
        let b = Rc::new(NodeBuilder::task_node(StubTask::new(vec![out_b.clone()])).with_key("b"));
        let graph = Graph::create(vec![a, b]).unwrap();

        let errors = OutputRemover::remove(
            &graph,
            &[NodeKey::from("a".to_string())],
            RemovalReason::RemovalRequested,
            None,
        );
        assert!(errors.is_empty());
        assert!(out_a.timestamp().unwrap().is_none());
        assert!(out_b.timestamp().unwrap().is_some());
    }

    #[test]
    fn a_failing_deletion_does_not_stop_the_rest() {
        let out_a = CellOutput::new();
        out_a.touch(SystemTime::now());
        out_a.fail_next_delete();
        let out_b = CellOutput::new();
        out_b.touch(SystemTime::now());
        let a = Rc::new(
            NodeBuilder::task_node(StubTask::new(vec![out_a.clone(), out_b.clone()])).with_key("a"),
        );
        let graph = Graph::create(vec![a]).unwrap();

        let errors = OutputRemover::remove(
            &graph,
            &[NodeKey::from("a".to_string())],
            RemovalReason::ExecutionFailed,
            None,
        );
        assert_eq!(errors.len(), 1);
        assert!(out_b.timestamp().unwrap().is_none());
    }
}
