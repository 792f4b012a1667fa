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

//! The execution driver (spec.md §4.5 "Execution factories", §4.6
//! "Execution driver", §5 "Concurrency & resource model").
//!
//! The driver logic is single-threaded (one caller owns [`run`]), and
//! coordinates with worker threads owned by the [`TaskScheduler`]
//! collaborator through a completion channel, in the same
//! ready-queue/waiting-set shape as a `BuildState`/topo-scheduler pair
//! but message-passing rather than condvar-based — the variant
//! spec.md §9 calls "equally valid and arguably cleaner".
//!
//! [`run`]: Execution::run

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use log::{debug, info, warn};

use crate::{
    analyzer::OutputAnalyzer,
    error::{ConstructionError, ExecutionException, RunError},
    frozen::{FrozenExecution, GraphSnapshot},
    graph::{Graph, NodeKey},
    remover::{OutputRemover, RemovalReason},
    scheduler::{TaskCompletionCallback, TaskScheduler},
    status::{ExecutionState, NodeState, NodeStatus},
    target::Target,
};

enum Completion {
    Success(NodeKey),
    Failure(NodeKey, Option<String>, Option<anyhow::Error>),
}

/// The callback handed to [`TaskScheduler::submit`]. Only the first
/// report is honored (spec.md §6.2); later ones are silently dropped.
struct DriverCallback {
    node: NodeKey,
    tx: Sender<Completion>,
    reported: AtomicBool,
}

impl TaskCompletionCallback for DriverCallback {
    fn report_success(&self) {
        if self.reported.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            let _ = self.tx.send(Completion::Success(self.node.clone()));
        }
    }

    fn report_failure(&self, message: Option<String>, cause: Option<anyhow::Error>) {
        if self.reported.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            let _ = self.tx.send(Completion::Failure(self.node.clone(), message, cause));
        }
    }
}

struct Inner<Token> {
    statuses: HashMap<NodeKey, NodeStatus<Token>>,
    nodes_to_run: HashSet<NodeKey>,
    structure_queue: VecDeque<NodeKey>,
    exceptions: Vec<ExecutionException>,
    state: ExecutionState,
}

/// Drives a [`Target`] to completion against a [`TaskScheduler`].
/// Constructed via [`Execution::fresh`], [`Execution::fresh_skipping`]
/// or [`Execution::thaw`] (spec.md §4.5); never directly.
pub struct Execution<S: TaskScheduler> {
    scheduler: S,
    graph: Arc<Graph>,
    shutdown_on_failure: AtomicBool,
    inner: Mutex<Inner<S::Token>>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
    running: AtomicBool,
}

impl<S: TaskScheduler> Execution<S> {
    fn new(
        scheduler: S,
        graph: Arc<Graph>,
        statuses: HashMap<NodeKey, NodeStatus<S::Token>>,
        nodes_to_run: HashSet<NodeKey>,
        shutdown_on_failure: bool,
    ) -> Execution<S> {
        let (completion_tx, completion_rx) = unbounded();
        let (interrupt_tx, interrupt_rx) = unbounded();
        Execution {
            scheduler,
            graph,
            shutdown_on_failure: AtomicBool::new(shutdown_on_failure),
            inner: Mutex::new(Inner {
                statuses,
                nodes_to_run,
                structure_queue: VecDeque::new(),
                exceptions: Vec::new(),
                state: ExecutionState::Idle,
            }),
            completion_tx,
            completion_rx,
            interrupt_tx,
            interrupt_rx,
            running: AtomicBool::new(false),
        }
    }

    /// Computes the initial status map for a scope of nodes slated to
    /// run: `READY` if none of a node's dependencies are also in
    /// `scope`, else `NOT_READY`. Every other node in `graph` is
    /// `IRRELEVANT`.
    fn initial_statuses(
        graph: &Graph,
        scope: &HashSet<NodeKey>,
    ) -> HashMap<NodeKey, NodeStatus<S::Token>> {
        graph
            .nodes()
            .keys()
            .map(|key| {
                let status = if !scope.contains(key) {
                    NodeStatus::Bare(NodeState::Irrelevant)
                } else {
                    let node = graph.node(key).unwrap();
                    let has_in_scope_dependency = node.dependencies.iter().any(|d| scope.contains(d));
                    if has_in_scope_dependency {
                        NodeStatus::Bare(NodeState::NotReady)
                    } else {
                        NodeStatus::Bare(NodeState::Ready)
                    }
                };
                (key.clone(), status)
            })
            .collect()
    }

    /// *fresh(target)* (spec.md §4.5).
    pub fn fresh(target: &Target, scheduler: S, shutdown_on_failure: bool) -> Execution<S> {
        let scope: HashSet<NodeKey> = target.keys().cloned().collect();
        let statuses = Self::initial_statuses(target.graph(), &scope);
        Execution::new(scheduler, Arc::clone(target.graph()), statuses, scope, shutdown_on_failure)
    }

    /// *fresh-skipping(target)* (spec.md §4.5): runs the
    /// [`OutputAnalyzer`] and restricts the run to the transitive
    /// predecessors (within `target`) of stale tail nodes — but within
    /// that ancestor closure, only nodes the analyzer actually found
    /// invalid or missing are scheduled; fresh ancestors start
    /// `SUCCEEDED` outright rather than being re-run.
    pub fn fresh_skipping(
        target: &Target,
        scheduler: S,
        shutdown_on_failure: bool,
    ) -> std::io::Result<Execution<S>> {
        let analysis = OutputAnalyzer::analyze(target)?;

        let stale_tails: Vec<NodeKey> = target
            .keys()
            .filter(|key| {
                let node = target.graph().node(key).unwrap();
                let is_tail = node.dependents.iter().all(|d| !target.contains(d));
                is_tail && analysis.is_missing_or_invalid(key)
            })
            .cloned()
            .collect();

        let scope: HashSet<NodeKey> = if stale_tails.is_empty() {
            HashSet::new()
        } else {
            target
                .stopping_after(&stale_tails)
                .expect("stale tails are members of target by construction")
                .keys()
                .cloned()
                .collect()
        };

        let stale: HashSet<NodeKey> = scope
            .iter()
            .filter(|key| analysis.is_missing_or_invalid(key))
            .cloned()
            .collect();

        let statuses = Self::initial_statuses_fresh_skipping(target.graph(), &scope, &stale);
        Ok(Execution::new(
            scheduler,
            Arc::clone(target.graph()),
            statuses,
            scope,
            shutdown_on_failure,
        ))
    }

    /// Like [`Execution::initial_statuses`], but for a `fresh_skipping`
    /// scope: nodes in `scope` that aren't `stale` already have a fresh,
    /// valid output, so they start `SUCCEEDED` rather than `READY`;
    /// their dependents only wait on `stale` dependencies.
    fn initial_statuses_fresh_skipping(
        graph: &Graph,
        scope: &HashSet<NodeKey>,
        stale: &HashSet<NodeKey>,
    ) -> HashMap<NodeKey, NodeStatus<S::Token>> {
        graph
            .nodes()
            .keys()
            .map(|key| {
                let status = if !scope.contains(key) {
                    NodeStatus::Bare(NodeState::Irrelevant)
                } else if !stale.contains(key) {
                    NodeStatus::Bare(NodeState::Succeeded)
                } else {
                    let node = graph.node(key).unwrap();
                    let has_unready_dependency =
                        node.dependencies.iter().any(|d| stale.contains(d));
                    if has_unready_dependency {
                        NodeStatus::Bare(NodeState::NotReady)
                    } else {
                        NodeStatus::Bare(NodeState::Ready)
                    }
                };
                (key.clone(), status)
            })
            .collect()
    }

    /// *thaw(frozen)* (spec.md §4.5). `graph` must be the same graph
    /// (by shape) the snapshot was frozen from.
    pub fn thaw(
        graph: Arc<Graph>,
        frozen: FrozenExecution<S::Token>,
        scheduler: S,
        shutdown_on_failure: bool,
    ) -> Result<Execution<S>, ConstructionError> {
        if frozen.graph_snapshot() != &GraphSnapshot::of(&graph) {
            return Err(ConstructionError::GraphMismatch);
        }
        let mut statuses = frozen.into_statuses();

        let nodes_to_run: HashSet<NodeKey> = statuses
            .iter()
            .filter(|(_, s)| s.state() != NodeState::Irrelevant)
            .map(|(k, _)| k.clone())
            .collect();

        for key in graph.topo_order() {
            if !nodes_to_run.contains(key) {
                continue;
            }
            let ready_now = matches!(statuses.get(key), Some(NodeStatus::Bare(NodeState::NotReady)))
                && {
                    let node = graph.node(key).unwrap();
                    node.dependencies
                        .iter()
                        .all(|d| statuses.get(d).map(|s| s.state().satisfies_dependency()).unwrap_or(false))
                };
            if ready_now {
                statuses.insert(key.clone(), NodeStatus::Bare(NodeState::Ready));
            }
        }

        let execution = Execution::new(scheduler, Arc::clone(&graph), statuses, nodes_to_run, shutdown_on_failure);
        {
            let inner = execution.inner.lock().unwrap();
            for (key, status) in inner.statuses.iter() {
                if let NodeStatus::Scheduled(token) = status {
                    let callback = Arc::new(DriverCallback {
                        node: key.clone(),
                        tx: execution.completion_tx.clone(),
                        reported: AtomicBool::new(false),
                    });
                    execution
                        .scheduler
                        .register_callback(token, callback)
                        .map_err(|e| ConstructionError::InvalidToken(key.clone(), e))?;
                }
            }
        }
        Ok(execution)
    }

    pub fn set_shutdown_on_failure(&self, enabled: bool) {
        self.shutdown_on_failure.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.lock().unwrap().state
    }

    pub fn statuses(&self) -> HashMap<NodeKey, NodeStatus<S::Token>>
    where
        S::Token: Clone,
    {
        self.inner.lock().unwrap().statuses.clone()
    }

    /// Requests that the driver stop dispatching new work; in-flight
    /// tasks still run to completion (spec.md §4.6).
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ExecutionState::Running {
            inner.state = ExecutionState::ShuttingDown;
        }
    }

    /// Requests an immediate exit, possibly abandoning in-flight
    /// tasks (spec.md §4.6).
    pub fn interrupt(&self) {
        let _ = self.interrupt_tx.send(());
    }

    /// A consistent snapshot of the current status map (spec.md §4.7).
    pub fn freeze(&self) -> FrozenExecution<S::Token> {
        let inner = self.inner.lock().unwrap();
        let snapshot = GraphSnapshot::of(&self.graph);
        FrozenExecution::new(snapshot, inner.statuses.clone())
            .expect("an Execution's own status map always satisfies FrozenExecution's invariants")
    }

    fn any_scheduled(inner: &Inner<S::Token>) -> bool {
        inner
            .nodes_to_run
            .iter()
            .any(|k| inner.statuses.get(k).map(|s| s.state() == NodeState::Scheduled).unwrap_or(false))
    }

    fn propagate_readiness(&self, inner: &mut Inner<S::Token>, succeeded: &NodeKey) {
        let node = self.graph.node(succeeded).unwrap();
        let dependents: Vec<NodeKey> = node.dependents.iter().cloned().collect();
        for dependent in dependents {
            if !inner.nodes_to_run.contains(&dependent) {
                continue;
            }
            if !matches!(inner.statuses.get(&dependent), Some(NodeStatus::Bare(NodeState::NotReady))) {
                continue;
            }
            let dep_node = self.graph.node(&dependent).unwrap();
            let satisfied = dep_node.dependencies.iter().all(|d| {
                inner
                    .statuses
                    .get(d)
                    .map(|s| s.state().satisfies_dependency())
                    .unwrap_or(false)
            });
            if satisfied {
                inner.statuses.insert(dependent, NodeStatus::Bare(NodeState::Ready));
            }
        }
    }

    /// Marks `node` `SUCCEEDED`/`FAILED`, runs readiness propagation
    /// or failure handling, but does not itself dispatch — callers
    /// must follow up with [`Execution::dispatch_all_ready`] once the
    /// lock is released (spec.md §4.6 step 3/4).
    fn finish_task_node(&self, inner: &mut Inner<S::Token>, completion: Completion) {
        match completion {
            Completion::Success(key) => {
                debug!("node '{}' succeeded", key);
                inner.statuses.insert(key.clone(), NodeStatus::Bare(NodeState::Succeeded));
                self.propagate_readiness(inner, &key);
            }
            Completion::Failure(key, message, cause) => {
                warn!("node '{}' failed", key);
                inner.statuses.insert(key.clone(), NodeStatus::Bare(NodeState::Failed));
                inner.exceptions.push(ExecutionException::TaskFailure {
                    node: key.clone(),
                    message,
                    source: cause,
                    suppressed: Vec::new(),
                });
                if self.shutdown_on_failure.load(Ordering::SeqCst) && inner.state == ExecutionState::Running {
                    inner.state = ExecutionState::ShuttingDown;
                }
                let removal_errors =
                    OutputRemover::remove(&self.graph, std::iter::once(&key), RemovalReason::ExecutionFailed, None);
                for err in removal_errors {
                    inner
                        .exceptions
                        .push(ExecutionException::OutputIoError { node: key.clone(), source: err });
                }
            }
        }
    }

    /// Repeatedly finds a single `READY` node among `nodes_to_run` and
    /// dispatches it, re-acquiring the lock around each dispatch so
    /// the mandatory lock release around `scheduler.submit` (spec.md
    /// §4.6) applies per node rather than for the whole batch.
    fn dispatch_all_ready(&self) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ExecutionState::Running {
                return;
            }
            let ready_key = inner
                .nodes_to_run
                .iter()
                .find(|k| matches!(inner.statuses.get(*k), Some(NodeStatus::Bare(NodeState::Ready))))
                .cloned();
            let key = match ready_key {
                Some(k) => k,
                None => return,
            };
            let node = self.graph.node(&key).unwrap();
            if let Some(task) = node.variant.task() {
                let task = Arc::clone(task);
                inner.statuses.insert(key.clone(), NodeStatus::Bare(NodeState::Scheduled));
                drop(inner);

                let callback = Arc::new(DriverCallback {
                    node: key.clone(),
                    tx: self.completion_tx.clone(),
                    reported: AtomicBool::new(false),
                });
                let token = self.scheduler.submit(&key, task, callback);

                let mut inner = self.inner.lock().unwrap();
                if let Some(token) = token {
                    if matches!(inner.statuses.get(&key), Some(NodeStatus::Bare(NodeState::Scheduled))) {
                        inner.statuses.insert(key, NodeStatus::Scheduled(token));
                    }
                }
            } else {
                inner.statuses.insert(key.clone(), NodeStatus::Bare(NodeState::Succeeded));
                inner.structure_queue.push_back(key);
            }
        }
    }

    /// Blocks until the target settles (spec.md §4.6). Not
    /// re-entrant: a second concurrent call fails immediately.
    pub fn run(&self) -> Result<(), RunError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunError::AlreadyRunning);
        }
        let result = self.run_inner();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_inner(&self) -> Result<(), RunError> {
        crate::scoped_metric!("execution.run");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ExecutionState::Running;
        }
        info!("execution starting");
        self.dispatch_all_ready();

        loop {
            let structure_pop = {
                let mut inner = self.inner.lock().unwrap();
                let node = inner.structure_queue.pop_front();
                if node.is_none()
                    && !Self::any_scheduled(&inner)
                    && self.completion_rx.is_empty()
                {
                    break;
                }
                node
            };

            if let Some(key) = structure_pop {
                let mut inner = self.inner.lock().unwrap();
                self.propagate_readiness(&mut inner, &key);
                drop(inner);
                self.dispatch_all_ready();
                continue;
            }

            let mut select = Select::new();
            let comp_idx = select.recv(&self.completion_rx);
            let int_idx = select.recv(&self.interrupt_rx);
            let oper = select.select();
            match oper.index() {
                i if i == comp_idx => {
                    let completion = match oper.recv(&self.completion_rx) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    let mut inner = self.inner.lock().unwrap();
                    self.finish_task_node(&mut inner, completion);
                    drop(inner);
                    self.dispatch_all_ready();
                }
                i if i == int_idx => {
                    let _ = oper.recv(&self.interrupt_rx);
                    let mut inner = self.inner.lock().unwrap();
                    inner.exceptions.push(ExecutionException::Interrupted);
                    inner.state = ExecutionState::ShuttingDown;
                    break;
                }
                _ => unreachable!("Select only registered two operations"),
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.exceptions.is_empty() {
            inner.state = ExecutionState::Idle;
            Ok(())
        } else {
            let exceptions = std::mem::take(&mut inner.exceptions);
            inner.state = ExecutionState::Idle;
            Err(RunError::Failed(ExecutionException::aggregate(exceptions)))
        }
    }
}
