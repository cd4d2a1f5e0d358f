//! Task graphs: build once, finalize, replay many times.
//!
//! A [`TaskGraph`] is filled either explicitly with [`TaskGraph::add`] or by
//! recording the commands issued against a live queue
//! ([`TaskGraph::record`]). Both modes produce the same node/edge structure;
//! [`TaskGraph::finalize`] freezes it into an [`ExecutableGraph`] that a queue
//! replays with [`Queue::submit_graph`](crate::Queue::submit_graph).

use crate::command::{Command, CommandKind};
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::executor::Executor;
use crate::queue::Queue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Node handle, valid for the graph that returned it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Insertion index of the node
    pub fn index(self) -> usize {
        self.0
    }
}

/// Lifecycle of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStage {
    /// Accepting explicit node additions
    Building,
    /// A queue is recording into the graph
    Recording,
    /// Finalized; only replay is possible
    Compiled,
    /// At least one replay has been submitted
    Replaying,
    /// Retired; replays are rejected
    Done,
}

struct GraphNode {
    command: Command,
    deps: Vec<NodeId>,
}

struct GraphState {
    stage: GraphStage,
    recording_queue: Option<u64>,
    nodes: Vec<GraphNode>,
}

/// Modifiable task graph; clones share the same nodes
#[derive(Clone)]
pub struct TaskGraph {
    id: u64,
    state: Arc<Mutex<GraphState>>,
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskGraph")
            .field("id", &self.id)
            .field("stage", &state.stage)
            .field("nodes", &state.nodes.len())
            .finish()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(GraphState {
                stage: GraphStage::Building,
                recording_queue: None,
                nodes: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> GraphStage {
        self.state.lock().stage
    }

    /// Add a node that runs after every node in `depends_on`
    pub fn add(&self, command: Command, depends_on: &[NodeId]) -> Result<NodeId> {
        let mut state = self.state.lock();
        match state.stage {
            GraphStage::Building => {}
            GraphStage::Recording => {
                return Err(RuntimeError::Graph(
                    "explicit nodes cannot be added while a queue is recording".to_string(),
                ))
            }
            _ => {
                return Err(RuntimeError::Graph(
                    "graph is finalized and no longer accepts nodes".to_string(),
                ))
            }
        }
        Self::push_node(self.id, &mut state, command, depends_on.to_vec())
    }

    fn push_node(
        graph_id: u64,
        state: &mut GraphState,
        command: Command,
        deps: Vec<NodeId>,
    ) -> Result<NodeId> {
        // Dependencies must already exist, which keeps the graph acyclic.
        if let Some(bad) = deps.iter().find(|d| d.0 >= state.nodes.len()) {
            return Err(RuntimeError::Graph(format!(
                "node {} does not belong to graph {}",
                bad.0, graph_id
            )));
        }

        let id = NodeId::new(state.nodes.len());
        debug!(
            "Graph {}: node {} '{}' after {:?}",
            graph_id,
            id.0,
            command.label(),
            deps.iter().map(|d| d.0).collect::<Vec<_>>()
        );
        let mut deps = deps;
        deps.sort_unstable();
        deps.dedup();
        state.nodes.push(GraphNode { command, deps });
        Ok(id)
    }

    /// Record every command `issue` submits to `queue`.
    ///
    /// Recording stops whether or not `issue` succeeds; its error is returned
    /// afterwards.
    pub fn record<F>(&self, queue: &Queue, issue: F) -> Result<()>
    where
        F: FnOnce(&Queue) -> Result<()>,
    {
        self.begin_recording(queue)?;
        let issued = issue(queue);
        self.end_recording(queue)?;
        issued
    }

    /// Start capturing the commands submitted to `queue`
    pub fn begin_recording(&self, queue: &Queue) -> Result<()> {
        queue.attach_recording(self)
    }

    /// Stop capturing `queue`
    pub fn end_recording(&self, queue: &Queue) -> Result<()> {
        queue.detach_recording(self)
    }

    pub(crate) fn mark_recording(&self, queue_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.stage != GraphStage::Building {
            return Err(RuntimeError::Graph(format!(
                "graph {} cannot start recording in stage {:?}",
                self.id, state.stage
            )));
        }
        state.stage = GraphStage::Recording;
        state.recording_queue = Some(queue_id);
        debug!("Graph {}: recording queue {}", self.id, queue_id);
        Ok(())
    }

    pub(crate) fn mark_building(&self, queue_id: u64) {
        let mut state = self.state.lock();
        if state.recording_queue == Some(queue_id) {
            state.stage = GraphStage::Building;
            state.recording_queue = None;
            debug!("Graph {}: stopped recording queue {}", self.id, queue_id);
        }
    }

    /// Capture a command submitted to a recording queue
    pub(crate) fn record_command(
        &self,
        queue_id: u64,
        command: Command,
        wait_on: &[Event],
    ) -> Result<Event> {
        let mut state = self.state.lock();
        if state.stage != GraphStage::Recording || state.recording_queue != Some(queue_id) {
            return Err(RuntimeError::Graph(format!(
                "queue {} is not recording into graph {}",
                queue_id, self.id
            )));
        }

        let deps = wait_on
            .iter()
            .map(|event| match event.recorded_node() {
                Some((graph, node)) if graph == self.id => Ok(node),
                Some((graph, _)) => Err(RuntimeError::Graph(format!(
                    "event from graph {} used while recording graph {}",
                    graph, self.id
                ))),
                None => Err(RuntimeError::Graph(format!(
                    "live event '{}' cannot be a dependency of a recorded command",
                    event.label()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let node = Self::push_node(self.id, &mut state, command, deps)?;
        Ok(Event::recorded(self.id, node))
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Direct predecessors of `node`
    pub fn dependencies(&self, node: NodeId) -> Option<Vec<NodeId>> {
        self.state.lock().nodes.get(node.0).map(|n| n.deps.clone())
    }

    pub fn command_kind(&self, node: NodeId) -> Option<CommandKind> {
        self.state.lock().nodes.get(node.0).map(|n| n.command.kind())
    }

    /// All `(from, to)` edges
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(to, node)| node.deps.iter().map(move |from| (*from, NodeId::new(to))))
            .collect()
    }

    /// Nodes nothing depends on
    pub fn sinks(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        sink_indices(&state.nodes).into_iter().map(NodeId::new).collect()
    }

    /// Freeze the graph into its replayable form
    pub fn finalize(&self) -> Result<ExecutableGraph> {
        let mut state = self.state.lock();
        match state.stage {
            GraphStage::Building => {}
            GraphStage::Recording => {
                return Err(RuntimeError::Graph(
                    "cannot finalize while a queue is recording".to_string(),
                ))
            }
            stage => {
                return Err(RuntimeError::Graph(format!(
                    "graph {} already finalized ({:?})",
                    self.id, stage
                )))
            }
        }
        if state.nodes.is_empty() {
            return Err(RuntimeError::Graph("cannot finalize an empty graph".to_string()));
        }

        let order = topological_order(&state.nodes)?;
        let mut position = vec![0usize; state.nodes.len()];
        for (pos, &index) in order.iter().enumerate() {
            position[index] = pos;
        }

        let nodes: Vec<CompiledNode> = order
            .iter()
            .map(|&index| {
                let node = &state.nodes[index];
                CompiledNode {
                    id: NodeId::new(index),
                    command: node.command.clone(),
                    deps: node.deps.iter().map(|d| position[d.0]).collect(),
                }
            })
            .collect();
        let sinks = sink_indices(&state.nodes)
            .into_iter()
            .map(|index| position[index])
            .collect();

        state.stage = GraphStage::Compiled;
        info!("Finalized graph {} with {} nodes", self.id, nodes.len());

        Ok(ExecutableGraph {
            graph_id: self.id,
            nodes,
            sinks,
            last_replay: Mutex::new(None),
            replays: AtomicUsize::new(0),
            done: AtomicBool::new(false),
        })
    }
}

fn sink_indices(nodes: &[GraphNode]) -> Vec<usize> {
    let mut has_dependents = vec![false; nodes.len()];
    for node in nodes {
        for dep in &node.deps {
            has_dependents[dep.0] = true;
        }
    }
    (0..nodes.len()).filter(|&i| !has_dependents[i]).collect()
}

/// Kahn's algorithm; errors if a cycle is present
fn topological_order(nodes: &[GraphNode]) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for dep in &node.deps {
            dependents[dep.0].push(index);
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &next in &dependents[index] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(RuntimeError::Graph("dependency cycle detected".to_string()));
    }
    Ok(order)
}

struct CompiledNode {
    id: NodeId,
    command: Command,
    /// Positions of predecessors in the compiled order
    deps: Vec<usize>,
}

/// Immutable, replayable form of a task graph
pub struct ExecutableGraph {
    graph_id: u64,
    nodes: Vec<CompiledNode>,
    sinks: Vec<usize>,
    last_replay: Mutex<Option<Event>>,
    replays: AtomicUsize,
    done: AtomicBool,
}

impl std::fmt::Debug for ExecutableGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableGraph")
            .field("graph_id", &self.graph_id)
            .field("nodes", &self.nodes.len())
            .field("replays", &self.replay_count())
            .finish()
    }
}

impl ExecutableGraph {
    /// Id of the graph this was finalized from
    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of replays submitted so far
    pub fn replay_count(&self) -> usize {
        self.replays.load(Ordering::Relaxed)
    }

    pub fn stage(&self) -> GraphStage {
        if self.done.load(Ordering::Acquire) {
            GraphStage::Done
        } else if self.replay_count() > 0 {
            GraphStage::Replaying
        } else {
            GraphStage::Compiled
        }
    }

    /// The single node every other node leads to, if there is one
    pub fn completion_node(&self) -> Option<NodeId> {
        match self.sinks.as_slice() {
            [only] => Some(self.nodes[*only].id),
            _ => None,
        }
    }

    /// Node ids in the order replays dispatch them
    pub fn execution_order(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Dispatch one replay. Root nodes wait on the previous replay so replays
    /// of the same graph never overlap.
    pub(crate) fn launch(&self, executor: &Executor) -> Result<Event> {
        if self.done.load(Ordering::Acquire) {
            return Err(RuntimeError::Graph(format!(
                "graph {} is done and cannot be replayed",
                self.graph_id
            )));
        }

        let mut last = self.last_replay.lock();
        let previous: Vec<Event> = last.iter().cloned().collect();

        let mut events: Vec<Event> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let wait_on: Vec<Event> = if node.deps.is_empty() {
                previous.clone()
            } else {
                node.deps.iter().map(|&d| events[d].clone()).collect()
            };
            events.push(executor.dispatch(node.command.clone(), &wait_on)?);
        }

        let completion = match self.sinks.as_slice() {
            [only] => events[*only].clone(),
            sinks => {
                let sink_events: Vec<Event> = sinks.iter().map(|&s| events[s].clone()).collect();
                executor.dispatch(Command::barrier(), &sink_events)?
            }
        };

        let replay = self.replays.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Graph {}: replay {} dispatched", self.graph_id, replay);
        *last = Some(completion.clone());
        Ok(completion)
    }

    /// Wait for the last replay and retire the graph; returns the replay count
    pub fn finish(&self) -> Result<usize> {
        let last = self.last_replay.lock().clone();
        if let Some(event) = last {
            event.wait()?;
        }
        self.done.store(true, Ordering::Release);
        Ok(self.replay_count())
    }
}
