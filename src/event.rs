//! Completion events for submitted commands

use crate::error::{Result, RuntimeError};
use crate::graph::NodeId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed,
}

/// Callback run once when a live event resolves
pub(crate) type Continuation = Box<dyn FnOnce(std::result::Result<(), String>) + Send>;

struct EventState {
    status: EventStatus,
    failure: Option<String>,
    continuations: Vec<Continuation>,
}

struct EventInner {
    id: u64,
    label: String,
    state: Mutex<EventState>,
    signalled: Condvar,
}

#[derive(Clone)]
enum EventKind {
    Live(Arc<EventInner>),
    Recorded { graph: u64, node: NodeId },
}

/// Handle to a submitted command.
///
/// Live events resolve when the command runs. Events returned while a queue is
/// recording name a graph node instead and only serve as wait-list entries for
/// later recorded commands.
#[derive(Clone)]
pub struct Event {
    kind: EventKind,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::Live(inner) => f
                .debug_struct("Event")
                .field("id", &inner.id)
                .field("label", &inner.label)
                .field("status", &inner.state.lock().status)
                .finish(),
            EventKind::Recorded { graph, node } => f
                .debug_struct("RecordedEvent")
                .field("graph", graph)
                .field("node", node)
                .finish(),
        }
    }
}

impl Event {
    pub(crate) fn pending(label: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Live(Arc::new(EventInner {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                state: Mutex::new(EventState {
                    status: EventStatus::Pending,
                    failure: None,
                    continuations: Vec::new(),
                }),
                signalled: Condvar::new(),
            })),
        }
    }

    pub(crate) fn recorded(graph: u64, node: NodeId) -> Self {
        Self {
            kind: EventKind::Recorded { graph, node },
        }
    }

    /// Graph and node this event was recorded as, if any
    pub fn recorded_node(&self) -> Option<(u64, NodeId)> {
        match self.kind {
            EventKind::Recorded { graph, node } => Some((graph, node)),
            EventKind::Live(_) => None,
        }
    }

    /// True for events produced by a recording queue
    pub fn is_recorded(&self) -> bool {
        matches!(self.kind, EventKind::Recorded { .. })
    }

    /// Label of the command behind this event
    pub fn label(&self) -> String {
        match &self.kind {
            EventKind::Live(inner) => inner.label.clone(),
            EventKind::Recorded { node, .. } => format!("recorded node {}", node.index()),
        }
    }

    /// Current status; recorded events report `Pending`
    pub fn status(&self) -> EventStatus {
        match &self.kind {
            EventKind::Live(inner) => inner.state.lock().status,
            EventKind::Recorded { .. } => EventStatus::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    /// Block until the command has run
    pub fn wait(&self) -> Result<()> {
        let inner = match &self.kind {
            EventKind::Live(inner) => inner,
            EventKind::Recorded { .. } => {
                return Err(RuntimeError::Graph(
                    "cannot wait on an event recorded into a graph".to_string(),
                ))
            }
        };

        let mut state = inner.state.lock();
        while state.status == EventStatus::Pending {
            inner.signalled.wait(&mut state);
        }
        match state.status {
            EventStatus::Failed => Err(RuntimeError::command_failed(
                inner.label.clone(),
                state.failure.clone().unwrap_or_default(),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve the event and run registered continuations outside the lock
    pub(crate) fn signal(&self, outcome: std::result::Result<(), String>) {
        let EventKind::Live(inner) = &self.kind else {
            return;
        };

        let continuations = {
            let mut state = inner.state.lock();
            if state.status != EventStatus::Pending {
                return;
            }
            match &outcome {
                Ok(()) => state.status = EventStatus::Complete,
                Err(reason) => {
                    state.status = EventStatus::Failed;
                    state.failure = Some(reason.clone());
                }
            }
            std::mem::take(&mut state.continuations)
        };
        inner.signalled.notify_all();

        for continuation in continuations {
            continuation(outcome.clone());
        }
    }

    /// Run `continuation` when the event resolves, immediately if it already has
    pub(crate) fn on_complete(&self, continuation: Continuation) -> Result<()> {
        let EventKind::Live(inner) = &self.kind else {
            return Err(RuntimeError::Graph(
                "recorded events can only be waited on by recorded commands".to_string(),
            ));
        };

        let outcome = {
            let mut state = inner.state.lock();
            match state.status {
                EventStatus::Pending => {
                    state.continuations.push(continuation);
                    return Ok(());
                }
                EventStatus::Complete => Ok(()),
                EventStatus::Failed => Err(state.failure.clone().unwrap_or_default()),
            }
        };
        continuation(outcome);
        Ok(())
    }
}
