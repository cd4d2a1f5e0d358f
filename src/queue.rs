//! Out-of-order command queues
//!
//! Commands submitted to a queue may run in any order; ordering comes only
//! from the wait lists passed with each submission. While a graph is recording
//! the queue, submissions become graph nodes instead of running.

use crate::command::Command;
use crate::device::Device;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, EventStatus};
use crate::graph::{ExecutableGraph, TaskGraph};
use crate::kernels::{Kernel, NdRange};
use crate::memory::Buffer;
use parking_lot::Mutex;
use tracing::{debug, warn};

struct CaptureSession {
    graph: TaskGraph,
    events: Vec<Event>,
}

/// Command queue bound to one device
pub struct Queue {
    id: u64,
    device: Device,
    submitted: Mutex<Vec<Event>>,
    capture: Mutex<Option<CaptureSession>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("recording", &self.is_recording())
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(id: u64, device: Device) -> Self {
        debug!("Created queue {}", id);
        Self {
            id,
            device,
            submitted: Mutex::new(Vec::new()),
            capture: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_recording(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Submit `command` to run after every event in `wait_on`
    pub fn submit(&self, command: Command, wait_on: &[Event]) -> Result<Event> {
        {
            let mut capture = self.capture.lock();
            if let Some(session) = capture.as_mut() {
                let event = session.graph.record_command(self.id, command, wait_on)?;
                session.events.push(event.clone());
                return Ok(event);
            }
        }

        let event = self.device.executor().dispatch(command, wait_on)?;
        self.track(event.clone());
        Ok(event)
    }

    fn track(&self, event: Event) {
        let mut submitted = self.submitted.lock();
        submitted.retain(|e| e.status() != EventStatus::Complete);
        submitted.push(event);
    }

    /// Copy all of `src` into `dst`
    pub fn memcpy<T>(&self, src: &Buffer<T>, dst: &Buffer<T>, wait_on: &[Event]) -> Result<Event>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.submit(Command::copy(src, dst)?, wait_on)
    }

    /// Fill `dst` with `value`
    pub fn fill<T>(&self, dst: &Buffer<T>, value: T, wait_on: &[Event]) -> Result<Event>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.submit(Command::fill(dst, value), wait_on)
    }

    /// Launch `kernel` over `range`
    pub fn launch<K>(&self, kernel: K, range: NdRange, wait_on: &[Event]) -> Result<Event>
    where
        K: Kernel + 'static,
    {
        self.submit(Command::kernel(kernel, range)?, wait_on)
    }

    /// Run a host closure in dependency order with device work
    pub fn host_task<F>(&self, label: impl Into<String>, task: F, wait_on: &[Event]) -> Result<Event>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.submit(Command::host_task(label, task), wait_on)
    }

    /// Barrier after `wait_on`, or after everything submitted so far when
    /// `wait_on` is empty
    pub fn barrier(&self, wait_on: &[Event]) -> Result<Event> {
        if !wait_on.is_empty() {
            return self.submit(Command::barrier(), wait_on);
        }

        let previous = match self.capture.lock().as_ref() {
            Some(session) => session.events.clone(),
            None => self.submitted.lock().clone(),
        };
        self.submit(Command::barrier(), &previous)
    }

    /// Replay a finalized graph
    pub fn submit_graph(&self, graph: &ExecutableGraph) -> Result<Event> {
        if self.is_recording() {
            return Err(RuntimeError::Queue(format!(
                "queue {} cannot replay a graph while recording",
                self.id
            )));
        }
        let event = graph.launch(self.device.executor())?;
        self.track(event.clone());
        Ok(event)
    }

    /// Block until everything submitted so far has run; reports the first failure
    pub fn wait(&self) -> Result<()> {
        let events = std::mem::take(&mut *self.submitted.lock());
        let mut first_error = None;
        for event in events {
            if let Err(err) = event.wait() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn attach_recording(&self, graph: &TaskGraph) -> Result<()> {
        let mut capture = self.capture.lock();
        if let Some(session) = capture.as_ref() {
            return Err(RuntimeError::Queue(format!(
                "queue {} is already recording graph {}",
                self.id,
                session.graph.id()
            )));
        }
        graph.mark_recording(self.id)?;
        *capture = Some(CaptureSession {
            graph: graph.clone(),
            events: Vec::new(),
        });
        Ok(())
    }

    pub(crate) fn detach_recording(&self, graph: &TaskGraph) -> Result<()> {
        let mut capture = self.capture.lock();
        match capture.take() {
            Some(session) if session.graph.id() == graph.id() => {
                graph.mark_building(self.id);
                debug!(
                    "Queue {}: recorded {} command(s) into graph {}",
                    self.id,
                    session.events.len(),
                    graph.id()
                );
                Ok(())
            }
            other => {
                *capture = other;
                Err(RuntimeError::Queue(format!(
                    "queue {} is not recording graph {}",
                    self.id,
                    graph.id()
                )))
            }
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some(session) = self.capture.get_mut().take() {
            session.graph.mark_building(self.id);
        }
        if let Err(err) = self.wait() {
            warn!("Queue {} dropped with failed work: {}", self.id, err);
        }
    }
}
