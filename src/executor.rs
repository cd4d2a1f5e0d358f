// Device command executor
// Dependency-resolving dispatch onto a fixed pool of device workers

use crate::command::Command;
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Ready-to-run unit of work for a device worker
struct Job {
    command: Command,
    completion: Event,
}

/// Executor counters
#[derive(Debug, Default)]
pub struct ExecutorStats {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of executor counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSnapshot {
    pub submitted: u64,
    pub executed: u64,
    pub failed: u64,
}

impl ExecutorStats {
    pub fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Command held back until its wait list resolves
struct PendingCommand {
    remaining: AtomicUsize,
    failure: Mutex<Option<String>>,
    job: Mutex<Option<Job>>,
    ready: Sender<Job>,
    stats: Arc<ExecutorStats>,
}

impl PendingCommand {
    /// Count one dependency (or the submission guard) as resolved
    fn release(&self, outcome: std::result::Result<(), String>) {
        if let Err(reason) = outcome {
            self.failure.lock().get_or_insert(reason);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let Some(job) = self.job.lock().take() else {
            return;
        };
        if let Some(reason) = self.failure.lock().take() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            job.completion
                .signal(Err(format!("dependency failed: {}", reason)));
            return;
        }

        trace!("Command ready: {}", job.command.label());
        if let Err(err) = self.ready.send(job) {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            err.into_inner()
                .completion
                .signal(Err("device executor has shut down".to_string()));
        }
    }
}

/// Worker pool that runs commands once their dependencies complete
pub struct Executor {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ExecutorStats>,
}

impl Executor {
    /// Spawn `num_workers` device workers
    pub fn new(num_workers: usize) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let stats = Arc::new(ExecutorStats::default());

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let receiver = receiver.clone();
            let stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("device-worker-{}", id))
                .spawn(move || worker_loop(receiver, stats))?;
            workers.push(handle);
        }

        debug!("Started device executor with {} workers", num_workers);
        Ok(Self {
            sender: Some(sender),
            workers,
            stats,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> ExecutorSnapshot {
        self.stats.snapshot()
    }

    /// Submit `command`; it runs after every event in `wait_on` completes.
    ///
    /// All of `wait_on` must be live events.
    pub fn dispatch(&self, command: Command, wait_on: &[Event]) -> Result<Event> {
        let sender = self.sender.as_ref().ok_or(RuntimeError::ExecutorShutdown)?;
        if let Some(recorded) = wait_on.iter().find(|e| e.is_recorded()) {
            return Err(RuntimeError::Queue(format!(
                "cannot wait on {} outside of a recording",
                recorded.label()
            )));
        }

        let completion = Event::pending(command.label());
        debug!("Dispatch '{}' after {} event(s)", command.label(), wait_on.len());
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let pending = Arc::new(PendingCommand {
            // One extra count guards against dispatching before every
            // continuation has been registered.
            remaining: AtomicUsize::new(wait_on.len() + 1),
            failure: Mutex::new(None),
            job: Mutex::new(Some(Job {
                command,
                completion: completion.clone(),
            })),
            ready: sender.clone(),
            stats: self.stats.clone(),
        });

        for event in wait_on {
            let pending = pending.clone();
            event.on_complete(Box::new(move |outcome| pending.release(outcome)))?;
        }
        pending.release(Ok(()));

        Ok(completion)
    }
}

fn worker_loop(receiver: Receiver<Job>, stats: Arc<ExecutorStats>) {
    while let Ok(job) = receiver.recv() {
        let outcome = job.command.execute().map_err(|e| e.to_string());
        match &outcome {
            Ok(()) => {
                stats.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!("Command '{}' failed: {}", job.command.label(), reason);
            }
        }
        job.completion.signal(outcome);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Workers drain the channel and exit once every sender is gone.
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Device executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Command {
        let log = log.clone();
        Command::host_task(name, move || {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn test_dependencies_order_execution() {
        let executor = Executor::new(4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let gate = Event::pending("gate");
        let a = executor.dispatch(record(&log, "a"), &[gate.clone()]).unwrap();
        let b = executor.dispatch(record(&log, "b"), &[a.clone()]).unwrap();
        let c = executor.dispatch(record(&log, "c"), &[a, b.clone()]).unwrap();

        assert!(log.lock().is_empty());
        gate.signal(Ok(()));
        c.wait().unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(executor.stats().executed, 3);
    }

    #[test]
    fn test_failure_skips_dependents() {
        let executor = Executor::new(2).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let bad = executor
            .dispatch(
                Command::host_task("bad", || Err(RuntimeError::Queue("nope".into()))),
                &[],
            )
            .unwrap();
        let after = executor.dispatch(record(&log, "after"), &[bad.clone()]).unwrap();

        assert!(after.wait().is_err());
        assert_eq!(bad.status(), EventStatus::Failed);
        assert!(log.lock().is_empty());
        assert_eq!(executor.stats().failed, 2);
    }

    #[test]
    fn test_recorded_events_rejected() {
        let executor = Executor::new(1).unwrap();
        let recorded = Event::recorded(1, crate::graph::NodeId::new(0));
        assert!(executor.dispatch(Command::barrier(), &[recorded]).is_err());
    }

    #[test]
    fn test_drop_drains_pending_work() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let executor = Executor::new(2).unwrap();
            for _ in 0..16 {
                executor.dispatch(record(&log, "x"), &[]).unwrap();
            }
        }
        assert_eq!(log.lock().len(), 16);
    }
}
