//! Replayable device commands
//!
//! A command is a type-erased operation over shared buffers. The same command
//! value runs once per direct submission or once per graph replay.

use crate::error::{Result, RuntimeError};
use crate::kernels::{Kernel, NdRange};
use crate::memory::Buffer;
use std::sync::Arc;

/// Command category, used for logging and graph inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Copy,
    Fill,
    Kernel,
    HostTask,
    Barrier,
}

type Body = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Operation executed by a device worker
#[derive(Clone)]
pub struct Command {
    kind: CommandKind,
    label: String,
    body: Body,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish()
    }
}

impl Command {
    /// Copy all of `src` into the front of `dst`
    pub fn copy<T>(src: &Buffer<T>, dst: &Buffer<T>) -> Result<Self>
    where
        T: Copy + Send + Sync + 'static,
    {
        if src.same_allocation(dst) {
            return Err(RuntimeError::Buffer(format!(
                "copy source and destination are both buffer #{}",
                src.id()
            )));
        }
        if dst.len() < src.len() {
            return Err(RuntimeError::Buffer(format!(
                "copy of {} elements into buffer #{} of {}",
                src.len(),
                dst.id(),
                dst.len()
            )));
        }

        let label = format!("copy #{} ({:?}) -> #{} ({:?})", src.id(), src.kind(), dst.id(), dst.kind());
        let (src, dst) = (src.clone(), dst.clone());
        Ok(Self {
            kind: CommandKind::Copy,
            label,
            body: Arc::new(move || {
                // Locks are taken in allocation order so opposing copies cannot deadlock.
                let (from, mut to) = if src.id() < dst.id() {
                    let from = src.read();
                    (from, dst.write())
                } else {
                    let to = dst.write();
                    (src.read(), to)
                };
                to[..from.len()].copy_from_slice(&from);
                Ok(())
            }),
        })
    }

    /// Set every element of `dst` to `value`
    pub fn fill<T>(dst: &Buffer<T>, value: T) -> Self
    where
        T: Copy + Send + Sync + 'static,
    {
        let label = format!("fill #{} ({} elements)", dst.id(), dst.len());
        let dst = dst.clone();
        Self {
            kind: CommandKind::Fill,
            label,
            body: Arc::new(move || {
                dst.write().fill(value);
                Ok(())
            }),
        }
    }

    /// Launch `kernel` over `range`; the launch is validated here, not at run time
    pub fn kernel<K>(kernel: K, range: NdRange) -> Result<Self>
    where
        K: Kernel + 'static,
    {
        kernel.check_launch(&range)?;
        let label = format!("{} <<<{}, {}>>>", kernel.name(), range.num_groups, range.group_size);
        Ok(Self {
            kind: CommandKind::Kernel,
            label,
            body: Arc::new(move || kernel.run(&range)),
        })
    }

    /// Run a host closure in dependency order with device work
    pub fn host_task<F>(label: impl Into<String>, task: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            kind: CommandKind::HostTask,
            label: label.into(),
            body: Arc::new(task),
        }
    }

    /// No-op whose only effect is its dependencies
    pub fn barrier() -> Self {
        Self {
            kind: CommandKind::Barrier,
            label: "barrier".to_string(),
            body: Arc::new(|| Ok(())),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the command on the calling thread
    pub fn execute(&self) -> Result<()> {
        (self.body)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, MemoryTracker};

    fn tracker() -> Arc<MemoryTracker> {
        Arc::new(MemoryTracker::new(1 << 20))
    }

    #[test]
    fn test_copy_and_fill() {
        let t = tracker();
        let host = Buffer::<f32>::allocate(MemoryKind::Host, 3, t.clone()).unwrap();
        let device = Buffer::<f32>::allocate(MemoryKind::Device, 4, t).unwrap();
        host.copy_from_slice(&[1.0, 2.0, 3.0]).unwrap();

        Command::fill(&device, 9.0).execute().unwrap();
        let copy = Command::copy(&host, &device).unwrap();
        assert_eq!(copy.kind(), CommandKind::Copy);
        copy.execute().unwrap();

        assert_eq!(device.to_vec(), vec![1.0, 2.0, 3.0, 9.0]);
    }

    #[test]
    fn test_copy_rejects_bad_shapes() {
        let t = tracker();
        let small = Buffer::<f64>::allocate(MemoryKind::Device, 1, t.clone()).unwrap();
        let large = Buffer::<f64>::allocate(MemoryKind::Host, 2, t).unwrap();

        assert!(Command::copy(&large, &small).is_err());
        assert!(Command::copy(&small, &small).is_err());
        assert!(Command::copy(&small, &large).is_ok());
    }

    #[test]
    fn test_host_task_error_propagates() {
        let task = Command::host_task("report", || Err(RuntimeError::Queue("closed".into())));
        assert_eq!(task.kind(), CommandKind::HostTask);
        assert_eq!(task.label(), "report");
        assert!(task.execute().is_err());
        assert!(Command::barrier().execute().is_ok());
    }
}
