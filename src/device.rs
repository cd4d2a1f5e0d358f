// Device enumeration, selection and handles
// Emulated accelerator backed by a host worker pool

use crate::error::{Result, RuntimeError};
use crate::executor::{Executor, ExecutorSnapshot};
use crate::kernels::{MAX_GROUP_SIZE, SUB_GROUP_SIZE};
use crate::memory::{Buffer, MemoryKind, MemoryStats, MemoryTracker};
use crate::queue::Queue;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Task-graph support level reported by a device
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum GraphSupport {
    /// No graph support
    None,
    /// Graphs are accepted and replayed command by command
    Emulated,
    /// Graphs are replayed as a single submission
    Native,
}

impl GraphSupport {
    /// Numeric level, 0 for unsupported
    pub fn level(self) -> u32 {
        match self {
            GraphSupport::None => 0,
            GraphSupport::Emulated => 1,
            GraphSupport::Native => 2,
        }
    }
}

impl fmt::Display for GraphSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphSupport::None => "none",
            GraphSupport::Emulated => "emulated",
            GraphSupport::Native => "native",
        };
        write!(f, "{}", name)
    }
}

/// Optional device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aspect {
    Fp64,
    Fp16,
    TaskGraph,
}

impl fmt::Display for Aspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aspect::Fp64 => "fp64",
            Aspect::Fp16 => "fp16",
            Aspect::TaskGraph => "task-graph",
        };
        write!(f, "{}", name)
    }
}

/// Static description of a device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    pub compute_units: usize,
    pub max_group_size: usize,
    pub sub_group_size: usize,
    pub local_memory_bytes: usize,
    pub global_memory_bytes: usize,
    pub supports_fp64: bool,
    pub supports_fp16: bool,
    pub graph_support: GraphSupport,
}

impl DeviceInfo {
    pub fn has_aspect(&self, aspect: Aspect) -> bool {
        match aspect {
            Aspect::Fp64 => self.supports_fp64,
            Aspect::Fp16 => self.supports_fp16,
            Aspect::TaskGraph => self.graph_support > GraphSupport::None,
        }
    }
}

/// Emulated device settings, the `[device]` table of the sample config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_graph_support")]
    pub graph_support: GraphSupport,
    #[serde(default = "default_fp64")]
    pub fp64: bool,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
}

fn default_graph_support() -> GraphSupport {
    GraphSupport::Native
}

fn default_fp64() -> bool {
    true
}

fn default_memory_limit_mb() -> usize {
    4096
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            graph_support: default_graph_support(),
            fp64: default_fp64(),
            workers: None,
            memory_limit_mb: default_memory_limit_mb(),
        }
    }
}

/// Devices visible to this process
pub fn enumerate(config: &DeviceConfig) -> Vec<DeviceInfo> {
    let compute_units = num_cpus::get();
    vec![
        DeviceInfo {
            id: 0,
            name: "host-emulated accelerator".to_string(),
            compute_units,
            max_group_size: MAX_GROUP_SIZE,
            sub_group_size: SUB_GROUP_SIZE,
            local_memory_bytes: 64 * 1024,
            global_memory_bytes: config.memory_limit_mb * 1024 * 1024,
            supports_fp64: config.fp64,
            supports_fp16: true,
            graph_support: config.graph_support,
        },
        DeviceInfo {
            id: 1,
            name: "host-emulated accelerator (reduced)".to_string(),
            compute_units: 1,
            max_group_size: 256,
            sub_group_size: SUB_GROUP_SIZE,
            local_memory_bytes: 16 * 1024,
            global_memory_bytes: config.memory_limit_mb * 1024 * 1024,
            supports_fp64: false,
            supports_fp16: true,
            graph_support: GraphSupport::None,
        },
    ]
}

/// Picks a device by required aspects, preferring more capable ones
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    required: Vec<Aspect>,
}

impl DeviceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, aspect: Aspect) -> Self {
        if !self.required.contains(&aspect) {
            self.required.push(aspect);
        }
        self
    }

    fn score(device: &DeviceInfo) -> usize {
        let mut score = device.compute_units + device.max_group_size / 32;
        score += device.graph_support.level() as usize * 100;
        if device.supports_fp64 {
            score += 10;
        }
        score
    }

    /// Best device that has every required aspect
    pub fn select(&self, devices: &[DeviceInfo]) -> Result<DeviceInfo> {
        let best = devices
            .iter()
            .filter(|d| self.required.iter().all(|a| d.has_aspect(*a)))
            .max_by_key(|d| (Self::score(d), std::cmp::Reverse(d.id)))
            .cloned()
            .ok_or(RuntimeError::NoDevice)?;

        debug!("Device {} score: {}", best.id, Self::score(&best));
        info!("Selected device {}: {}", best.id, best.name);
        Ok(best)
    }
}

/// Fail unless `info` supports graphs at `required` level or better
pub fn require_graph_support(info: &DeviceInfo, required: u32) -> Result<()> {
    let found = info.graph_support.level();
    if found < required {
        warn!("Device '{}' graph support level {} < {}", info.name, found, required);
        return Err(RuntimeError::UnsupportedDevice { found, required });
    }
    Ok(())
}

/// Pick the device the reduction sample runs on.
///
/// Returns `None` when no device has fp64 and task-graph support at level 1
/// or better, which the binary reports as a clean early exit.
pub fn select_sample_device(config: &DeviceConfig) -> Result<Option<DeviceInfo>> {
    let gated = DeviceSelector::new()
        .require(Aspect::Fp64)
        .select(&enumerate(config))
        .and_then(|info| require_graph_support(&info, 1).map(|_| info));

    match gated {
        Ok(info) => Ok(Some(info)),
        Err(err) if err.is_unsupported_device() => {
            warn!("No device can run the sample: {}", err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

struct DeviceInner {
    info: DeviceInfo,
    executor: Executor,
    memory: Arc<MemoryTracker>,
    next_queue_id: AtomicU64,
}

/// Opened device; clones share the same executor and memory budget
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.info.id)
            .field("name", &self.inner.info.name)
            .finish()
    }
}

impl Device {
    /// Open `info` with `workers` command workers (defaults to compute units)
    pub fn open(info: DeviceInfo, workers: Option<usize>) -> Result<Self> {
        let workers = workers.unwrap_or(info.compute_units).max(1);
        let executor = Executor::new(workers)?;
        let memory = Arc::new(MemoryTracker::new(info.global_memory_bytes));

        info!(
            "Opened device {} '{}' ({} workers, {} MB)",
            info.id,
            info.name,
            workers,
            info.global_memory_bytes / (1024 * 1024)
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                info,
                executor,
                memory,
                next_queue_id: AtomicU64::new(1),
            }),
        })
    }

    /// Open the first enumerated device with `config`
    pub fn emulated(config: &DeviceConfig) -> Result<Self> {
        let info = enumerate(config)
            .into_iter()
            .next()
            .ok_or(RuntimeError::NoDevice)?;
        Self::open(info, config.workers)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn graph_support(&self) -> GraphSupport {
        self.inner.info.graph_support
    }

    /// Fail with `MissingAspect` for the first aspect the device lacks
    pub fn check_aspects(&self, aspects: &[Aspect]) -> Result<()> {
        match aspects.iter().find(|a| !self.inner.info.has_aspect(**a)) {
            Some(missing) => Err(RuntimeError::MissingAspect {
                device: self.inner.info.name.clone(),
                aspect: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Pinned host allocation
    pub fn alloc_host<T>(&self, len: usize) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        Buffer::allocate(MemoryKind::Host, len, self.inner.memory.clone())
    }

    /// Device-resident allocation
    pub fn alloc_device<T>(&self, len: usize) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        Buffer::allocate(MemoryKind::Device, len, self.inner.memory.clone())
    }

    /// Single-element device allocation
    pub fn alloc_scalar<T>(&self) -> Result<Buffer<T>>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.alloc_device(1)
    }

    /// New out-of-order queue
    pub fn create_queue(&self) -> Queue {
        let id = self.inner.next_queue_id.fetch_add(1, Ordering::Relaxed);
        Queue::new(id, self.clone())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.memory.stats()
    }

    pub fn executor_stats(&self) -> ExecutorSnapshot {
        self.inner.executor.stats()
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }
}
