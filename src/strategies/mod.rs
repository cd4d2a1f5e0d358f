//! The reduction issued three ways
//!
//! All three strategies run the same six commands over the same buffers:
//! copy-in, zero-fill of the partials, zero-fill of the result, the partial
//! reduction, the final reduction and copy-out. They differ only in how the
//! dependencies between those commands reach the device.

mod captured;
mod direct;
mod explicit;

pub use captured::captured_graph;
pub use direct::direct_submit;
pub use explicit::{build_reduction_graph, explicit_graph};

use crate::command::Command;
use crate::config::SampleConfig;
use crate::device::Device;
use crate::error::Result;
use crate::graph::ExecutableGraph;
use crate::kernels::{FinalReduce, NdRange, PartialReduce, Sum};
use crate::memory::Buffer;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// How the reduction is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Independent submissions wired together with events
    DirectSubmit,
    /// Graph built node by node, finalized once, replayed
    ExplicitGraph,
    /// Graph recorded from a live queue, finalized once, replayed
    CapturedGraph,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::DirectSubmit,
        Strategy::ExplicitGraph,
        Strategy::CapturedGraph,
    ];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::DirectSubmit => "direct-submit",
            Strategy::ExplicitGraph => "explicit-graph",
            Strategy::CapturedGraph => "captured-graph",
        };
        write!(f, "{}", name)
    }
}

/// Sums observed by the host-callback node, in completion order
pub type CallbackLog = Arc<Mutex<Vec<f64>>>;

/// Outcome of one strategy run
#[derive(Debug, Clone)]
pub struct StrategyReport {
    pub strategy: Strategy,
    pub elapsed: Duration,
    /// One sum per pass: one for direct submission, one per graph replay
    pub sums: Vec<f64>,
    /// Sums reported by the host-callback node, when enabled
    pub callback_sums: Vec<f64>,
}

impl StrategyReport {
    pub fn final_sum(&self) -> Option<f64> {
        self.sums.last().copied()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Launch geometry and pass count shared by the strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionPlan {
    pub elements: usize,
    /// Partial reduction launch
    pub range: NdRange,
    /// Final reduction launch, always a single group
    pub final_range: NdRange,
    /// Graph replays per graph strategy
    pub iterations: usize,
    pub host_callback: bool,
}

impl ReductionPlan {
    pub fn from_config(config: &SampleConfig) -> Self {
        Self {
            elements: config.elements,
            range: NdRange::new(config.num_groups(), config.group_size),
            final_range: NdRange::new(1, config.group_size),
            iterations: config.graph_launch_iterations,
            host_callback: config.host_callback,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.range.num_groups
    }
}

/// Buffers allocated once and reused by every strategy and replay
#[derive(Debug, Clone)]
pub struct ReductionBuffers {
    pub input_host: Buffer<f32>,
    pub input_device: Buffer<f32>,
    pub partials: Buffer<f64>,
    pub result_device: Buffer<f64>,
    pub result_host: Buffer<f64>,
}

impl ReductionBuffers {
    pub fn allocate(device: &Device, plan: &ReductionPlan) -> Result<Self> {
        let buffers = Self {
            input_host: device.alloc_host(plan.elements)?,
            input_device: device.alloc_device(plan.elements)?,
            partials: device.alloc_device(plan.num_groups())?,
            result_device: device.alloc_scalar()?,
            result_host: device.alloc_host(1)?,
        };
        info!(
            "Allocated reduction buffers: {} elements, {} partials",
            plan.elements,
            plan.num_groups()
        );
        Ok(buffers)
    }

    /// Fill the host input
    pub fn load_input(&self, values: &[f32]) -> Result<()> {
        self.input_host.copy_from_slice(values)
    }

    /// Host copy of the result scalar
    pub fn host_result(&self) -> f64 {
        self.result_host.read()[0]
    }

    /// The six commands of one reduction pass
    pub fn commands(&self, plan: &ReductionPlan) -> Result<ReductionCommands> {
        Ok(ReductionCommands {
            copy_in: Command::copy(&self.input_host, &self.input_device)?,
            zero_partials: Command::fill(&self.partials, 0.0),
            zero_result: Command::fill(&self.result_device, 0.0),
            partial_reduce: Command::kernel(
                PartialReduce::<f32, Sum>::with_sizes(
                    &self.input_device,
                    &self.partials,
                    plan.elements,
                    plan.num_groups(),
                ),
                plan.range,
            )?,
            final_reduce: Command::kernel(
                FinalReduce::<Sum>::with_size(&self.partials, &self.result_device, plan.num_groups()),
                plan.final_range,
            )?,
            copy_out: Command::copy(&self.result_device, &self.result_host)?,
        })
    }

    /// Host task that reports the copied-out sum and appends it to `log`
    pub fn host_callback(&self, strategy: Strategy, log: &CallbackLog) -> Command {
        let result = self.result_host.clone();
        let log = log.clone();
        Command::host_task(format!("{} host callback", strategy), move || {
            let sum = result.read()[0];
            println!("[{}] Host callback final reduced sum = {:.6}", strategy, sum);
            log.lock().push(sum);
            Ok(())
        })
    }
}

/// Commands of one pass, built once and cloned into graphs or queues
#[derive(Debug, Clone)]
pub struct ReductionCommands {
    pub copy_in: Command,
    pub zero_partials: Command,
    pub zero_result: Command,
    pub partial_reduce: Command,
    pub final_reduce: Command,
    pub copy_out: Command,
}

/// Seeded uniform input in `[0, 1)`
pub fn generate_input(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen::<f32>()).collect()
}

/// Sequential double-precision sum
pub fn reference_sum(values: &[f32]) -> f64 {
    values.iter().map(|&v| v as f64).sum()
}

/// `|a - b| / |b|`, or `|a - b|` when `b` is zero
pub fn relative_error(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs();
    if b == 0.0 {
        diff
    } else {
        diff / b.abs()
    }
}

/// Submit `graph` `iterations` times on a fresh queue, waiting for each replay
fn replay(
    device: &Device,
    graph: &ExecutableGraph,
    buffers: &ReductionBuffers,
    iterations: usize,
    strategy: Strategy,
) -> Result<Vec<f64>> {
    let exec_queue = device.create_queue();
    let mut sums = Vec::with_capacity(iterations);

    for iteration in 1..=iterations {
        exec_queue.submit_graph(graph)?.wait()?;
        let sum = buffers.host_result();
        info!("[{}] replay {}/{}: final reduced sum = {}", strategy, iteration, iterations, sum);
        sums.push(sum);
    }

    let replays = graph.finish()?;
    info!("[{}] graph {} retired after {} replays", strategy, graph.graph_id(), replays);
    Ok(sums)
}

/// Run one strategy over `buffers` and time it
pub fn run_strategy(
    strategy: Strategy,
    device: &Device,
    buffers: &ReductionBuffers,
    plan: &ReductionPlan,
) -> Result<StrategyReport> {
    info!("[{}] starting", strategy);
    let callbacks = CallbackLog::default();
    let start = Instant::now();

    let sums = match strategy {
        Strategy::DirectSubmit => vec![direct_submit(device, buffers, plan, &callbacks)?],
        Strategy::ExplicitGraph => explicit_graph(device, buffers, plan, &callbacks)?,
        Strategy::CapturedGraph => captured_graph(device, buffers, plan, &callbacks)?,
    };

    let elapsed = start.elapsed();
    let callback_sums = callbacks.lock().clone();
    info!("[{}] finished in {:?}", strategy, elapsed);

    Ok(StrategyReport {
        strategy,
        elapsed,
        sums,
        callback_sums,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_input_is_seeded() {
        let a = generate_input(1000, 7);
        let b = generate_input(1000, 7);
        let c = generate_input(1000, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_relative_error() {
        assert_eq!(relative_error(2.0, 2.0), 0.0);
        assert_eq!(relative_error(1.0, 0.0), 1.0);
        assert!((relative_error(101.0, 100.0) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_plan_from_config() {
        let config = SampleConfig {
            elements: 10_000,
            group_size: 128,
            ..SampleConfig::default()
        };
        let plan = ReductionPlan::from_config(&config);
        assert_eq!(plan.range, NdRange::new(79, 128));
        assert_eq!(plan.final_range, NdRange::new(1, 128));
        assert_eq!(plan.iterations, 3);
    }

    #[test]
    fn test_strategy_names() {
        let names: Vec<String> = Strategy::ALL.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["direct-submit", "explicit-graph", "captured-graph"]);
    }
}
