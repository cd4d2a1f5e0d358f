// simple-graphs: array reduction issued directly, as an explicit task graph
// and as a recorded task graph, with the latency of each

use anyhow::{Context, Result};
use clap::Parser;
use gpu_task_graphs::device::select_sample_device;
use gpu_task_graphs::strategies::{
    generate_input, reference_sum, relative_error, run_strategy, ReductionBuffers, ReductionPlan,
};
use gpu_task_graphs::{Device, GraphSupport, SampleConfig, Strategy};
use std::path::PathBuf;
use tracing::{debug, info};

/// Sum reduction via direct submission and task graphs
#[derive(Parser, Debug)]
#[command(name = "simple-graphs")]
#[command(about = "Compare direct submission with explicit and recorded task graphs", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of input elements
    #[arg(long)]
    elements: Option<usize>,

    /// Upper bound on partial-reduction groups
    #[arg(long)]
    max_groups: Option<usize>,

    /// Workers per group (power of two, 32..=512)
    #[arg(long)]
    group_size: Option<usize>,

    /// Replays per graph strategy
    #[arg(long)]
    iterations: Option<usize>,

    /// Input generator seed
    #[arg(long)]
    seed: Option<u64>,

    /// Append a host-callback node that reports each sum
    #[arg(long)]
    host_callback: bool,

    /// Override the emulated device's graph support level
    #[arg(long, value_enum)]
    graph_support: Option<GraphSupport>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn merge_into(&self, config: &mut SampleConfig) {
        if let Some(elements) = self.elements {
            config.elements = elements;
        }
        if let Some(max_groups) = self.max_groups {
            config.max_groups = max_groups;
        }
        if let Some(group_size) = self.group_size {
            config.group_size = group_size;
        }
        if let Some(iterations) = self.iterations {
            config.graph_launch_iterations = iterations;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.host_callback {
            config.host_callback = true;
        }
        if let Some(level) = self.graph_support {
            config.device.graph_support = level;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .init();

    info!("simple-graphs v{}", gpu_task_graphs::VERSION);

    let mut config = match &cli.config {
        Some(path) => SampleConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SampleConfig::default(),
    };
    cli.merge_into(&mut config);
    config.validate().context("Invalid configuration")?;
    debug!("Configuration: {:?}", config);

    let info = match select_sample_device(&config.device)? {
        Some(info) => info,
        None => {
            println!("No device with fp64 and task-graph support, exiting");
            return Ok(());
        }
    };
    println!(
        "Device '{}' graph support level {} ({})",
        info.name,
        info.graph_support.level(),
        info.graph_support
    );

    let device = Device::open(info, config.device.workers).context("Failed to open device")?;
    let plan = ReductionPlan::from_config(&config);

    println!("{} elements", plan.elements);
    println!("threads per block  = {}", plan.range.group_size);
    println!("Graph Launch iterations = {}", plan.iterations);

    // The memory budget bounds the input size.
    let buffers = ReductionBuffers::allocate(&device, &plan).context("Failed to allocate buffers")?;
    let input = generate_input(plan.elements, config.seed);
    let host_sum = reference_sum(&input);
    println!("Host sum = {:.6}", host_sum);
    buffers.load_input(&input)?;
    drop(input);

    let mut reports = Vec::with_capacity(Strategy::ALL.len());
    for strategy in Strategy::ALL {
        println!("\n[{}]", strategy);
        let report = run_strategy(strategy, &device, &buffers, &plan)
            .with_context(|| format!("{} failed", strategy))?;

        for sum in &report.sums {
            println!("Final reduced sum = {:.6}", sum);
        }
        println!("Elapsed time: {:.3} ms", report.elapsed_ms());
        reports.push(report);
    }

    println!();
    for report in &reports {
        if let Some(sum) = report.final_sum() {
            let error = relative_error(sum, host_sum);
            println!(
                "{:>15}: {:>10.3} ms (relative error {:.2e})",
                report.strategy.to_string(),
                report.elapsed_ms(),
                error
            );
        }
    }

    let stats = device.memory_stats();
    debug!(
        "Peak device memory: {} bytes over {} live allocations",
        stats.peak_bytes, stats.live_allocations
    );

    Ok(())
}
