//! End-to-end tests for the three reduction strategies

use gpu_task_graphs::strategies::{
    build_reduction_graph, captured_graph, explicit_graph, generate_input, reference_sum,
    relative_error, run_strategy, CallbackLog, ReductionBuffers, ReductionPlan,
};
use gpu_task_graphs::{
    Command, Device, DeviceConfig, FinalReduce, GraphStage, GraphSupport, NdRange, RuntimeError,
    SampleConfig, Strategy, Sum, TaskGraph,
};
use pretty_assertions::assert_eq;

struct Fixture {
    device: Device,
    buffers: ReductionBuffers,
    plan: ReductionPlan,
    host_sum: f64,
}

fn config(elements: usize) -> SampleConfig {
    SampleConfig {
        elements,
        device: DeviceConfig {
            workers: Some(4),
            ..DeviceConfig::default()
        },
        ..SampleConfig::default()
    }
}

fn fixture(config: &SampleConfig) -> Fixture {
    let device = Device::emulated(&config.device).expect("Failed to open device");
    let plan = ReductionPlan::from_config(config);
    let buffers = ReductionBuffers::allocate(&device, &plan).expect("Failed to allocate");
    let input = generate_input(config.elements, config.seed);
    buffers.load_input(&input).unwrap();

    Fixture {
        device,
        buffers,
        plan,
        host_sum: reference_sum(&input),
    }
}

fn run_all(f: &Fixture) -> Vec<f64> {
    Strategy::ALL
        .iter()
        .map(|&strategy| {
            let report = run_strategy(strategy, &f.device, &f.buffers, &f.plan)
                .unwrap_or_else(|e| panic!("{} failed: {}", strategy, e));
            assert_eq!(report.strategy, strategy);
            report.final_sum().unwrap()
        })
        .collect()
}

#[test]
fn test_strategies_agree_with_reference() {
    let f = fixture(&config(100_003));
    let sums = run_all(&f);

    for (strategy, sum) in Strategy::ALL.iter().zip(&sums) {
        let error = relative_error(*sum, f.host_sum);
        assert!(error < 1e-6, "{}: {} vs {} ({:e})", strategy, sum, f.host_sum, error);
    }
    assert!(relative_error(sums[1], sums[0]) < 1e-6);
    assert!(relative_error(sums[2], sums[0]) < 1e-6);
}

#[test]
fn test_single_element() {
    let f = fixture(&config(1));
    assert_eq!(f.plan.range, NdRange::new(1, 256));

    let expected = f.buffers.input_host.to_vec()[0] as f64;
    for sum in run_all(&f) {
        assert_eq!(sum, expected);
    }
}

#[test]
fn test_sizes_around_group_multiples() {
    for elements in [256 * 8, 256 * 8 + 17, 255, 31] {
        let f = fixture(&config(elements));
        for sum in run_all(&f) {
            assert!(
                relative_error(sum, f.host_sum) < 1e-9,
                "{} elements: {} vs {}",
                elements,
                sum,
                f.host_sum
            );
        }
    }
}

#[test]
fn test_more_elements_than_threads() {
    let mut config = config(50_000);
    config.max_groups = 4;
    config.group_size = 64;
    let f = fixture(&config);
    assert_eq!(f.plan.range, NdRange::new(4, 64));

    for sum in run_all(&f) {
        assert!(relative_error(sum, f.host_sum) < 1e-9);
    }
}

#[test]
fn test_replays_are_idempotent() {
    let mut config = config(10_000);
    config.graph_launch_iterations = 10;
    let f = fixture(&config);

    let explicit = explicit_graph(&f.device, &f.buffers, &f.plan, &CallbackLog::default()).unwrap();
    let captured = captured_graph(&f.device, &f.buffers, &f.plan, &CallbackLog::default()).unwrap();

    assert_eq!(explicit.len(), 10);
    assert_eq!(explicit, vec![explicit[0]; 10]);
    assert_eq!(captured, vec![explicit[0]; 10]);
}

#[test]
fn test_full_size_input_sums_to_half() {
    let mut config = config(1 << 24);
    config.graph_launch_iterations = 1;
    let f = fixture(&config);
    assert_eq!(f.plan.range, NdRange::new(512, 256));

    let sums = explicit_graph(&f.device, &f.buffers, &f.plan, &CallbackLog::default()).unwrap();
    let half = (1u64 << 23) as f64;
    assert!(relative_error(sums[0], half) < 1e-3, "sum {}", sums[0]);
    assert!(relative_error(sums[0], f.host_sum) < 1e-6);
}

#[test]
fn test_final_reduce_rejects_multiple_groups() {
    let f = fixture(&config(1024));
    let kernel = FinalReduce::<Sum>::new(&f.buffers.partials, &f.buffers.result_device);

    let err = Command::kernel(kernel, NdRange::new(2, 256)).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidLaunch(_)));
}

#[test]
fn test_recorded_graph_matches_explicit_graph() {
    let f = fixture(&config(4096));

    let (explicit, completion) =
        build_reduction_graph(f.buffers.commands(&f.plan).unwrap(), None).unwrap();

    let commands = f.buffers.commands(&f.plan).unwrap();
    let queue = f.device.create_queue();
    let recorded = TaskGraph::new();
    recorded
        .record(&queue, |q| {
            let copy_in = q.submit(commands.copy_in, &[])?;
            let zero_partials = q.submit(commands.zero_partials, &[])?;
            let zero_result = q.submit(commands.zero_result, &[])?;
            let partial = q.submit(commands.partial_reduce, &[copy_in, zero_partials])?;
            let reduced = q.submit(commands.final_reduce, &[partial, zero_result])?;
            q.submit(commands.copy_out, &[reduced])?;
            Ok(())
        })
        .unwrap();

    assert_eq!(recorded.node_count(), 6);
    assert_eq!(recorded.edges(), explicit.edges());
    assert_eq!(recorded.sinks(), vec![completion]);
    for node in explicit.sinks().into_iter().chain(explicit.edges().into_iter().map(|e| e.0)) {
        assert_eq!(recorded.command_kind(node), explicit.command_kind(node));
    }

    let exec = recorded.finalize().unwrap();
    assert_eq!(exec.completion_node(), Some(completion));
}

#[test]
fn test_host_callback_reports_every_pass() {
    let mut config = config(2048);
    config.host_callback = true;
    config.graph_launch_iterations = 2;
    let f = fixture(&config);

    let direct = run_strategy(Strategy::DirectSubmit, &f.device, &f.buffers, &f.plan).unwrap();
    assert_eq!(direct.callback_sums, direct.sums);

    for strategy in [Strategy::ExplicitGraph, Strategy::CapturedGraph] {
        let report = run_strategy(strategy, &f.device, &f.buffers, &f.plan).unwrap();
        assert_eq!(report.sums.len(), 2);
        assert_eq!(report.callback_sums, report.sums);
    }

    // The callback leaves the copied-out result readable by the host.
    assert_eq!(f.buffers.host_result(), direct.sums[0]);
    assert!(relative_error(f.buffers.host_result(), f.host_sum) < 1e-9);
}

#[test]
fn test_finished_graph_rejects_replay() {
    let f = fixture(&config(512));
    let (graph, _) = build_reduction_graph(f.buffers.commands(&f.plan).unwrap(), None).unwrap();
    let exec = graph.finalize().unwrap();
    let queue = f.device.create_queue();

    assert_eq!(exec.stage(), GraphStage::Compiled);
    queue.submit_graph(&exec).unwrap().wait().unwrap();
    queue.submit_graph(&exec).unwrap().wait().unwrap();
    assert_eq!(exec.stage(), GraphStage::Replaying);

    assert_eq!(exec.finish().unwrap(), 2);
    assert_eq!(exec.stage(), GraphStage::Done);
    assert!(queue.submit_graph(&exec).is_err());
    assert!(relative_error(f.buffers.host_result(), f.host_sum) < 1e-9);
}

#[test]
fn test_failed_node_fails_its_dependents() {
    let f = fixture(&config(512));
    let graph = TaskGraph::new();
    let fill = graph
        .add(Command::fill(&f.buffers.result_host, 7.0), &[])
        .unwrap();
    let failing = graph
        .add(
            Command::host_task("broken", || Err(RuntimeError::Buffer("corrupt".into()))),
            &[fill],
        )
        .unwrap();
    graph
        .add(Command::fill(&f.buffers.result_host, 9.0), &[failing])
        .unwrap();

    let exec = graph.finalize().unwrap();
    let queue = f.device.create_queue();
    let err = queue.submit_graph(&exec).unwrap().wait().unwrap_err();

    assert!(matches!(err, RuntimeError::CommandFailed { .. }));
    assert_eq!(f.buffers.host_result(), 7.0);
}

#[test]
fn test_graph_strategies_need_graph_support() {
    let mut config = config(256);
    config.device.graph_support = GraphSupport::None;
    let f = fixture(&config);

    let err = explicit_graph(&f.device, &f.buffers, &f.plan, &CallbackLog::default()).unwrap_err();
    assert!(matches!(err, RuntimeError::MissingAspect { .. }));

    let direct = run_strategy(Strategy::DirectSubmit, &f.device, &f.buffers, &f.plan).unwrap();
    assert!(relative_error(direct.final_sum().unwrap(), f.host_sum) < 1e-9);
}

#[test]
fn test_buffers_respect_memory_budget() {
    let mut config = config(1 << 20);
    config.device.memory_limit_mb = 4;
    let device = Device::emulated(&config.device).unwrap();
    let plan = ReductionPlan::from_config(&config);

    let err = ReductionBuffers::allocate(&device, &plan).unwrap_err();
    assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
    assert_eq!(device.memory_stats().bytes_in_use, 0);
}
