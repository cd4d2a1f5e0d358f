use super::{replay, CallbackLog, ReductionBuffers, ReductionCommands, ReductionPlan, Strategy};
use crate::command::Command;
use crate::device::{Aspect, Device};
use crate::error::Result;
use crate::graph::{NodeId, TaskGraph};

/// Add the reduction pass to a new graph node by node.
///
/// Returns the graph and its completion node: copy-out, or `callback` when
/// one is given.
pub fn build_reduction_graph(
    commands: ReductionCommands,
    callback: Option<Command>,
) -> Result<(TaskGraph, NodeId)> {
    let graph = TaskGraph::new();

    let copy_in = graph.add(commands.copy_in, &[])?;
    let zero_partials = graph.add(commands.zero_partials, &[])?;
    let zero_result = graph.add(commands.zero_result, &[])?;
    let partial = graph.add(commands.partial_reduce, &[copy_in, zero_partials])?;
    let reduced = graph.add(commands.final_reduce, &[partial, zero_result])?;
    let mut completion = graph.add(commands.copy_out, &[reduced])?;

    if let Some(callback) = callback {
        completion = graph.add(callback, &[completion])?;
    }
    Ok((graph, completion))
}

/// Build the graph once, finalize it and replay it `plan.iterations` times
pub fn explicit_graph(
    device: &Device,
    buffers: &ReductionBuffers,
    plan: &ReductionPlan,
    callbacks: &CallbackLog,
) -> Result<Vec<f64>> {
    device.check_aspects(&[Aspect::Fp64, Aspect::TaskGraph])?;

    let callback = plan
        .host_callback
        .then(|| buffers.host_callback(Strategy::ExplicitGraph, callbacks));
    let (graph, _) = build_reduction_graph(buffers.commands(plan)?, callback)?;
    let exec = graph.finalize()?;

    replay(device, &exec, buffers, plan.iterations, Strategy::ExplicitGraph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::device::DeviceConfig;
    use crate::graph::GraphStage;

    fn setup(elements: usize) -> (Device, ReductionBuffers, ReductionPlan) {
        let config = crate::config::SampleConfig {
            elements,
            device: DeviceConfig {
                workers: Some(2),
                ..DeviceConfig::default()
            },
            ..Default::default()
        };
        let device = Device::emulated(&config.device).unwrap();
        let plan = ReductionPlan::from_config(&config);
        let buffers = ReductionBuffers::allocate(&device, &plan).unwrap();
        (device, buffers, plan)
    }

    #[test]
    fn test_graph_shape() {
        let (_device, buffers, plan) = setup(4096);
        let (graph, completion) =
            build_reduction_graph(buffers.commands(&plan).unwrap(), None).unwrap();

        assert_eq!(graph.node_count(), 6);
        assert_eq!(graph.sinks(), vec![completion]);
        assert_eq!(graph.command_kind(completion), Some(CommandKind::Copy));
        assert_eq!(graph.edges().len(), 5);
        assert_eq!(graph.stage(), GraphStage::Building);
    }

    #[test]
    fn test_callback_becomes_completion_node() {
        let (_device, buffers, plan) = setup(4096);
        let log = CallbackLog::default();
        let callback = buffers.host_callback(Strategy::ExplicitGraph, &log);
        let (graph, completion) =
            build_reduction_graph(buffers.commands(&plan).unwrap(), Some(callback)).unwrap();

        assert_eq!(graph.node_count(), 7);
        assert_eq!(graph.sinks(), vec![completion]);
        assert_eq!(graph.command_kind(completion), Some(CommandKind::HostTask));
    }

    #[test]
    fn test_replays_sum_input() {
        let (device, buffers, plan) = setup(1000);
        buffers.load_input(&vec![0.5; 1000]).unwrap();

        let sums = explicit_graph(&device, &buffers, &plan, &CallbackLog::default()).unwrap();
        assert_eq!(sums, vec![500.0; 3]);
    }
}
