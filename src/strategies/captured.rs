use super::{replay, CallbackLog, ReductionBuffers, ReductionPlan, Strategy};
use crate::device::{Aspect, Device};
use crate::error::Result;
use crate::graph::TaskGraph;
use tracing::debug;

/// Record the reduction pass from a live queue, finalize it and replay it
/// `plan.iterations` times on a separate execution queue.
///
/// The wait lists passed while recording become the graph's edges, so the
/// recorded graph has the same shape as the explicitly built one.
pub fn captured_graph(
    device: &Device,
    buffers: &ReductionBuffers,
    plan: &ReductionPlan,
    callbacks: &CallbackLog,
) -> Result<Vec<f64>> {
    device.check_aspects(&[Aspect::Fp64, Aspect::TaskGraph])?;
    let commands = buffers.commands(plan)?;

    let capture_queue = device.create_queue();
    let graph = TaskGraph::new();

    graph.record(&capture_queue, |q| {
        let copy_in = q.submit(commands.copy_in, &[])?;
        let zero_partials = q.submit(commands.zero_partials, &[])?;
        let zero_result = q.submit(commands.zero_result, &[])?;
        let partial = q.submit(commands.partial_reduce, &[copy_in, zero_partials])?;
        let reduced = q.submit(commands.final_reduce, &[partial, zero_result])?;
        let copy_out = q.submit(commands.copy_out, &[reduced])?;

        if plan.host_callback {
            q.submit(
                buffers.host_callback(Strategy::CapturedGraph, callbacks),
                &[copy_out],
            )?;
        }
        Ok(())
    })?;
    debug!(
        "[{}] recorded {} nodes from queue {}",
        Strategy::CapturedGraph,
        graph.node_count(),
        capture_queue.id()
    );

    let exec = graph.finalize()?;
    replay(device, &exec, buffers, plan.iterations, Strategy::CapturedGraph)
}
