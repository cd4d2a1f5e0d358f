use super::{CallbackLog, ReductionBuffers, ReductionPlan, Strategy};
use crate::device::{Aspect, Device};
use crate::error::Result;
use tracing::{debug, info};

/// One reduction pass submitted command by command over three queues.
///
/// A barrier on the first queue is the common start point; the other two
/// queues fork from it to zero the partials and the result while the input
/// is copied in. Returns the copied-out sum.
pub fn direct_submit(
    device: &Device,
    buffers: &ReductionBuffers,
    plan: &ReductionPlan,
    callbacks: &CallbackLog,
) -> Result<f64> {
    device.check_aspects(&[Aspect::Fp64])?;
    let commands = buffers.commands(plan)?;

    let q1 = device.create_queue();
    let q2 = device.create_queue();
    let q3 = device.create_queue();

    let fork = q1.barrier(&[])?;
    let joined2 = q2.barrier(&[fork.clone()])?;
    let joined3 = q3.barrier(&[fork.clone()])?;

    let copy_in = q1.submit(commands.copy_in, &[fork])?;
    let zero_partials = q2.submit(commands.zero_partials, &[joined2])?;
    let zero_result = q3.submit(commands.zero_result, &[joined3])?;

    let partial = q1.submit(commands.partial_reduce, &[copy_in, zero_partials])?;
    let reduced = q1.submit(commands.final_reduce, &[partial, zero_result])?;
    let mut done = q1.submit(commands.copy_out, &[reduced])?;

    if plan.host_callback {
        done = q1.submit(buffers.host_callback(Strategy::DirectSubmit, callbacks), &[done])?;
    }
    debug!("[{}] all commands submitted", Strategy::DirectSubmit);

    done.wait()?;
    let sum = buffers.host_result();
    info!("[{}] final reduced sum = {}", Strategy::DirectSubmit, sum);

    // Dropping the queues drains them.
    drop(q3);
    drop(q2);
    drop(q1);
    Ok(sum)
}
