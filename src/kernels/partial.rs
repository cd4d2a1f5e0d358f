//! Per-group partial reduction

use super::{accumulate_strided, sub_group_reduce, Kernel, NdRange, ReduceOp, Sum, SUB_GROUP_SIZE};
use crate::error::{Result, RuntimeError};
use crate::memory::Buffer;
use rayon::prelude::*;
use std::marker::PhantomData;

/// Reduces the input into one value per group.
///
/// Every worker folds its grid-strided elements, each sub-group tile reduces
/// by shuffles, and the group leader combines the tile results in tile order
/// into `output[group_id]`. Groups at or past `output_size` write nothing.
pub struct PartialReduce<T, R: ReduceOp = Sum> {
    input: Buffer<T>,
    output: Buffer<R::Acc>,
    input_size: usize,
    output_size: usize,
    _op: PhantomData<fn() -> R>,
}

impl<T, R> PartialReduce<T, R>
where
    T: Copy + Send + Sync + Into<R::Acc> + 'static,
    R: ReduceOp,
{
    /// Reduce all of `input` into all slots of `output`
    pub fn new(input: &Buffer<T>, output: &Buffer<R::Acc>) -> Self {
        Self::with_sizes(input, output, input.len(), output.len())
    }

    /// Reduce the first `input_size` elements into the first `output_size` slots
    pub fn with_sizes(
        input: &Buffer<T>,
        output: &Buffer<R::Acc>,
        input_size: usize,
        output_size: usize,
    ) -> Self {
        Self {
            input: input.clone(),
            output: output.clone(),
            input_size,
            output_size,
            _op: PhantomData,
        }
    }

    fn reduce_group(input: &[T], range: &NdRange, group_id: usize) -> R::Acc {
        let mut lanes = accumulate_strided::<T, R>(input, range, group_id);

        // barrier: all worker sums are now in scratch
        lanes
            .chunks_mut(SUB_GROUP_SIZE)
            .map(|tile| sub_group_reduce::<R>(tile))
            .fold(R::identity(), R::combine)
    }
}

impl<T, R> Kernel for PartialReduce<T, R>
where
    T: Copy + Send + Sync + Into<R::Acc> + 'static,
    R: ReduceOp,
{
    fn name(&self) -> &str {
        "reduce"
    }

    fn check_launch(&self, range: &NdRange) -> Result<()> {
        range.validate()?;
        if self.input_size > self.input.len() {
            return Err(RuntimeError::InvalidLaunch(format!(
                "input size {} exceeds buffer of {}",
                self.input_size,
                self.input.len()
            )));
        }
        if self.output_size > self.output.len() {
            return Err(RuntimeError::InvalidLaunch(format!(
                "output size {} exceeds buffer of {}",
                self.output_size,
                self.output.len()
            )));
        }
        Ok(())
    }

    fn run(&self, range: &NdRange) -> Result<()> {
        let totals: Vec<(usize, R::Acc)> = {
            let input = self.input.read();
            let input = &input[..self.input_size.min(input.len())];
            let writers = range.num_groups.min(self.output_size).min(self.output.len());
            (0..writers)
                .into_par_iter()
                .map(|group_id| (group_id, Self::reduce_group(input, range, group_id)))
                .collect()
        };

        let mut output = self.output.write();
        for (group_id, total) in totals {
            output[group_id] = total;
        }
        Ok(())
    }
}
