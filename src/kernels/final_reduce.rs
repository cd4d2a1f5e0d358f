//! Single-group reduction of the per-group partials

use super::{accumulate_strided, sub_group_reduce, Kernel, NdRange, ReduceOp, Sum, SUB_GROUP_SIZE};
use crate::error::{Result, RuntimeError};
use crate::memory::Buffer;
use std::marker::PhantomData;

/// Largest group the unrolled halving steps cover
pub const FINAL_MAX_GROUP_SIZE: usize = 512;

/// Unrolled halving strides applied in scratch before the sub-group stage
const HALVING_STRIDES: [usize; 3] = [256, 128, 64];

/// Reduces `input[..input_size]` into `result[0]` with one group.
///
/// Launching it with more than one group would race several reduction trees
/// on `result[0]`, so such launches are rejected up front.
pub struct FinalReduce<R: ReduceOp = Sum> {
    input: Buffer<R::Acc>,
    result: Buffer<R::Acc>,
    input_size: usize,
    _op: PhantomData<fn() -> R>,
}

impl<R: ReduceOp> FinalReduce<R> {
    pub fn new(input: &Buffer<R::Acc>, result: &Buffer<R::Acc>) -> Self {
        Self::with_size(input, result, input.len())
    }

    pub fn with_size(input: &Buffer<R::Acc>, result: &Buffer<R::Acc>, input_size: usize) -> Self {
        Self {
            input: input.clone(),
            result: result.clone(),
            input_size,
            _op: PhantomData,
        }
    }

    fn reduce(input: &[R::Acc], range: &NdRange) -> R::Acc {
        let group_size = range.group_size;
        let mut partial = accumulate_strided::<R::Acc, R>(input, range, 0);
        let mut scratch = partial.clone();

        for stride in HALVING_STRIDES {
            if group_size >= 2 * stride {
                for lane in 0..stride {
                    partial[lane] = R::combine(partial[lane], scratch[lane + stride]);
                    scratch[lane] = partial[lane];
                }
            }
        }

        // First sub-group folds in the second one, then finishes by shuffles.
        let mut lanes = partial[..SUB_GROUP_SIZE].to_vec();
        if group_size >= 2 * SUB_GROUP_SIZE {
            for (lane, value) in lanes.iter_mut().enumerate() {
                *value = R::combine(*value, scratch[lane + SUB_GROUP_SIZE]);
            }
        }
        sub_group_reduce::<R>(&mut lanes)
    }
}

impl<R: ReduceOp> Kernel for FinalReduce<R> {
    fn name(&self) -> &str {
        "reduceFinal"
    }

    fn check_launch(&self, range: &NdRange) -> Result<()> {
        range.validate()?;
        if range.num_groups != 1 {
            return Err(RuntimeError::InvalidLaunch(format!(
                "final reduction needs exactly one group, got {}",
                range.num_groups
            )));
        }
        if range.group_size > FINAL_MAX_GROUP_SIZE {
            return Err(RuntimeError::InvalidLaunch(format!(
                "final reduction supports at most {} workers, got {}",
                FINAL_MAX_GROUP_SIZE, range.group_size
            )));
        }
        if self.input_size > self.input.len() {
            return Err(RuntimeError::InvalidLaunch(format!(
                "input size {} exceeds buffer of {}",
                self.input_size,
                self.input.len()
            )));
        }
        Ok(())
    }

    fn run(&self, range: &NdRange) -> Result<()> {
        let total = {
            let input = self.input.read();
            Self::reduce(&input[..self.input_size.min(input.len())], range)
        };
        self.result.write()[0] = total;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, MemoryTracker};
    use std::sync::Arc;

    fn partials(values: &[f64]) -> (Buffer<f64>, Buffer<f64>) {
        let tracker = Arc::new(MemoryTracker::new(1 << 20));
        let input = Buffer::allocate(MemoryKind::Device, values.len(), tracker.clone()).unwrap();
        input.copy_from_slice(values).unwrap();
        let result = Buffer::allocate(MemoryKind::Device, 1, tracker).unwrap();
        (input, result)
    }

    #[test]
    fn test_every_group_size_reduces_fully() {
        let values: Vec<f64> = (1..=1000).map(|v| v as f64).collect();
        let (input, result) = partials(&values);
        let kernel = FinalReduce::<Sum>::new(&input, &result);

        for group_size in [32, 64, 128, 256, 512] {
            result.write()[0] = 0.0;
            kernel.run(&NdRange::new(1, group_size)).unwrap();
            assert_eq!(result.to_vec()[0], 500_500.0, "group size {}", group_size);
        }
    }

    #[test]
    fn test_fewer_partials_than_workers() {
        let (input, result) = partials(&[1.5, 2.5, 4.0]);
        FinalReduce::<Sum>::new(&input, &result)
            .run(&NdRange::new(1, 256))
            .unwrap();
        assert_eq!(result.to_vec()[0], 8.0);
    }

    #[test]
    fn test_multi_group_launch_rejected() {
        let (input, result) = partials(&[1.0; 4]);
        let kernel = FinalReduce::<Sum>::new(&input, &result);

        let err = kernel.check_launch(&NdRange::new(2, 256)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLaunch(_)));
        assert!(kernel.check_launch(&NdRange::new(1, 1024)).is_err());
        assert!(kernel.check_launch(&NdRange::new(1, 256)).is_ok());
    }
}
