//! Data-parallel kernel model for the emulated device
//!
//! A launch is `num_groups` execution groups of `group_size` workers. Workers
//! of one group share a scratch region and are split into sub-groups of
//! [`SUB_GROUP_SIZE`] lanes that exchange values by shuffles. Groups run in
//! parallel on the rayon pool; the workers of a group are stepped in lockstep
//! phases, which is what the barriers of a real device guarantee.

mod final_reduce;
mod partial;

pub use final_reduce::{FinalReduce, FINAL_MAX_GROUP_SIZE};
pub use partial::PartialReduce;

use crate::error::{Result, RuntimeError};

/// Lanes per sub-group (warp)
pub const SUB_GROUP_SIZE: usize = 32;

/// Largest group size the emulated device accepts
pub const MAX_GROUP_SIZE: usize = 1024;

/// Launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    /// Number of execution groups
    pub num_groups: usize,
    /// Workers per group
    pub group_size: usize,
}

impl NdRange {
    pub fn new(num_groups: usize, group_size: usize) -> Self {
        Self {
            num_groups,
            group_size,
        }
    }

    /// Total number of workers
    pub fn global_size(&self) -> usize {
        self.num_groups * self.group_size
    }

    /// Global index of worker `local_id` in group `group_id`
    pub fn global_id(&self, group_id: usize, local_id: usize) -> usize {
        group_id * self.group_size + local_id
    }

    /// Check the geometry the kernels assume
    pub fn validate(&self) -> Result<()> {
        if self.num_groups == 0 {
            return Err(RuntimeError::InvalidLaunch("launch has no groups".to_string()));
        }
        if !self.group_size.is_power_of_two()
            || self.group_size < SUB_GROUP_SIZE
            || self.group_size > MAX_GROUP_SIZE
        {
            return Err(RuntimeError::InvalidLaunch(format!(
                "group size {} must be a power of two between {} and {}",
                self.group_size, SUB_GROUP_SIZE, MAX_GROUP_SIZE
            )));
        }
        Ok(())
    }
}

/// A device kernel
pub trait Kernel: Send + Sync {
    /// Kernel name for logging
    fn name(&self) -> &str;

    /// Reject launches the kernel cannot honour
    fn check_launch(&self, range: &NdRange) -> Result<()> {
        range.validate()
    }

    /// Execute every group of the launch
    fn run(&self, range: &NdRange) -> Result<()>;
}

/// Associative operator with identity, the parameter of the segmented reduce
pub trait ReduceOp: Send + Sync + 'static {
    /// Accumulator type
    type Acc: Copy + Default + Send + Sync + 'static;

    fn identity() -> Self::Acc;

    fn combine(a: Self::Acc, b: Self::Acc) -> Self::Acc;
}

/// Double-precision sum
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl ReduceOp for Sum {
    type Acc = f64;

    fn identity() -> f64 {
        0.0
    }

    fn combine(a: f64, b: f64) -> f64 {
        a + b
    }
}

/// Double-precision maximum
#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl ReduceOp for Max {
    type Acc = f64;

    fn identity() -> f64 {
        f64::NEG_INFINITY
    }

    fn combine(a: f64, b: f64) -> f64 {
        a.max(b)
    }
}

/// Grid-stride accumulation: one value per worker of `group_id`.
///
/// Worker `l` owns elements `global_id(group_id, l) + k * global_size`.
pub fn accumulate_strided<T, R>(input: &[T], range: &NdRange, group_id: usize) -> Vec<R::Acc>
where
    T: Copy + Into<R::Acc>,
    R: ReduceOp,
{
    let stride = range.global_size();
    (0..range.group_size)
        .map(|local_id| {
            let start = range.global_id(group_id, local_id);
            (start..input.len())
                .step_by(stride)
                .fold(R::identity(), |acc, i| R::combine(acc, input[i].into()))
        })
        .collect()
}

/// Sub-group shuffle: lane `i` receives lane `i + offset`, or keeps its own
/// value when that lane is out of range.
pub fn shuffle_down<A: Copy>(lanes: &[A], offset: usize) -> Vec<A> {
    (0..lanes.len())
        .map(|i| lanes.get(i + offset).copied().unwrap_or(lanes[i]))
        .collect()
}

/// Shuffle-down tree over one sub-group; the total ends up in lane 0
pub fn sub_group_reduce<R: ReduceOp>(lanes: &mut [R::Acc]) -> R::Acc {
    let mut offset = lanes.len().next_power_of_two() / 2;
    while offset > 0 {
        let shifted = shuffle_down(lanes, offset);
        for (lane, incoming) in lanes.iter_mut().zip(shifted) {
            *lane = R::combine(*lane, incoming);
        }
        offset /= 2;
    }
    lanes.first().copied().unwrap_or_else(R::identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(NdRange::new(512, 256).validate().is_ok());
        assert!(NdRange::new(0, 256).validate().is_err());
        assert!(NdRange::new(1, 96).validate().is_err());
        assert!(NdRange::new(1, 16).validate().is_err());
        assert!(NdRange::new(1, 2048).validate().is_err());
        assert_eq!(NdRange::new(4, 64).global_size(), 256);
    }

    #[test]
    fn test_strided_ownership_covers_tail() {
        let range = NdRange::new(2, 32);
        let input: Vec<f32> = (0..70).map(|i| i as f32).collect();

        let g0 = accumulate_strided::<f32, Sum>(&input, &range, 0);
        let g1 = accumulate_strided::<f32, Sum>(&input, &range, 1);

        // Worker 0 owns 0 and 64, worker 5 owns 5 and 69, worker 6 only 6.
        assert_eq!(g0[0], 64.0);
        assert_eq!(g0[5], 74.0);
        assert_eq!(g0[6], 6.0);
        assert_eq!(g1[0], 32.0);

        let total: f64 = g0.iter().chain(g1.iter()).sum();
        assert_eq!(total, (0..70).sum::<i32>() as f64);
    }

    #[test]
    fn test_shuffle_down_keeps_out_of_range_lanes() {
        assert_eq!(shuffle_down(&[1, 2, 3, 4], 2), vec![3, 4, 3, 4]);
    }

    #[test]
    fn test_sub_group_reduce() {
        let mut lanes: Vec<f64> = (0..SUB_GROUP_SIZE).map(|i| i as f64).collect();
        assert_eq!(sub_group_reduce::<Sum>(&mut lanes), 496.0);

        let mut lanes: Vec<f64> = (0..SUB_GROUP_SIZE).map(|i| (i % 7) as f64).collect();
        assert_eq!(sub_group_reduce::<Max>(&mut lanes), 6.0);
    }
}
