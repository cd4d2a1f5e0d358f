//! gpu-task-graphs - array reduction on an emulated accelerator
//!
//! Sums a large `f32` array with a two-kernel reduction, issued three ways:
//! direct submission with hand-wired events, an explicitly built task graph,
//! and a task graph recorded from a live queue. The graphs are finalized once
//! and replayed.

/// Error handling and result types
pub mod error;
/// Sample configuration
pub mod config;
/// Device enumeration, selection and handles
pub mod device;
/// Completion events
pub mod event;
/// Replayable device commands
pub mod command;
/// Worker pool that runs commands in dependency order
pub mod executor;
/// Typed buffers and memory accounting
pub mod memory;
/// Command queues and recording
pub mod queue;
/// Task graphs
pub mod graph;
/// Reduction kernels
pub mod kernels;
/// The three execution strategies
pub mod strategies;

pub use command::{Command, CommandKind};
pub use config::SampleConfig;
pub use device::{Aspect, Device, DeviceConfig, DeviceInfo, DeviceSelector, GraphSupport};
pub use error::{Result, RuntimeError};
pub use event::{Event, EventStatus};
pub use graph::{ExecutableGraph, GraphStage, NodeId, TaskGraph};
pub use kernels::{FinalReduce, Kernel, NdRange, PartialReduce, ReduceOp, Sum};
pub use memory::{Buffer, MemoryKind, MemoryStats};
pub use queue::Queue;
pub use strategies::{Strategy, StrategyReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
