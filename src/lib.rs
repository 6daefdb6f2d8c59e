//! npuforge - statically partitioned kernels for a multi-core NPU grid
//!
//! Kernels are split into barrier-separated phases and run on a fixed grid of
//! cores × threads, either on real OS threads or on a single-threaded
//! reference backend used for cosimulation.

#![allow(clippy::needless_range_loop)] // Index loops mirror the partition math
#![allow(clippy::too_many_arguments)] // Kernel constructors take full problem shapes
#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::manual_memcpy)] // Staging copies are element-wise on purpose
#![allow(clippy::new_without_default)] // Kernels have no meaningful default

pub mod backend;
pub mod config;
pub mod cosim;
pub mod datasets;
pub mod error;
pub mod grid;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod publish;
pub mod staging;
pub mod sync;

pub use backend::{ComputeBackend, ParallelBackend, RunReport, SequentialReferenceBackend, UnitContext};
pub use config::{BackendKind, RunConfig};
pub use cosim::{compare_outputs, cosimulate, Comparison, CosimReport};
pub use error::{ErrorCategory, ForgeResult, NpuForgeError};
pub use grid::{ExecutionUnit, Grid, PartitionStrategy, WorkRange};
pub use kernels::{KernelKind, KernelOutput, PhasedKernel};
pub use memory::SharedBuffer;
pub use sync::{BarrierCoordinator, PhaseId, PhasePlan, SyncId, SyncScope};

/// Build `kind` with its default dataset and run it as `config` describes
pub fn run_kernel(kind: KernelKind, config: &RunConfig) -> ForgeResult<(RunReport, KernelOutput)> {
    let backend = backend::create(config)?;
    let kernel = kind.build(backend.grid())?;
    let report = backend.execute(kernel.as_ref())?;
    Ok((report, kernel.output()))
}
