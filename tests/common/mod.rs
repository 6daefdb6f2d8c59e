//! Common test utilities
//!
//! Shared grids and helpers for the integration tests. Tests that touch
//! process-wide state (environment variables, the global subscriber) must be
//! marked `#[serial]`.

#![allow(dead_code)]

mod tempfile_helpers;

use npuforge::backend::{ComputeBackend, ParallelBackend, RunReport, SequentialReferenceBackend};
use npuforge::grid::Grid;
use npuforge::kernels::{KernelKind, KernelOutput, PhasedKernel};
use once_cell::sync::Lazy;
pub use serial_test::serial;
pub use tempfile_helpers::{create_temp_dir, temp_log_path};

/// Grid shapes every grid-independent kernel is exercised on
pub static GRIDS: Lazy<Vec<Grid>> = Lazy::new(|| {
    [(1, 1), (1, 4), (2, 2), (4, 1), (3, 5), (4, 4)]
        .iter()
        .map(|&(cores, threads)| Grid::new(cores, threads).expect("test grid"))
        .collect()
});

pub fn grid(cores: usize, threads: usize) -> Grid {
    Grid::new(cores, threads).expect("test grid")
}

pub fn run_reference(kernel: &dyn PhasedKernel) -> RunReport {
    SequentialReferenceBackend::new(kernel.grid())
        .execute(kernel)
        .unwrap_or_else(|e| panic!("{} failed on the reference backend: {}", kernel.name(), e))
}

pub fn run_parallel(kernel: &dyn PhasedKernel) -> RunReport {
    ParallelBackend::new(kernel.grid())
        .execute(kernel)
        .unwrap_or_else(|e| panic!("{} failed on the parallel backend: {}", kernel.name(), e))
}

/// Output of the default dataset of `kind` on the single-unit reference grid
pub fn single_unit_output(kind: KernelKind) -> KernelOutput {
    let kernel = kind.build(Grid::single()).expect("default dataset");
    run_reference(kernel.as_ref());
    kernel.output()
}
