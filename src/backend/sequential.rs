//! Sequential reference backend
//!
//! Drives the same partitioning as the parallel backend from a single outer
//! loop: for every phase, all units run in core-major order, then the kernel
//! picks the next phase. Barriers are validated but never block; any kernel
//! whose in-phase sync points are correct under core-major order produces the
//! golden output here.

use std::time::Instant;

use super::{check_kernel_grid, ComputeBackend, Device, DeviceState, RunReport, UnitContext};
use crate::backend::{ControlRegisters, COMPLETION_SLOT};
use crate::error::ForgeResult;
use crate::grid::Grid;
use crate::kernels::PhasedKernel;
use crate::staging::{Scratchpad, DEFAULT_SCRATCHPAD_BYTES};
use crate::sync::{BarrierCoordinator, BarrierKey, PhaseId};

/// Device whose barriers only check their arguments
#[derive(Debug)]
pub struct ReferenceDevice {
    grid: Grid,
    state: DeviceState,
}

impl ReferenceDevice {
    pub fn new(grid: Grid) -> Self {
        ReferenceDevice {
            grid,
            state: DeviceState::default(),
        }
    }
}

impl Device for ReferenceDevice {
    fn grid(&self) -> Grid {
        self.grid
    }

    fn barrier(&self, key: BarrierKey, expected: usize) -> ForgeResult<()> {
        BarrierCoordinator::validate(key, expected, self.grid.unit_count())
    }

    fn registers(&self) -> &ControlRegisters {
        self.state.registers()
    }

    fn record_flush(&self, lines: usize) {
        self.state.record_flush(lines)
    }

    fn flushed_lines(&self) -> usize {
        self.state.flushed_lines()
    }
}

#[derive(Debug, Clone)]
pub struct SequentialReferenceBackend {
    grid: Grid,
    scratchpad_bytes: usize,
}

impl SequentialReferenceBackend {
    pub fn new(grid: Grid) -> Self {
        SequentialReferenceBackend {
            grid,
            scratchpad_bytes: DEFAULT_SCRATCHPAD_BYTES,
        }
    }

    pub fn with_scratchpad_bytes(mut self, bytes: usize) -> Self {
        self.scratchpad_bytes = bytes;
        self
    }
}

fn drive(kernel: &dyn PhasedKernel, contexts: &mut [UnitContext<'_>]) -> ForgeResult<usize> {
    let plan = kernel.plan();
    let mut executed = 0;
    let mut phase = Some(PhaseId::FIRST);

    while let Some(id) = phase {
        let spec = plan.phase(id)?;
        for ctx in contexts.iter_mut() {
            kernel.run_phase(id, ctx)?;
        }
        executed += 1;
        tracing::debug!(kernel = kernel.name(), phase = spec.name, "phase complete");
        phase = kernel.next_phase(id);
    }

    if let Some(designated) = contexts.first_mut() {
        kernel.publish(designated)?;
    }
    Ok(executed)
}

impl ComputeBackend for SequentialReferenceBackend {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn execute(&self, kernel: &dyn PhasedKernel) -> ForgeResult<RunReport> {
        check_kernel_grid(self, kernel)?;
        kernel.reset();
        let device = ReferenceDevice::new(self.grid);
        let started = Instant::now();

        let mut contexts: Vec<UnitContext<'_>> = self
            .grid
            .units()
            .map(|unit| {
                UnitContext::new(
                    unit,
                    &device,
                    kernel.plan(),
                    Scratchpad::new(self.scratchpad_bytes),
                )
            })
            .collect();

        let outcome = drive(kernel, &mut contexts);
        for ctx in contexts.iter_mut() {
            ctx.scratch_mut().clear();
        }
        let executed = outcome?;

        let report = RunReport {
            kernel: kernel.name().to_string(),
            backend: self.name().to_string(),
            grid: self.grid,
            phases_executed: executed,
            completion_count: device.registers().read(COMPLETION_SLOT)?,
            flushed_lines: device.flushed_lines(),
            elapsed_us: started.elapsed().as_micros() as u64,
        };
        tracing::info!(
            kernel = %report.kernel,
            grid = %report.grid,
            phases = report.phases_executed,
            elapsed_us = report.elapsed_us,
            "reference run complete"
        );
        Ok(report)
    }
}
