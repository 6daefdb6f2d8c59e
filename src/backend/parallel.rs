//! Threaded backend: one OS thread per execution unit
//!
//! Every unit runs the same phase loop (SPMD). Phase boundaries are grid-wide
//! barriers whose releasing arrival asks the kernel for the next phase and
//! broadcasts the answer, so all units agree on the control flow without
//! reading kernel state concurrently.

use std::thread;
use std::time::Instant;

use super::{check_kernel_grid, ComputeBackend, Device, DeviceState, RunReport, UnitContext};
use crate::backend::ControlRegisters;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::{ExecutionUnit, Grid};
use crate::kernels::PhasedKernel;
use crate::staging::{Scratchpad, DEFAULT_SCRATCHPAD_BYTES};
use crate::sync::{BarrierCoordinator, BarrierKey, PhaseId, PUBLISH_TAG};

const NO_NEXT_PHASE: u64 = u64::MAX;

/// Device whose barriers block on a shared coordinator
#[derive(Debug)]
pub struct ThreadedDevice {
    grid: Grid,
    coordinator: BarrierCoordinator,
    state: DeviceState,
}

impl ThreadedDevice {
    pub fn new(grid: Grid) -> Self {
        ThreadedDevice {
            grid,
            coordinator: BarrierCoordinator::new(grid.unit_count()),
            state: DeviceState::default(),
        }
    }

    pub fn coordinator(&self) -> &BarrierCoordinator {
        &self.coordinator
    }
}

impl Device for ThreadedDevice {
    fn grid(&self) -> Grid {
        self.grid
    }

    fn barrier(&self, key: BarrierKey, expected: usize) -> ForgeResult<()> {
        self.coordinator.wait(key, expected)
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

/// Runs each unit on its own scoped thread
#[derive(Debug, Clone)]
pub struct ParallelBackend {
    grid: Grid,
    scratchpad_bytes: usize,
}

impl ParallelBackend {
    pub fn new(grid: Grid) -> Self {
        ParallelBackend {
            grid,
            scratchpad_bytes: DEFAULT_SCRATCHPAD_BYTES,
        }
    }

    pub fn with_scratchpad_bytes(mut self, bytes: usize) -> Self {
        self.scratchpad_bytes = bytes;
        self
    }

    fn run_unit(
        &self,
        kernel: &dyn PhasedKernel,
        device: &ThreadedDevice,
        unit: ExecutionUnit,
    ) -> ForgeResult<usize> {
        let _guard = device.coordinator().poison_on_panic(unit);
        let mut ctx = UnitContext::new(
            unit,
            device,
            kernel.plan(),
            Scratchpad::new(self.scratchpad_bytes),
        );

        let outcome = drive_unit(kernel, device, &mut ctx);
        ctx.scratch_mut().clear();

        if let Err(err) = &outcome {
            device
                .coordinator()
                .poison(format!("unit {} failed: {}", unit, err));
        }
        outcome
    }
}

fn drive_unit(
    kernel: &dyn PhasedKernel,
    device: &ThreadedDevice,
    ctx: &mut UnitContext<'_>,
) -> ForgeResult<usize> {
    let plan = kernel.plan();
    let arrivals = device.grid.unit_count();
    let mut executed = 0;
    let mut phase = Some(PhaseId::FIRST);

    while let Some(id) = phase {
        let spec = plan.phase(id)?;
        kernel.run_phase(id, ctx)?;
        executed += 1;

        let next = device
            .coordinator()
            .wait_with(BarrierKey::grid(spec.tag), arrivals, || {
                match kernel.next_phase(id) {
                    Some(next) => next.0 as u64,
                    None => NO_NEXT_PHASE,
                }
            })?;
        if ctx.is_designated() {
            tracing::debug!(kernel = kernel.name(), phase = spec.name, "phase complete");
        }
        phase = if next == NO_NEXT_PHASE {
            None
        } else {
            Some(PhaseId(next as u16))
        };
    }

    if ctx.is_designated() {
        kernel.publish(ctx)?;
    }
    device
        .coordinator()
        .wait(BarrierKey::grid(PUBLISH_TAG), arrivals)?;
    Ok(executed)
}

impl ComputeBackend for ParallelBackend {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn execute(&self, kernel: &dyn PhasedKernel) -> ForgeResult<RunReport> {
        check_kernel_grid(self, kernel)?;
        kernel.reset();
        let device = ThreadedDevice::new(self.grid);
        let started = Instant::now();

        let results: Vec<(ExecutionUnit, ForgeResult<usize>)> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.grid.unit_count());
            for unit in self.grid.units() {
                let device = &device;
                let spawned = thread::Builder::new()
                    .name(format!("npu-{}", unit))
                    .spawn_scoped(scope, move || self.run_unit(kernel, device, unit));
                match spawned {
                    Ok(handle) => handles.push((unit, Ok(handle))),
                    Err(err) => {
                        device
                            .coordinator()
                            .poison(format!("failed to spawn unit {}", unit));
                        handles.push((unit, Err(NpuForgeError::IoError(err))));
                    }
                }
            }

            handles
                .into_iter()
                .map(|(unit, handle)| {
                    let result = handle.and_then(|h| {
                        h.join().unwrap_or_else(|payload| {
                            Err(NpuForgeError::UnitPanicked(panic_message(payload.as_ref())))
                        })
                    });
                    (unit, result)
                })
                .collect()
        });

        let mut first_error: Option<NpuForgeError> = None;
        let mut executed = 0;
        for (unit, result) in results {
            match result {
                Ok(count) => {
                    if unit.is_designated() {
                        executed = count;
                    }
                }
                // peers of a failing unit only report the poisoned barrier
                Err(err) => {
                    let replace = match &first_error {
                        None => true,
                        Some(NpuForgeError::BarrierPoisoned(_)) => {
                            !matches!(err, NpuForgeError::BarrierPoisoned(_))
                        }
                        Some(_) => false,
                    };
                    if replace {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            tracing::warn!(kernel = kernel.name(), error = %err, "parallel run failed");
            return Err(err);
        }

        let report = RunReport {
            kernel: kernel.name().to_string(),
            backend: self.name().to_string(),
            grid: self.grid,
            phases_executed: executed,
            completion_count: device.registers().read(super::COMPLETION_SLOT)?,
            flushed_lines: device.flushed_lines(),
            elapsed_us: started.elapsed().as_micros() as u64,
        };
        tracing::info!(
            kernel = %report.kernel,
            grid = %report.grid,
            phases = report.phases_executed,
            elapsed_us = report.elapsed_us,
            "parallel run complete"
        );
        Ok(report)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
