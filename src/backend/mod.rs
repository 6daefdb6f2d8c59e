//! Execution backends
//!
//! A [`ComputeBackend`] runs a [`PhasedKernel`] on a grid of execution units.
//! Two implementations exist and are selected at run time by
//! [`create`]:
//!
//! - [`ParallelBackend`]: one OS thread per unit, real barriers
//! - [`SequentialReferenceBackend`]: one thread, units visited in core-major
//!   order phase by phase, barriers validated but never blocking
//!
//! Kernels only ever see a [`UnitContext`], which exposes the device
//! capabilities of the [`Intrinsics`] trait plus the unit's scratchpad.

pub mod parallel;
pub mod sequential;

pub use parallel::ParallelBackend;
pub use sequential::SequentialReferenceBackend;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::{BackendKind, RunConfig};
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::{ExecutionUnit, Grid};
use crate::kernels::PhasedKernel;
use crate::memory::Flushable;
use crate::staging::Scratchpad;
use crate::sync::{BarrierKey, PhasePlan, SyncId, SyncScope, PUBLISH_TAG};
use crate::sync_error;

/// Number of device control registers
pub const CONTROL_SLOTS: usize = 16;

/// Register receiving the element count of a published result
pub const COMPLETION_SLOT: usize = 12;

/// Memory-mapped control registers of the device
#[derive(Debug)]
pub struct ControlRegisters {
    slots: Box<[AtomicU32]>,
}

impl ControlRegisters {
    pub fn new() -> Self {
        ControlRegisters {
            slots: (0..CONTROL_SLOTS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn read(&self, slot: usize) -> ForgeResult<u32> {
        self.slots
            .get(slot)
            .map(|s| s.load(Ordering::Acquire))
            .ok_or(NpuForgeError::OutOfBounds {
                index: slot,
                len: CONTROL_SLOTS,
            })
    }

    pub fn write(&self, slot: usize, value: u32) -> ForgeResult<()> {
        let register = self.slots.get(slot).ok_or(NpuForgeError::OutOfBounds {
            index: slot,
            len: CONTROL_SLOTS,
        })?;
        register.store(value, Ordering::Release);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.load(Ordering::Acquire)).collect()
    }
}

impl Default for ControlRegisters {
    fn default() -> Self {
        Self::new()
    }
}

/// Device-wide services shared by every unit of one invocation
pub trait Device: Send + Sync {
    fn grid(&self) -> Grid;

    /// Rendezvous for an in-phase sync point
    fn barrier(&self, key: BarrierKey, expected: usize) -> ForgeResult<()>;

    fn registers(&self) -> &ControlRegisters;

    fn record_flush(&self, lines: usize);

    fn flushed_lines(&self) -> usize;
}

/// Registers and counters common to both device implementations
#[derive(Debug, Default)]
pub(crate) struct DeviceState {
    registers: ControlRegisters,
    flushed_lines: AtomicUsize,
}

impl DeviceState {
    pub(crate) fn registers(&self) -> &ControlRegisters {
        &self.registers
    }

    pub(crate) fn record_flush(&self, lines: usize) {
        self.flushed_lines.fetch_add(lines, Ordering::Relaxed);
    }

    pub(crate) fn flushed_lines(&self) -> usize {
        self.flushed_lines.load(Ordering::Relaxed)
    }
}

/// Capabilities a kernel may use from inside a phase
pub trait Intrinsics {
    fn core_id(&self) -> usize;

    fn thread_id(&self) -> usize;

    /// Raw grid-wide rendezvous on `tag`
    fn barrier(&mut self, tag: u32, expected: usize) -> ForgeResult<()>;

    /// Commit one line of `target` to external memory
    fn flush(&mut self, target: &dyn Flushable, line: usize) -> ForgeResult<()>;

    fn write_completion(&mut self, count: u32, slot: usize) -> ForgeResult<()>;
}

/// Per-unit view of the device handed to kernels
pub struct UnitContext<'a> {
    unit: ExecutionUnit,
    device: &'a dyn Device,
    plan: &'a PhasePlan,
    scratch: Scratchpad,
}

impl<'a> UnitContext<'a> {
    pub fn new(
        unit: ExecutionUnit,
        device: &'a dyn Device,
        plan: &'a PhasePlan,
        scratch: Scratchpad,
    ) -> Self {
        UnitContext {
            unit,
            device,
            plan,
            scratch,
        }
    }

    pub fn unit(&self) -> ExecutionUnit {
        self.unit
    }

    pub fn grid(&self) -> Grid {
        self.device.grid()
    }

    pub fn is_designated(&self) -> bool {
        self.unit.is_designated()
    }

    pub fn scratch(&self) -> &Scratchpad {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut Scratchpad {
        &mut self.scratch
    }

    pub fn registers(&self) -> &ControlRegisters {
        self.device.registers()
    }

    /// Meet the other participants of a declared sync point
    pub fn sync(&mut self, id: SyncId) -> ForgeResult<()> {
        let point = self.plan.sync_point(id)?;
        let grid = self.grid();
        let key = match point.scope {
            SyncScope::Grid => BarrierKey::grid(point.tag),
            SyncScope::Core => BarrierKey::core(point.tag, self.unit.core_id),
        };
        tracing::trace!(unit = %self.unit, sync = point.name, barrier = %key, "sync point");
        self.device.barrier(key, point.scope.expected_arrivals(&grid))
    }

    /// Flush every line of `target`, returning the number of lines
    pub fn flush_all(&mut self, target: &dyn Flushable) -> ForgeResult<usize> {
        let lines = target.line_count();
        for line in 0..lines {
            target.flush_line(line)?;
        }
        self.device.record_flush(lines);
        Ok(lines)
    }
}

impl Intrinsics for UnitContext<'_> {
    fn core_id(&self) -> usize {
        self.unit.core_id
    }

    fn thread_id(&self) -> usize {
        self.unit.thread_id
    }

    fn barrier(&mut self, tag: u32, expected: usize) -> ForgeResult<()> {
        if tag == PUBLISH_TAG || self.plan.phases().iter().any(|p| p.tag == tag) {
            return Err(sync_error!(
                "tag {} belongs to a phase boundary and cannot be awaited in-phase",
                tag
            ));
        }
        self.device.barrier(BarrierKey::grid(tag), expected)
    }

    fn flush(&mut self, target: &dyn Flushable, line: usize) -> ForgeResult<()> {
        target.flush_line(line)?;
        self.device.record_flush(1);
        Ok(())
    }

    fn write_completion(&mut self, count: u32, slot: usize) -> ForgeResult<()> {
        self.device.registers().write(slot, count)
    }
}

/// Summary of one kernel invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub kernel: String,
    pub backend: String,
    pub grid: Grid,
    pub phases_executed: usize,
    pub completion_count: u32,
    pub flushed_lines: usize,
    pub elapsed_us: u64,
}

/// Executes phased kernels on a fixed grid
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn grid(&self) -> Grid;

    fn execute(&self, kernel: &dyn PhasedKernel) -> ForgeResult<RunReport>;
}

/// Kernels are built for one grid; running them on another is a config error
pub(crate) fn check_kernel_grid(backend: &dyn ComputeBackend, kernel: &dyn PhasedKernel) -> ForgeResult<()> {
    if backend.grid() != kernel.grid() {
        return Err(NpuForgeError::InvalidConfiguration(format!(
            "kernel '{}' was built for grid {} but backend '{}' runs {}",
            kernel.name(),
            kernel.grid(),
            backend.name(),
            backend.grid()
        )));
    }
    Ok(())
}

/// Build the backend selected by `config`
pub fn create(config: &RunConfig) -> ForgeResult<Box<dyn ComputeBackend>> {
    config.validate()?;
    let grid = config.grid()?;
    let backend: Box<dyn ComputeBackend> = match config.backend {
        BackendKind::Parallel => Box::new(
            ParallelBackend::new(grid).with_scratchpad_bytes(config.scratchpad_bytes),
        ),
        BackendKind::Sequential => Box::new(
            SequentialReferenceBackend::new(grid).with_scratchpad_bytes(config.scratchpad_bytes),
        ),
    };
    tracing::debug!(backend = backend.name(), grid = %grid, "backend created");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl std::fmt::Debug for dyn ComputeBackend {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ComputeBackend")
                .field("name", &self.name())
                .field("grid", &self.grid())
                .finish()
        }
    }

    #[test]
    fn test_control_registers_bounds() {
        let registers = ControlRegisters::new();
        registers.write(COMPLETION_SLOT, 64).unwrap();
        assert_eq!(registers.read(COMPLETION_SLOT).unwrap(), 64);
        assert_eq!(registers.snapshot().len(), CONTROL_SLOTS);
        assert!(matches!(
            registers.write(CONTROL_SLOTS, 1),
            Err(NpuForgeError::OutOfBounds { index: 16, len: 16 })
        ));
    }

    #[test]
    fn test_create_selects_backend() {
        let config = RunConfig::new().with_grid(2, 2);
        let backend = create(&config).unwrap();
        assert_eq!(backend.name(), "parallel");
        assert_eq!(backend.grid(), Grid::new(2, 2).unwrap());

        let config = config.with_backend(BackendKind::Sequential);
        assert_eq!(create(&config).unwrap().name(), "sequential");
    }

    #[test]
    fn test_create_rejects_zero_grid() {
        let config = RunConfig::new().with_grid(0, 2);
        assert!(create(&config).unwrap_err().is_configuration_error());
    }
}
