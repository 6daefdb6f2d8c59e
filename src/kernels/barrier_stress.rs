//! Barrier micro-benchmark
//!
//! Declares `B = cores * threads * 4` grid-scope and `B` core-scope sync
//! points and cycles through each set [`STEP`] times. After grid barrier `i`
//! the designated unit increments counter `i`; after every core barrier the
//! core leader increments its core's counter. The output is the `B` grid
//! counters (each `STEP`) followed by one counter per core (each `STEP * B`).

use crate::backend::UnitContext;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::Grid;
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan, SyncId, SyncScope};

/// Passes over every barrier
pub const STEP: usize = 4;

/// Barriers per scope and unit
const BARRIERS_PER_UNIT: usize = 4;

const GRID_CYCLES: PhaseId = PhaseId(0);
const CORE_CYCLES: PhaseId = PhaseId(1);

pub struct BarrierStressKernel {
    grid: Grid,
    barriers: usize,
    counters: SharedBuffer<u32>,
    plan: PhasePlan,
    publisher: ResultPublisher<u32>,
}

impl BarrierStressKernel {
    pub fn new(grid: Grid) -> ForgeResult<Self> {
        let barriers = grid.unit_count() * BARRIERS_PER_UNIT;
        if 2 * barriers > u16::MAX as usize {
            return Err(problem_error!(
                "{} units need more than {} sync points",
                grid.unit_count(),
                u16::MAX
            ));
        }

        let tag_base = barriers as u32;
        let builder = (0..tag_base).fold(PhasePlan::builder(), |b, i| {
            b.sync_point("grid_cycle", i, SyncScope::Grid)
        });
        let builder = (0..tag_base).fold(builder, |b, i| {
            b.sync_point("core_cycle", tag_base + i, SyncScope::Core)
        });
        let plan = builder
            .phase("grid_cycles", 2 * tag_base)
            .phase("core_cycles", 2 * tag_base + 1)
            .build()?;

        let len = barriers + grid.core_count();
        Ok(BarrierStressKernel {
            grid,
            barriers,
            counters: SharedBuffer::zeroed(len),
            plan,
            publisher: ResultPublisher::new(len),
        })
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers
    }

    fn grid_cycles(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        for _ in 0..STEP {
            for i in 0..self.barriers {
                ctx.sync(SyncId(i as u16))?;
                if ctx.is_designated() {
                    self.counters.update(i, |c| c + 1);
                }
            }
        }
        Ok(())
    }

    fn core_cycles(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let unit = ctx.unit();
        let slot = self.barriers + unit.core_id;
        for _ in 0..STEP {
            for i in 0..self.barriers {
                ctx.sync(SyncId((self.barriers + i) as u16))?;
                if unit.is_core_leader() {
                    self.counters.update(slot, |c| c + 1);
                }
            }
        }
        Ok(())
    }
}

impl PhasedKernel for BarrierStressKernel {
    fn name(&self) -> &'static str {
        "barrier_stress"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.counters.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        match phase {
            GRID_CYCLES => self.grid_cycles(ctx),
            CORE_CYCLES => self.core_cycles(ctx),
            other => Err(NpuForgeError::UnknownPhase(other.0)),
        }
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.counters)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.counters.committed_prefix(self.publisher.element_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::testing::{grid, run_parallel, run_sequential};

    fn expected(cores: usize, threads: usize) -> KernelOutput {
        let barriers = cores * threads * BARRIERS_PER_UNIT;
        let mut values = vec![STEP as u32; barriers];
        values.extend(std::iter::repeat((STEP * barriers) as u32).take(cores));
        KernelOutput::U32(values)
    }

    #[test]
    fn test_counters_on_parallel_grid() {
        let kernel = BarrierStressKernel::new(grid(2, 3)).unwrap();
        let report = run_parallel(&kernel);
        assert_eq!(kernel.barrier_count(), 24);
        assert_eq!(kernel.output(), expected(2, 3));
        assert_eq!(report.completion_count, 26);
    }

    #[test]
    fn test_reference_backend_validates_only() {
        let kernel = BarrierStressKernel::new(grid(2, 2)).unwrap();
        run_sequential(&kernel);
        assert_eq!(kernel.output(), expected(2, 2));
    }

    #[test]
    fn test_counters_restart_on_rerun() {
        let kernel = BarrierStressKernel::new(grid(2, 2)).unwrap();
        run_parallel(&kernel);
        run_parallel(&kernel);
        assert_eq!(kernel.output(), expected(2, 2));
    }

    #[test]
    fn test_grid_too_large() {
        let err = BarrierStressKernel::new(grid(128, 64)).err().unwrap();
        assert!(matches!(err, NpuForgeError::InvalidProblemSize(_)));
    }
}
