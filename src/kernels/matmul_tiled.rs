//! Matrix multiply in column-tile turns
//!
//! Thread `t` of core `c` owns output row `c * tile_dim + t` (see
//! [`TiledSchedule`]). Each turn handles `tile_dim` output columns: the core
//! leader copies the matching column tile of B into its core's shared tile
//! region, the core's threads meet at a core-scope sync point, and each thread
//! then multiplies its staged A row by the tile.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{Grid, TiledSchedule};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan, SyncId, SyncScope};

const TURN: PhaseId = PhaseId(0);
const TILE_READY: SyncId = SyncId(0);

const A_ROW: &str = "a_row";

pub struct TiledMatmulKernel {
    grid: Grid,
    schedule: TiledSchedule,
    a: SharedBuffer<i32>,
    b: SharedBuffer<i32>,
    /// `cores` regions of `n x tile_dim`, one per core
    b_tiles: SharedBuffer<i32>,
    c: SharedBuffer<i32>,
    turn: AtomicUsize,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl TiledMatmulKernel {
    /// Fails unless `n` is divisible by the core count and the grid has
    /// exactly `n` units
    pub fn new(grid: Grid, n: usize, a: &[i32], b: &[i32]) -> ForgeResult<Self> {
        let schedule = TiledSchedule::new(n, &grid)?;
        expect_len(a, n * n)?;
        expect_len(b, n * n)?;

        let plan = PhasePlan::builder()
            .phase("turn", 20)
            .sync_point("tile_ready", 21, SyncScope::Core)
            .build()?;

        Ok(TiledMatmulKernel {
            grid,
            schedule,
            a: SharedBuffer::from_slice(a),
            b: SharedBuffer::from_slice(b),
            b_tiles: SharedBuffer::zeroed(grid.core_count() * n * schedule.tile_dim()),
            c: SharedBuffer::zeroed(n * n),
            turn: AtomicUsize::new(0),
            plan,
            publisher: ResultPublisher::new(n * n),
        })
    }

    pub fn with_default_data(grid: Grid, n: usize) -> ForgeResult<Self> {
        let a = datasets::matmul_operand_i32(n);
        Self::new(grid, n, &a, &a)
    }

    pub fn schedule(&self) -> TiledSchedule {
        self.schedule
    }

    fn tile_region(&self, core: usize) -> usize {
        core * self.schedule.n() * self.schedule.tile_dim()
    }

    fn load_tile(&self, core: usize, col0: usize) {
        let n = self.schedule.n();
        let tile_dim = self.schedule.tile_dim();
        let region = self.tile_region(core);
        for k in 0..n {
            let row = self.b.read_range(k * n + col0, tile_dim);
            self.b_tiles.write_range(region + k * tile_dim, &row);
        }
    }

    fn run_turn(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let n = self.schedule.n();
        let tile_dim = self.schedule.tile_dim();
        let unit = ctx.unit();
        let col0 = self.schedule.column_offset(self.turn.load(Ordering::Acquire));

        if unit.is_core_leader() {
            self.load_tile(unit.core_id, col0);
        }
        ctx.sync(TILE_READY)?;

        let row = self.schedule.row(unit);
        let region = self.tile_region(unit.core_id);

        let mut scratch = ctx.scratch_mut().scoped(A_ROW);
        scratch.stage_in(A_ROW, &self.a, row * n, n)?;
        let a_row = scratch.tile::<i32>(A_ROW)?;
        for col in 0..tile_dim {
            let mut acc = 0i32;
            for k in 0..n {
                acc = acc.wrapping_add(a_row[k].wrapping_mul(self.b_tiles.get(region + k * tile_dim + col)));
            }
            self.c.set(row * n + col0 + col, acc);
        }
        Ok(())
    }
}

impl PhasedKernel for TiledMatmulKernel {
    fn name(&self) -> &'static str {
        "matmul_tiled"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.turn.store(0, Ordering::Release);
        self.b_tiles.reset();
        self.c.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        match phase {
            TURN => self.run_turn(ctx),
            other => Err(NpuForgeError::UnknownPhase(other.0)),
        }
    }

    fn next_phase(&self, _completed: PhaseId) -> Option<PhaseId> {
        let next = self.turn.fetch_add(1, Ordering::AcqRel) + 1;
        (next < self.schedule.turns()).then_some(TURN)
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.c)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.c.committed_prefix(self.publisher.element_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::matmul::host_matmul;
    use crate::kernels::testing::{grid, run_parallel, run_sequential};

    #[test]
    fn test_4x4_grid_n16() {
        let kernel = TiledMatmulKernel::with_default_data(grid(4, 4), 16).unwrap();
        let report = run_parallel(&kernel);

        let a = datasets::matmul_operand_i32(16);
        assert_eq!(kernel.output(), KernelOutput::from(host_matmul(&a, &a, 16)));
        assert_eq!(report.phases_executed, 4);
        assert_eq!(kernel.schedule().tile_dim(), 4);
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let a: Vec<i32> = (0..36).map(|v| v % 5 - 2).collect();
        let b: Vec<i32> = (0..36).map(|v| (v * 3) % 11).collect();

        let reference = TiledMatmulKernel::new(grid(2, 3), 6, &a, &b).unwrap();
        run_sequential(&reference);
        let parallel = TiledMatmulKernel::new(grid(2, 3), 6, &a, &b).unwrap();
        run_parallel(&parallel);

        assert_eq!(reference.output(), KernelOutput::from(host_matmul(&a, &b, 6)));
        assert_eq!(parallel.output(), reference.output());
    }

    #[test]
    fn test_rejects_mismatched_grid() {
        let a = datasets::matmul_operand_i32(16);
        let err = TiledMatmulKernel::new(grid(2, 2), 16, &a, &a).err().unwrap();
        assert!(matches!(err, NpuForgeError::InvalidProblemSize(_)));

        let a = datasets::matmul_operand_i32(6);
        let err = TiledMatmulKernel::new(grid(4, 2), 6, &a, &a).err().unwrap();
        assert!(matches!(err, NpuForgeError::InvalidProblemSize(_)));
    }

    #[test]
    fn test_overflow_wraps() {
        let a = [i32::MAX; 4];
        let expected = KernelOutput::from(host_matmul(&a, &a, 2));
        assert_eq!(expected, KernelOutput::I32(vec![2; 4]));

        let reference = TiledMatmulKernel::new(grid(2, 1), 2, &a, &a).unwrap();
        run_sequential(&reference);
        assert_eq!(reference.output(), expected);
        let parallel = TiledMatmulKernel::new(grid(2, 1), 2, &a, &a).unwrap();
        run_parallel(&parallel);
        assert_eq!(parallel.output(), expected);
    }

    #[test]
    fn test_kernel_can_run_twice() {
        let kernel = TiledMatmulKernel::with_default_data(grid(2, 1), 2).unwrap();
        run_parallel(&kernel);
        let first = kernel.output();
        let report = run_parallel(&kernel);
        assert_eq!(kernel.output(), first);
        assert_eq!(report.phases_executed, 2);
    }
}
