//! Matrix multiply staged through unit scratchpads
//!
//! Three phases:
//! 1. `stage_in`: each unit gathers its A rows into its scratchpad and copies
//!    its B rows into a core-local shared copy of B
//! 2. `multiply`: the unit multiplies its private A rows by the now complete
//!    local B into a private accumulator tile
//! 3. `stage_out`: accumulator rows are written back to C
//!
//! Row ownership is the block-strided [`partition`], so the result is
//! identical to [`MatmulKernel`](super::matmul::MatmulKernel).

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{partition, Grid, WorkRange};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

const STAGE_IN: PhaseId = PhaseId(0);
const MULTIPLY: PhaseId = PhaseId(1);
const STAGE_OUT: PhaseId = PhaseId(2);

const A_ROWS: &str = "a_rows";
const C_ROWS: &str = "c_rows";

pub struct ScratchpadMatmulKernel {
    grid: Grid,
    n: usize,
    a: SharedBuffer<i32>,
    b: SharedBuffer<i32>,
    b_local: SharedBuffer<i32>,
    c: SharedBuffer<i32>,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl ScratchpadMatmulKernel {
    pub fn new(grid: Grid, n: usize, a: &[i32], b: &[i32]) -> ForgeResult<Self> {
        if n == 0 {
            return Err(problem_error!("matrix dimension must be positive"));
        }
        expect_len(a, n * n)?;
        expect_len(b, n * n)?;

        let plan = PhasePlan::builder()
            .phase("stage_in", 10)
            .phase("multiply", 11)
            .phase("stage_out", 12)
            .build()?;

        Ok(ScratchpadMatmulKernel {
            grid,
            n,
            a: SharedBuffer::from_slice(a),
            b: SharedBuffer::from_slice(b),
            b_local: SharedBuffer::zeroed(n * n),
            c: SharedBuffer::zeroed(n * n),
            plan,
            publisher: ResultPublisher::new(n * n),
        })
    }

    pub fn with_default_data(grid: Grid, n: usize) -> ForgeResult<Self> {
        let a = datasets::matmul_operand_i32(n);
        Self::new(grid, n, &a, &a)
    }

    fn rows(&self, ctx: &UnitContext<'_>) -> WorkRange {
        partition(self.n, ctx.unit(), &self.grid)
    }

    fn stage_in(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let n = self.n;
        let rows = self.rows(ctx);

        ctx.scratch_mut().stage_in_gather(
            A_ROWS,
            &self.a,
            rows.iter().flat_map(|i| i * n..(i + 1) * n),
        )?;
        for i in rows {
            self.b_local.write_range(i * n, &self.b.read_range(i * n, n));
        }
        Ok(())
    }

    fn multiply(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let n = self.n;
        let row_count = self.rows(ctx).len();

        let scratch = ctx.scratch_mut();
        let a_rows = scratch.tile::<i32>(A_ROWS)?.as_slice().to_vec();
        let c_rows = scratch.alloc::<i32>(C_ROWS, row_count * n)?;

        for r in 0..row_count {
            let a_row = &a_rows[r * n..(r + 1) * n];
            for j in 0..n {
                let mut acc = 0i32;
                for (k, &a_rk) in a_row.iter().enumerate() {
                    acc = acc.wrapping_add(a_rk.wrapping_mul(self.b_local.get(k * n + j)));
                }
                c_rows[r * n + j] = acc;
            }
        }
        scratch.release(A_ROWS);
        Ok(())
    }

    fn stage_out(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let n = self.n;
        let rows = self.rows(ctx);

        let scratch = ctx.scratch_mut().scoped(C_ROWS);
        let c_rows = scratch.tile::<i32>(C_ROWS)?;
        for (r, i) in rows.into_iter().enumerate() {
            self.c.write_range(i * n, &c_rows.as_slice()[r * n..(r + 1) * n]);
        }
        Ok(())
    }
}

impl PhasedKernel for ScratchpadMatmulKernel {
    fn name(&self) -> &'static str {
        "matmul_scratchpad"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.b_local.reset();
        self.c.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        match phase {
            STAGE_IN => self.stage_in(ctx),
            MULTIPLY => self.multiply(ctx),
            STAGE_OUT => self.stage_out(ctx),
            other => Err(NpuForgeError::UnknownPhase(other.0)),
        }
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.c)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.c.committed_prefix(self.publisher.element_count()))
    }
}
