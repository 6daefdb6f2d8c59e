//! Matrix transpose over block-strided input rows

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{partition, Grid};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

const TRANSPOSE: PhaseId = PhaseId(0);

/// Transposes a row-major `rows x cols` matrix into a `cols x rows` one
pub struct TransposeKernel {
    grid: Grid,
    rows: usize,
    cols: usize,
    input: SharedBuffer<i32>,
    output: SharedBuffer<i32>,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl TransposeKernel {
    pub fn new(grid: Grid, rows: usize, cols: usize, input: &[i32]) -> ForgeResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(problem_error!("cannot transpose a {}x{} matrix", rows, cols));
        }
        expect_len(input, rows * cols)?;
        Ok(TransposeKernel {
            grid,
            rows,
            cols,
            input: SharedBuffer::from_slice(input),
            output: SharedBuffer::zeroed(rows * cols),
            plan: PhasePlan::builder().phase("transpose", 30).build()?,
            publisher: ResultPublisher::new(rows * cols),
        })
    }

    pub fn with_default_data(grid: Grid, rows: usize, cols: usize) -> ForgeResult<Self> {
        Self::new(grid, rows, cols, &datasets::transpose_input(rows, cols))
    }
}

impl PhasedKernel for TransposeKernel {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.output.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        if phase != TRANSPOSE {
            return Err(NpuForgeError::UnknownPhase(phase.0));
        }
        let (n, m) = (self.rows, self.cols);
        for i in partition(n, ctx.unit(), &self.grid) {
            for j in 0..m {
                self.output.set(j * n + i, self.input.get(i * m + j));
            }
        }
        Ok(())
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.output)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.output.committed_prefix(self.publisher.element_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::testing::{grid, run_parallel, run_sequential};

    #[test]
    fn test_transpose_2x3() {
        let kernel = TransposeKernel::new(grid(2, 1), 2, 3, &[1, 2, 3, 4, 5, 6]).unwrap();
        run_parallel(&kernel);
        assert_eq!(kernel.output(), KernelOutput::I32(vec![1, 4, 2, 5, 3, 6]));
    }

    #[test]
    fn test_default_16x8_matches_reference() {
        let reference = TransposeKernel::with_default_data(grid(1, 1), 16, 8).unwrap();
        run_sequential(&reference);
        let parallel = TransposeKernel::with_default_data(grid(3, 2), 16, 8).unwrap();
        let report = run_parallel(&parallel);

        assert_eq!(parallel.output(), reference.output());
        assert_eq!(report.completion_count, 128);
        if let KernelOutput::I32(values) = reference.output() {
            // out[j][i] = in[i][j] = i * 8 + j
            assert_eq!(values[16 + 3], 3 * 8 + 1);
        } else {
            panic!("transpose produces i32");
        }
    }
}
