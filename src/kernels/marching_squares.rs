//! Boundary classification of a binary field
//!
//! A cell is marked when it is set and its 3x3 neighbourhood is not
//! completely set. Neighbours in row 0 or column 0 and outside the field never
//! count, so set cells within one step of the top or left border, or on the
//! bottom or right border, are always boundary cells.

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{partition, Grid};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

const CLASSIFY: PhaseId = PhaseId(0);

pub struct MarchingSquaresKernel {
    grid: Grid,
    rows: usize,
    cols: usize,
    field: SharedBuffer<i32>,
    output: SharedBuffer<i32>,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl MarchingSquaresKernel {
    pub fn new(grid: Grid, rows: usize, cols: usize, field: &[i32]) -> ForgeResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(problem_error!("empty {}x{} field", rows, cols));
        }
        expect_len(field, rows * cols)?;
        Ok(MarchingSquaresKernel {
            grid,
            rows,
            cols,
            field: SharedBuffer::from_slice(field),
            output: SharedBuffer::zeroed(rows * cols),
            plan: PhasePlan::builder().phase("classify", 42).build()?,
            publisher: ResultPublisher::new(rows * cols),
        })
    }

    pub fn with_default_data(grid: Grid, rows: usize, cols: usize, seed: u64) -> ForgeResult<Self> {
        Self::new(grid, rows, cols, &datasets::binary_field(rows, cols, seed))
    }

    fn neighbourhood_sum(&self, i: usize, j: usize) -> i32 {
        let (rows, cols) = (self.rows as isize, self.cols as isize);
        let mut sum = 0;
        for dn in -1isize..=1 {
            for dm in -1isize..=1 {
                let (r, c) = (i as isize + dn, j as isize + dm);
                if r > 0 && r < rows && c > 0 && c < cols {
                    sum = i32::wrapping_add(sum, self.field.get(r as usize * self.cols + c as usize));
                }
            }
        }
        sum
    }
}

impl PhasedKernel for MarchingSquaresKernel {
    fn name(&self) -> &'static str {
        "marching_squares"
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
        if phase != CLASSIFY {
            return Err(NpuForgeError::UnknownPhase(phase.0));
        }
        for i in partition(self.rows, ctx.unit(), &self.grid) {
            for j in 0..self.cols {
                let index = i * self.cols + j;
                let boundary = self.neighbourhood_sum(i, j) != 9 && self.field.get(index) != 0;
                self.output.set(index, i32::from(boundary));
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
