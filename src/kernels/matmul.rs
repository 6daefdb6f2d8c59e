//! Dense matrix multiply, block-strided rows
//!
//! Each unit computes full output rows `C[i][*] = sum_k A[i][k] * B[k][j]`
//! for the rows [`partition`] assigns to it. Accumulation runs in `k` order,
//! so float results are independent of the grid.

use crate::backend::UnitContext;
use crate::datasets::{self, DEFAULT_SEED};
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{partition, Grid};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::{Element, SharedBuffer};
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

/// Element type with the arithmetic a matrix product needs
pub trait MatmulElement: Element {
    /// `self + a * b`; integers wrap on overflow
    fn multiply_accumulate(self, a: Self, b: Self) -> Self;
}

impl MatmulElement for i32 {
    #[inline]
    fn multiply_accumulate(self, a: i32, b: i32) -> i32 {
        self.wrapping_add(a.wrapping_mul(b))
    }
}

impl MatmulElement for f32 {
    #[inline]
    fn multiply_accumulate(self, a: f32, b: f32) -> f32 {
        self + a * b
    }
}

const MULTIPLY: PhaseId = PhaseId(0);

pub struct MatmulKernel<T: MatmulElement> {
    name: &'static str,
    grid: Grid,
    n: usize,
    a: SharedBuffer<T>,
    b: SharedBuffer<T>,
    c: SharedBuffer<T>,
    plan: PhasePlan,
    publisher: ResultPublisher<T>,
}

impl<T: MatmulElement> MatmulKernel<T> {
    /// `a` and `b` are row-major `n x n` matrices
    pub fn new(grid: Grid, n: usize, a: &[T], b: &[T]) -> ForgeResult<Self> {
        if n == 0 {
            return Err(NpuForgeError::InvalidProblemSize(
                "matrix dimension must be positive".to_string(),
            ));
        }
        expect_len(a, n * n)?;
        expect_len(b, n * n)?;

        let name = if T::NAME == "f32" { "matmul_f32" } else { "matmul" };
        Ok(MatmulKernel {
            name,
            grid,
            n,
            a: SharedBuffer::from_slice(a),
            b: SharedBuffer::from_slice(b),
            c: SharedBuffer::zeroed(n * n),
            plan: PhasePlan::builder().phase("multiply", 42).build()?,
            publisher: ResultPublisher::new(n * n),
        })
    }

    pub fn dimension(&self) -> usize {
        self.n
    }

    fn multiply_row(&self, i: usize) {
        let n = self.n;
        for j in 0..n {
            let mut acc = T::default();
            for k in 0..n {
                acc = acc.multiply_accumulate(self.a.get(i * n + k), self.b.get(k * n + j));
            }
            self.c.set(i * n + j, acc);
        }
    }
}

impl MatmulKernel<i32> {
    pub fn with_default_data(grid: Grid, n: usize) -> ForgeResult<Self> {
        let a = datasets::matmul_operand_i32(n);
        Self::new(grid, n, &a, &a)
    }
}

impl MatmulKernel<f32> {
    pub fn with_default_data(grid: Grid, n: usize) -> ForgeResult<Self> {
        let a = datasets::matmul_operand_f32(n, DEFAULT_SEED);
        let b = datasets::matmul_operand_f32(n, DEFAULT_SEED + 1);
        Self::new(grid, n, &a, &b)
    }
}

impl<T: MatmulElement> PhasedKernel for MatmulKernel<T>
where
    KernelOutput: From<Vec<T>>,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.c.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        match phase {
            MULTIPLY => {
                for i in partition(self.n, ctx.unit(), &self.grid) {
                    self.multiply_row(i);
                }
                Ok(())
            }
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

/// Row-major host product, used as a golden model
pub fn host_matmul<T: MatmulElement>(a: &[T], b: &[T], n: usize) -> Vec<T> {
    let mut c = vec![T::default(); n * n];
    for i in 0..n {
        for j in 0..n {
            let mut acc = T::default();
            for k in 0..n {
                acc = acc.multiply_accumulate(a[i * n + k], b[k * n + j]);
            }
            c[i * n + j] = acc;
        }
    }
    c
}
