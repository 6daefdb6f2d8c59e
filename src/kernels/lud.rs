//! Crout LU decomposition, `A = L * U` with a unit-diagonal `U`
//!
//! Step `i` computes column `i` of `L` and then row `i` of `U`; both sweeps are
//! distributed cyclically over all units. The result is published as `L`
//! followed by `U`.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::UnitContext;
use crate::datasets::{LUD_MATRIX, LUD_SIZE};
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{Grid, PartitionStrategy};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

const L_COLUMN: PhaseId = PhaseId(0);
const U_ROW: PhaseId = PhaseId(1);

pub struct LudKernel {
    grid: Grid,
    n: usize,
    a: SharedBuffer<f32>,
    /// `L` at offset 0, `U` at offset `n * n`
    factors: SharedBuffer<f32>,
    step: AtomicUsize,
    plan: PhasePlan,
    publisher: ResultPublisher<f32>,
}

impl LudKernel {
    pub fn new(grid: Grid, n: usize, a: &[f32]) -> ForgeResult<Self> {
        if n == 0 {
            return Err(problem_error!("matrix dimension must be positive"));
        }
        expect_len(a, n * n)?;

        Ok(LudKernel {
            grid,
            n,
            a: SharedBuffer::from_slice(a),
            factors: SharedBuffer::from_slice(&identity_factors(n)),
            step: AtomicUsize::new(0),
            plan: PhasePlan::builder()
                .phase("l_column", 50)
                .phase("u_row", 51)
                .build()?,
            publisher: ResultPublisher::new(2 * n * n),
        })
    }

    pub fn with_default_data(grid: Grid) -> ForgeResult<Self> {
        let a: Vec<f32> = LUD_MATRIX.iter().flatten().copied().collect();
        Self::new(grid, LUD_SIZE, &a)
    }

    #[inline]
    fn l(&self, row: usize, col: usize) -> usize {
        row * self.n + col
    }

    #[inline]
    fn u(&self, row: usize, col: usize) -> usize {
        self.n * self.n + row * self.n + col
    }

    fn l_column(&self, i: usize, ctx: &UnitContext<'_>) {
        let f = &self.factors;
        for j in PartitionStrategy::UnitCyclic.range(self.n, ctx.unit(), &self.grid) {
            let value = if j < i {
                0.0
            } else {
                let mut value = self.a.get(j * self.n + i);
                for k in 0..i {
                    value -= f.get(self.l(j, k)) * f.get(self.u(k, i));
                }
                value
            };
            f.set(self.l(j, i), value);
        }
    }

    fn u_row(&self, i: usize, ctx: &UnitContext<'_>) {
        let f = &self.factors;
        let pivot = f.get(self.l(i, i));
        for j in PartitionStrategy::UnitCyclic.range(self.n, ctx.unit(), &self.grid) {
            let value = if j < i {
                0.0
            } else if j == i {
                1.0
            } else {
                let mut value = self.a.get(i * self.n + j) / pivot;
                for k in 0..i {
                    value -= (f.get(self.l(i, k)) * f.get(self.u(k, j))) / pivot;
                }
                value
            };
            f.set(self.u(i, j), value);
        }
    }
}

/// `L` and `U` both start as the identity
fn identity_factors(n: usize) -> Vec<f32> {
    let mut identity = vec![0.0f32; 2 * n * n];
    for i in 0..n {
        identity[i * n + i] = 1.0;
        identity[n * n + i * n + i] = 1.0;
    }
    identity
}

impl PhasedKernel for LudKernel {
    fn name(&self) -> &'static str {
        "lud"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.step.store(0, Ordering::Release);
        self.factors.reset_from(&identity_factors(self.n));
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let i = self.step.load(Ordering::Acquire);
        match phase {
            L_COLUMN => self.l_column(i, ctx),
            U_ROW => self.u_row(i, ctx),
            other => return Err(NpuForgeError::UnknownPhase(other.0)),
        }
        Ok(())
    }

    fn next_phase(&self, completed: PhaseId) -> Option<PhaseId> {
        if completed == L_COLUMN {
            return Some(U_ROW);
        }
        let step = self.step.fetch_add(1, Ordering::AcqRel) + 1;
        (step < self.n).then_some(L_COLUMN)
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.factors)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.factors.committed_prefix(self.publisher.element_count()))
    }
}
