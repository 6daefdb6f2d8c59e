//! 8x8 integer forward DCT
//!
//! Computes `C = clip((clip((D8 * X + r1) >> s1) * D8^T + r2) >> s2)` with the
//! HEVC integer basis. Every phase distributes rows cyclically over cores and
//! columns cyclically over threads.

use crate::backend::UnitContext;
use crate::datasets::DCT_INPUT;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{ExecutionUnit, Grid, PartitionStrategy};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

/// Block edge
pub const BLOCK: usize = 8;

/// Bit depth of the input samples
pub const BIT_DEPTH: i32 = 8;

const LOG2_BLOCK: i32 = 3;
const COEFF_MIN: i32 = -32768;
const COEFF_MAX: i32 = 32767;

#[rustfmt::skip]
const D8: [i32; 64] = [
    64,  64,  64,  64,  64,  64,  64,  64,
    89,  75,  50,  18, -18, -50, -75, -89,
    83,  36, -36, -83, -83, -36,  36,  83,
    75, -18, -89, -50,  50,  89,  18, -75,
    64, -64, -64,  64,  64, -64, -64,  64,
    50, -89,  18,  75, -75, -18,  89, -50,
    36, -83,  83, -36, -36,  83, -83,  36,
    18, -50,  75, -89,  89, -75,  50, -18,
];

const FIRST_MULTIPLY: PhaseId = PhaseId(0);
const FIRST_CLIP: PhaseId = PhaseId(1);
const SECOND_MULTIPLY: PhaseId = PhaseId(2);
const SECOND_CLIP: PhaseId = PhaseId(3);

fn clip3(lo: i32, hi: i32, x: i32) -> i32 {
    x.clamp(lo, hi)
}

/// Rounding right shift followed by clipping to the coefficient range
fn scale(value: i32, shift: i32) -> i32 {
    clip3(COEFF_MIN, COEFF_MAX, value.wrapping_add(1 << (shift - 1)) >> shift)
}

pub struct DctKernel {
    grid: Grid,
    basis: SharedBuffer<i32>,
    basis_t: SharedBuffer<i32>,
    input: SharedBuffer<i32>,
    /// `D8 * X`
    product: SharedBuffer<i32>,
    /// clipped `product`
    clipped: SharedBuffer<i32>,
    output: SharedBuffer<i32>,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl DctKernel {
    pub fn new(grid: Grid, input: &[i32]) -> ForgeResult<Self> {
        expect_len(input, BLOCK * BLOCK)?;

        let mut basis_t = [0; 64];
        for i in 0..BLOCK {
            for j in 0..BLOCK {
                basis_t[j * BLOCK + i] = D8[i * BLOCK + j];
            }
        }

        let plan = PhasePlan::builder()
            .phase("multiply_basis", 42)
            .phase("clip_first", 43)
            .phase("multiply_basis_t", 44)
            .phase("clip_second", 45)
            .build()?;

        Ok(DctKernel {
            grid,
            basis: SharedBuffer::from_slice(&D8),
            basis_t: SharedBuffer::from_slice(&basis_t),
            input: SharedBuffer::from_slice(input),
            product: SharedBuffer::zeroed(BLOCK * BLOCK),
            clipped: SharedBuffer::zeroed(BLOCK * BLOCK),
            output: SharedBuffer::zeroed(BLOCK * BLOCK),
            plan,
            publisher: ResultPublisher::new(BLOCK * BLOCK),
        })
    }

    pub fn with_default_data(grid: Grid) -> ForgeResult<Self> {
        Self::new(grid, &DCT_INPUT)
    }

    fn cells(&self, unit: ExecutionUnit) -> impl Iterator<Item = (usize, usize)> {
        let rows = PartitionStrategy::CoreCyclic.range(BLOCK, unit, &self.grid);
        let cols = PartitionStrategy::ThreadCyclic.range(BLOCK, unit, &self.grid);
        rows.into_iter()
            .flat_map(move |i| cols.into_iter().map(move |j| (i, j)))
    }

    fn multiply(&self, unit: ExecutionUnit, a: &SharedBuffer<i32>, b: &SharedBuffer<i32>, c: &SharedBuffer<i32>) {
        for (i, j) in self.cells(unit) {
            let mut acc = 0;
            for k in 0..BLOCK {
                acc = i32::wrapping_add(acc, a.get(i * BLOCK + k).wrapping_mul(b.get(k * BLOCK + j)));
            }
            c.set(i * BLOCK + j, acc);
        }
    }

    fn clip(&self, unit: ExecutionUnit, src: &SharedBuffer<i32>, dst: &SharedBuffer<i32>, shift: i32) {
        for (i, j) in self.cells(unit) {
            let index = i * BLOCK + j;
            dst.set(index, scale(src.get(index), shift));
        }
    }
}

impl PhasedKernel for DctKernel {
    fn name(&self) -> &'static str {
        "dct"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.product.reset();
        self.clipped.reset();
        self.output.reset();
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let unit = ctx.unit();
        match phase {
            FIRST_MULTIPLY => self.multiply(unit, &self.basis, &self.input, &self.product),
            FIRST_CLIP => self.clip(unit, &self.product, &self.clipped, BIT_DEPTH + LOG2_BLOCK - 9),
            SECOND_MULTIPLY => self.multiply(unit, &self.clipped, &self.basis_t, &self.output),
            SECOND_CLIP => self.clip(unit, &self.output, &self.output, LOG2_BLOCK + 6),
            other => return Err(NpuForgeError::UnknownPhase(other.0)),
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
