//! 2D integer convolution with a square filter
//!
//! Only positions whose `K x K` window lies inside the input are computed.
//! Each unit owns a halo-clipped row block and writes its results packed at
//! the top-left of the output; the publish reshape moves the packed block by
//! the margin so that output `(i, j)` is centred on input `(i, j)` and the
//! border stays zero.

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{Grid, PartitionStrategy};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

const CONVOLVE: PhaseId = PhaseId(0);

pub struct ConvKernel {
    grid: Grid,
    dim: usize,
    kernel_dim: usize,
    input: SharedBuffer<i32>,
    filter: SharedBuffer<i32>,
    output: SharedBuffer<i32>,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl ConvKernel {
    /// `input` is `dim x dim`, `filter` is `kernel_dim x kernel_dim` with an
    /// odd `kernel_dim <= dim`
    pub fn new(
        grid: Grid,
        dim: usize,
        kernel_dim: usize,
        input: &[i32],
        filter: &[i32],
    ) -> ForgeResult<Self> {
        if kernel_dim == 0 || kernel_dim % 2 == 0 || kernel_dim > dim {
            return Err(problem_error!(
                "filter size {} must be odd and at most the input size {}",
                kernel_dim,
                dim
            ));
        }
        expect_len(input, dim * dim)?;
        expect_len(filter, kernel_dim * kernel_dim)?;

        let margin = kernel_dim / 2;
        let publisher = ResultPublisher::new(dim * dim)
            .with_reshape(move |output: &SharedBuffer<i32>| shift_packed(output, dim, margin));

        Ok(ConvKernel {
            grid,
            dim,
            kernel_dim,
            input: SharedBuffer::from_slice(input),
            filter: SharedBuffer::from_slice(filter),
            output: SharedBuffer::zeroed(dim * dim),
            plan: PhasePlan::builder().phase("convolve", 42).build()?,
            publisher,
        })
    }

    pub fn with_default_data(grid: Grid, dim: usize, kernel_dim: usize, seed: u64) -> ForgeResult<Self> {
        let input = datasets::int_samples(dim * dim, -10, 10, seed);
        let filter = datasets::int_samples(kernel_dim * kernel_dim, -3, 3, seed + 1);
        Self::new(grid, dim, kernel_dim, &input, &filter)
    }

    fn margin(&self) -> usize {
        self.kernel_dim / 2
    }

    fn window(&self, i: usize, j: usize) -> i32 {
        let (d, k, m) = (self.dim, self.kernel_dim, self.margin());
        let mut acc = 0;
        for kr in 0..k {
            for kc in 0..k {
                let product = self.input.get((i - m + kr) * d + (j - m + kc)).wrapping_mul(self.filter.get(kr * k + kc));
                acc = i32::wrapping_add(acc, product);
            }
        }
        acc
    }
}

/// Move the packed block at `(0, 0)` to `(margin, margin)` and zero the rest
fn shift_packed(output: &SharedBuffer<i32>, dim: usize, margin: usize) {
    let packed = output.snapshot();
    let valid = dim - 2 * margin;
    let mut shifted = vec![0; dim * dim];
    for r in 0..valid {
        for c in 0..valid {
            shifted[(r + margin) * dim + c + margin] = packed[r * dim + c];
        }
    }
    output.write_range(0, &shifted);
}

impl PhasedKernel for ConvKernel {
    fn name(&self) -> &'static str {
        "conv"
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
        if phase != CONVOLVE {
            return Err(NpuForgeError::UnknownPhase(phase.0));
        }
        let (d, m) = (self.dim, self.margin());
        let rows = PartitionStrategy::Halo { margin: m }.range(d, ctx.unit(), &self.grid);
        for i in rows {
            for j in m..d - m {
                self.output.set((i - m) * d + (j - m), self.window(i, j));
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
    use crate::datasets::DEFAULT_SEED;
    use crate::kernels::testing::{grid, run_parallel, run_sequential};

    fn host_conv(input: &[i32], filter: &[i32], d: usize, k: usize) -> Vec<i32> {
        let m = k / 2;
        let mut out = vec![0; d * d];
        for i in m..d - m {
            for j in m..d - m {
                let mut acc = 0;
                for kr in 0..k {
                    for kc in 0..k {
                        acc = i32::wrapping_add(acc, input[(i + kr - m) * d + j + kc - m].wrapping_mul(filter[kr * k + kc]));
                    }
                }
                out[i * d + j] = acc;
            }
        }
        out
    }

    #[test]
    fn test_identity_filter_keeps_interior() {
        let input: Vec<i32> = (1..=16).collect();
        let filter = [0, 0, 0, 0, 1, 0, 0, 0, 0];
        let kernel = ConvKernel::new(grid(2, 1), 4, 3, &input, &filter).unwrap();
        run_parallel(&kernel);
        assert_eq!(
            kernel.output(),
            KernelOutput::I32(vec![0, 0, 0, 0, 0, 6, 7, 0, 0, 10, 11, 0, 0, 0, 0, 0])
        );
    }

    #[test]
    fn test_default_dataset_matches_host() {
        let input = datasets::int_samples(256, -10, 10, DEFAULT_SEED);
        let filter = datasets::int_samples(9, -3, 3, DEFAULT_SEED + 1);
        let expected = KernelOutput::from(host_conv(&input, &filter, 16, 3));

        let reference = ConvKernel::with_default_data(grid(1, 1), 16, 3, DEFAULT_SEED).unwrap();
        run_sequential(&reference);
        assert_eq!(reference.output(), expected);

        let parallel = ConvKernel::with_default_data(grid(3, 3), 16, 3, DEFAULT_SEED).unwrap();
        run_parallel(&parallel);
        assert_eq!(parallel.output(), expected);
    }

    #[test]
    fn test_five_tap_filter() {
        let input = datasets::int_samples(64, -5, 5, 3);
        let filter = datasets::int_samples(25, -2, 2, 4);
        let kernel = ConvKernel::new(grid(2, 2), 8, 5, &input, &filter).unwrap();
        run_parallel(&kernel);
        assert_eq!(kernel.output(), KernelOutput::from(host_conv(&input, &filter, 8, 5)));
    }

    #[test]
    fn test_second_run_matches_first() {
        let kernel = ConvKernel::with_default_data(grid(2, 2), 16, 3, DEFAULT_SEED).unwrap();
        run_parallel(&kernel);
        let first = kernel.output();
        run_parallel(&kernel);
        assert_eq!(kernel.output(), first);
        run_sequential(&kernel);
        assert_eq!(kernel.output(), first);
    }

    #[test]
    fn test_overflow_wraps() {
        let input = [i32::MAX; 9];
        let filter = [i32::MAX; 9];
        let expected = KernelOutput::from(host_conv(&input, &filter, 3, 3));
        assert_eq!(expected, KernelOutput::I32(vec![0, 0, 0, 0, 9, 0, 0, 0, 0]));

        let reference = ConvKernel::new(grid(1, 1), 3, 3, &input, &filter).unwrap();
        run_sequential(&reference);
        assert_eq!(reference.output(), expected);
        let parallel = ConvKernel::new(grid(2, 2), 3, 3, &input, &filter).unwrap();
        run_parallel(&parallel);
        assert_eq!(parallel.output(), expected);
    }

    #[test]
    fn test_rejects_even_filter() {
        assert!(matches!(
            ConvKernel::new(grid(1, 1), 4, 2, &[0; 16], &[0; 4]),
            Err(NpuForgeError::InvalidProblemSize(_))
        ));
    }
}
