//! Integer FIR filter with startup and tail handling
//!
//! The filter is centred: output `i` ends its window at input
//! `h - 1 + i` where `h = (taps + 1) / 2`. During startup the window grows by
//! one tap per output until it holds every tap; once the window reaches the
//! last input it stays there and drops its oldest coefficient per output.
//! Each output is computed independently from that closed form, so outputs
//! are distributed cyclically over all units.

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::{Grid, PartitionStrategy};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::SharedBuffer;
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

pub const DEFAULT_TAPS: usize = 35;
pub const DEFAULT_SCALE: i32 = 285;
pub const DEFAULT_SAMPLES: usize = 32;

const FILTER: PhaseId = PhaseId(0);

/// Window of one output: last input index, first coefficient, term count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    last_input: usize,
    first_coef: usize,
    terms: usize,
}

pub struct FirKernel {
    grid: Grid,
    input: SharedBuffer<i32>,
    coefs: SharedBuffer<i32>,
    output: SharedBuffer<i32>,
    scale: i32,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl FirKernel {
    pub fn new(grid: Grid, input: &[i32], coefs: &[i32], scale: i32) -> ForgeResult<Self> {
        if coefs.is_empty() || scale == 0 {
            return Err(problem_error!("filter needs taps and a non-zero scale"));
        }
        let half = (coefs.len() + 1) >> 1;
        if input.len() < half {
            return Err(problem_error!(
                "{} samples are fewer than half the {} taps",
                input.len(),
                coefs.len()
            ));
        }

        Ok(FirKernel {
            grid,
            input: SharedBuffer::from_slice(input),
            coefs: SharedBuffer::from_slice(coefs),
            output: SharedBuffer::zeroed(input.len()),
            scale,
            plan: PhasePlan::builder().phase("filter", 60).build()?,
            publisher: ResultPublisher::new(input.len()),
        })
    }

    pub fn with_default_data(grid: Grid, seed: u64) -> ForgeResult<Self> {
        let input = datasets::int_samples(DEFAULT_SAMPLES, -1000, 1000, seed);
        let coefs = datasets::int_samples(DEFAULT_TAPS, -300, 300, seed + 1);
        Self::new(grid, &input, &coefs, DEFAULT_SCALE)
    }

    fn window(&self, i: usize) -> Window {
        let taps = self.coefs.len();
        let half = (taps + 1) >> 1;
        let last = self.input.len() - 1;
        let steady_end = last + 1 - half;

        if i <= steady_end {
            Window {
                last_input: half - 1 + i,
                first_coef: 0,
                terms: (half + i).min(taps),
            }
        } else {
            let dropped = i - steady_end;
            Window {
                last_input: last,
                first_coef: dropped,
                terms: (half + steady_end).min(taps).saturating_sub(dropped).max(1),
            }
        }
    }

    fn filter_one(&self, i: usize) -> i32 {
        let w = self.window(i);
        let mut acc = 0i32;
        for t in 0..w.terms {
            let product = self.coefs.get(w.first_coef + t).wrapping_mul(self.input.get(w.last_input - t));
            acc = acc.wrapping_add(product);
        }
        acc.wrapping_div(self.scale)
    }
}

impl PhasedKernel for FirKernel {
    fn name(&self) -> &'static str {
        "fir"
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
        if phase != FILTER {
            return Err(NpuForgeError::UnknownPhase(phase.0));
        }
        for i in PartitionStrategy::UnitCyclic.range(self.output.len(), ctx.unit(), &self.grid) {
            self.output.set(i, self.filter_one(i));
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

    /// Sequential filter walking a moving input cursor, as a golden model
    fn streaming_fir(input: &[i32], coefs: &[i32], scale: i32) -> Vec<i32> {
        let taps = coefs.len();
        let mut acc_len = (taps + 1) >> 1;
        let mut cursor = acc_len - 1;
        let mut coef_start = 0;
        let last = input.len() - 1;
        let mut out = Vec::with_capacity(input.len());

        for _ in 0..input.len() {
            let mut acc = coefs[coef_start].wrapping_mul(input[cursor]);
            for j in 1..acc_len {
                acc = acc.wrapping_add(coefs[coef_start + j].wrapping_mul(input[cursor - j]));
            }
            out.push(acc.wrapping_div(scale));

            if cursor == last {
                acc_len -= 1;
                coef_start += 1;
            } else {
                if acc_len < taps {
                    acc_len += 1;
                }
                cursor += 1;
            }
        }
        out
    }

    #[test]
    fn test_matches_streaming_model() {
        let input = datasets::int_samples(DEFAULT_SAMPLES, -1000, 1000, DEFAULT_SEED);
        let coefs = datasets::int_samples(DEFAULT_TAPS, -300, 300, DEFAULT_SEED + 1);
        let expected = KernelOutput::from(streaming_fir(&input, &coefs, DEFAULT_SCALE));

        let reference = FirKernel::with_default_data(grid(1, 1), DEFAULT_SEED).unwrap();
        run_sequential(&reference);
        assert_eq!(reference.output(), expected);

        let parallel = FirKernel::with_default_data(grid(3, 4), DEFAULT_SEED).unwrap();
        run_parallel(&parallel);
        assert_eq!(parallel.output(), expected);
    }

    #[test]
    fn test_short_filter_long_input() {
        let input: Vec<i32> = (0..20).map(|v| v * 3 - 17).collect();
        let coefs = [1, 2, 3, 2, 1];
        let kernel = FirKernel::new(grid(2, 2), &input, &coefs, 3).unwrap();
        run_parallel(&kernel);
        assert_eq!(kernel.output(), KernelOutput::from(streaming_fir(&input, &coefs, 3)));
    }

    #[test]
    fn test_overflow_wraps() {
        let input = [i32::MAX; 6];
        let coefs = [i32::MAX; 3];
        let expected = KernelOutput::from(streaming_fir(&input, &coefs, 1));

        let reference = FirKernel::new(grid(1, 1), &input, &coefs, 1).unwrap();
        run_sequential(&reference);
        assert_eq!(reference.output(), expected);
        let parallel = FirKernel::new(grid(2, 2), &input, &coefs, 1).unwrap();
        run_parallel(&parallel);
        assert_eq!(parallel.output(), expected);

        let kernel = FirKernel::new(grid(1, 2), &[i32::MIN, 4], &[1], -1).unwrap();
        run_parallel(&kernel);
        assert_eq!(kernel.output(), KernelOutput::I32(vec![i32::MIN, -4]));
    }

    #[test]
    fn test_windows() {
        let kernel = FirKernel::with_default_data(grid(1, 1), DEFAULT_SEED).unwrap();
        assert_eq!(
            kernel.window(0),
            Window { last_input: 17, first_coef: 0, terms: 18 }
        );
        assert_eq!(
            kernel.window(14),
            Window { last_input: 31, first_coef: 0, terms: 32 }
        );
        assert_eq!(
            kernel.window(31),
            Window { last_input: 31, first_coef: 17, terms: 15 }
        );
    }

    #[test]
    fn test_rejects_short_input() {
        assert!(matches!(
            FirKernel::new(grid(1, 1), &[1, 2], &[1, 1, 1, 1, 1], 1),
            Err(NpuForgeError::InvalidProblemSize(_))
        ));
    }
}
