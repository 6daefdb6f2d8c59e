//! Cosimulation: run a kernel on both backends and compare the results
//!
//! The sequential reference backend is the golden model. Integer outputs must
//! match bit for bit; float outputs may differ by `tolerance` relative to the
//! larger magnitude of the pair (absolute below 1.0).

use rayon::prelude::*;
use serde::Serialize;

use crate::backend::{ComputeBackend, ParallelBackend, RunReport, SequentialReferenceBackend};
use crate::config::RunConfig;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::Grid;
use crate::kernels::{KernelKind, KernelOutput};

/// Element-wise comparison of two outputs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub compared: usize,
    pub mismatches: usize,
    pub first_mismatch: Option<usize>,
    pub max_abs_diff: f64,
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        self.mismatches == 0
    }

    fn disjoint(expected: &KernelOutput, actual: &KernelOutput) -> Self {
        let len = expected.len().max(actual.len());
        Comparison {
            compared: 0,
            mismatches: len,
            first_mismatch: if len == 0 { None } else { Some(0) },
            max_abs_diff: f64::INFINITY,
        }
    }
}

/// `true` when `a` and `b` agree within `tolerance`
pub fn within_tolerance(a: f32, b: f32, tolerance: f32) -> bool {
    if a == b {
        return true;
    }
    if !(a.is_finite() && b.is_finite()) {
        return false;
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tolerance * scale
}

fn compare_exact<T>(expected: &[T], actual: &[T]) -> (Vec<usize>, f64)
where
    T: Copy + PartialEq + Into<f64> + Sync,
{
    let mismatched: Vec<usize> = expected
        .par_iter()
        .zip(actual.par_iter())
        .enumerate()
        .filter_map(|(i, (a, b))| (a != b).then_some(i))
        .collect();
    let max_abs_diff = expected
        .par_iter()
        .zip(actual.par_iter())
        .map(|(&a, &b)| (a.into() - b.into()).abs())
        .reduce(|| 0.0, f64::max);
    (mismatched, max_abs_diff)
}

fn compare_floats(expected: &[f32], actual: &[f32], tolerance: f32) -> (Vec<usize>, f64) {
    let mismatched: Vec<usize> = expected
        .par_iter()
        .zip(actual.par_iter())
        .enumerate()
        .filter_map(|(i, (&a, &b))| (!within_tolerance(a, b, tolerance)).then_some(i))
        .collect();
    let max_abs_diff = expected
        .par_iter()
        .zip(actual.par_iter())
        .map(|(&a, &b)| (f64::from(a) - f64::from(b)).abs())
        .reduce(|| 0.0, f64::max);
    (mismatched, max_abs_diff)
}

/// Compare `actual` against `expected`
///
/// Outputs of different element types never match. Elements past the shorter
/// output count as mismatches.
pub fn compare_outputs(expected: &KernelOutput, actual: &KernelOutput, tolerance: f32) -> Comparison {
    let (mismatched, max_abs_diff) = match (expected, actual) {
        (KernelOutput::I32(e), KernelOutput::I32(a)) => compare_exact(e, a),
        (KernelOutput::U32(e), KernelOutput::U32(a)) => compare_exact(e, a),
        (KernelOutput::F32(e), KernelOutput::F32(a)) => compare_floats(e, a, tolerance),
        _ => return Comparison::disjoint(expected, actual),
    };

    let compared = expected.len().min(actual.len());
    let missing = expected.len().max(actual.len()) - compared;
    let first_mismatch = mismatched
        .first()
        .copied()
        .or(if missing > 0 { Some(compared) } else { None });

    Comparison {
        compared,
        mismatches: mismatched.len() + missing,
        first_mismatch,
        max_abs_diff,
    }
}

/// Result of a successful cosimulation
#[derive(Debug, Clone, Serialize)]
pub struct CosimReport {
    pub kernel: String,
    pub grid: Grid,
    pub tolerance: f32,
    pub reference: RunReport,
    pub parallel: RunReport,
    pub comparison: Comparison,
    pub output: KernelOutput,
}

/// Run `kind` on the reference and the parallel backend and compare
///
/// Each backend gets a freshly built kernel with the default dataset, so the
/// runs share no state. Returns [`NpuForgeError::OutputMismatch`] when the
/// outputs diverge.
pub fn cosimulate(kind: KernelKind, config: &RunConfig) -> ForgeResult<CosimReport> {
    config.validate()?;
    let grid = config.grid()?;

    let reference_kernel = kind.build(grid)?;
    let reference = SequentialReferenceBackend::new(grid)
        .with_scratchpad_bytes(config.scratchpad_bytes)
        .execute(reference_kernel.as_ref())?;

    let parallel_kernel = kind.build(grid)?;
    let parallel = ParallelBackend::new(grid)
        .with_scratchpad_bytes(config.scratchpad_bytes)
        .execute(parallel_kernel.as_ref())?;

    let tolerance = if kind.is_float() { config.tolerance } else { 0.0 };
    let expected = reference_kernel.output();
    let comparison = compare_outputs(&expected, &parallel_kernel.output(), tolerance);

    if !comparison.is_match() {
        tracing::error!(
            kernel = kind.name(),
            grid = %grid,
            mismatches = comparison.mismatches,
            first = ?comparison.first_mismatch,
            max_abs_diff = comparison.max_abs_diff,
            "cosimulation mismatch"
        );
        return Err(NpuForgeError::OutputMismatch {
            kernel: kind.name().to_string(),
            mismatches: comparison.mismatches,
        });
    }

    tracing::info!(
        kernel = kind.name(),
        grid = %grid,
        elements = comparison.compared,
        max_abs_diff = comparison.max_abs_diff,
        "cosimulation passed"
    );
    Ok(CosimReport {
        kernel: kind.name().to_string(),
        grid,
        tolerance,
        reference,
        parallel,
        comparison,
        output: expected,
    })
}
