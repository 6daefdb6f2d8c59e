//! Static work partitioning
//!
//! Every kernel divides its index space among the units of a [`Grid`] with one
//! of a handful of deterministic rules. The dominant rule is
//! [`partition`]: contiguous row blocks per core (the last core absorbs the
//! remainder) with threads interleaved by stride inside the block.
//!
//! Ranges never fail. A unit whose share is empty gets an empty [`WorkRange`]
//! and simply does nothing.

use serde::Serialize;

use super::{ExecutionUnit, Grid};
use crate::error::{ForgeResult, NpuForgeError};

/// Half-open strided index interval `[start, end)` owned by one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkRange {
    pub start: usize,
    pub end: usize,
    pub stride: usize,
}

impl WorkRange {
    /// Build a range; `start >= end` collapses to an empty range
    pub fn new(start: usize, end: usize, stride: usize) -> Self {
        debug_assert!(stride > 0, "work range stride must be positive");
        let stride = stride.max(1);
        if start >= end {
            return WorkRange {
                start: end,
                end,
                stride,
            };
        }
        WorkRange { start, end, stride }
    }

    /// Contiguous range with stride 1
    pub fn contiguous(start: usize, end: usize) -> Self {
        WorkRange::new(start, end, 1)
    }

    pub fn empty() -> Self {
        WorkRange {
            start: 0,
            end: 0,
            stride: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Number of indices visited
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start + self.stride - 1) / self.stride
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end && (index - self.start) % self.stride == 0
    }

    pub fn iter(&self) -> std::iter::StepBy<std::ops::Range<usize>> {
        (self.start..self.end).step_by(self.stride)
    }

    /// Intersect with `[lo, hi)`, keeping the stride phase
    pub fn clip(&self, lo: usize, hi: usize) -> Self {
        if self.is_empty() || lo >= hi {
            return WorkRange::new(hi, hi, self.stride);
        }
        let mut start = self.start;
        if start < lo {
            let steps = (lo - start + self.stride - 1) / self.stride;
            start += steps * self.stride;
        }
        WorkRange::new(start, self.end.min(hi), self.stride)
    }
}

impl IntoIterator for WorkRange {
    type Item = usize;
    type IntoIter = std::iter::StepBy<std::ops::Range<usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Contiguous block `[start, end)` of `problem_size` owned by `core`
///
/// `rows_per_core = problem_size / cores`; the last core absorbs the remainder.
pub fn core_block(problem_size: usize, core: usize, grid: &Grid) -> (usize, usize) {
    let cores = grid.core_count();
    let rows_per_core = problem_size / cores;
    let start = core * rows_per_core;
    let end = if core + 1 < cores {
        (core + 1) * rows_per_core
    } else {
        problem_size
    };
    (start.min(problem_size), end)
}

/// Block-strided partition of `[0, problem_size)`
///
/// Core `c` owns a contiguous block, thread `t` visits
/// `block_start + t, block_start + t + threads, ...` inside it.
pub fn partition(problem_size: usize, unit: ExecutionUnit, grid: &Grid) -> WorkRange {
    let (start, end) = core_block(problem_size, unit.core_id, grid);
    WorkRange::new(start + unit.thread_id, end, grid.thread_count())
}

/// Block-strided partition with `margin` rows excluded at both borders
///
/// Used by stencil kernels to avoid out-of-bounds halo reads. The blocks are
/// computed over the full problem and then clipped, so the union is exactly
/// `[margin, problem_size - margin)`.
pub fn partition_with_margin(
    problem_size: usize,
    margin: usize,
    unit: ExecutionUnit,
    grid: &Grid,
) -> WorkRange {
    let hi = problem_size.saturating_sub(margin);
    partition(problem_size, unit, grid).clip(margin, hi)
}

/// Cyclic assignment: `index, index + count, ...` below `problem_size`
pub fn cyclic(problem_size: usize, index: usize, count: usize) -> WorkRange {
    WorkRange::new(index, problem_size, count)
}

/// Named partitioning rules, selectable per kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Row blocks per core, threads strided inside the block
    BlockStrided,
    /// Row blocks clipped by a halo margin at both borders
    Halo { margin: usize },
    /// Cores take every `cores`-th index starting at their id
    CoreCyclic,
    /// Threads take every `threads`-th index starting at their id
    ThreadCyclic,
    /// Units take every `cores * threads`-th index, in core-major order
    UnitCyclic,
}

impl PartitionStrategy {
    pub fn range(&self, problem_size: usize, unit: ExecutionUnit, grid: &Grid) -> WorkRange {
        match *self {
            PartitionStrategy::BlockStrided => partition(problem_size, unit, grid),
            PartitionStrategy::Halo { margin } => {
                partition_with_margin(problem_size, margin, unit, grid)
            }
            PartitionStrategy::CoreCyclic => {
                cyclic(problem_size, unit.core_id, grid.core_count())
            }
            PartitionStrategy::ThreadCyclic => {
                cyclic(problem_size, unit.thread_id, grid.thread_count())
            }
            PartitionStrategy::UnitCyclic => {
                cyclic(problem_size, grid.linear_index(unit), grid.unit_count())
            }
        }
    }

    /// Indices `[lo, hi)` that the union of all ranges must cover
    pub fn coverage(&self, problem_size: usize) -> (usize, usize) {
        match *self {
            PartitionStrategy::Halo { margin } => {
                let hi = problem_size.saturating_sub(margin);
                (margin.min(hi), hi)
            }
            _ => (0, problem_size),
        }
    }
}

/// Turn schedule of the tiled matrix multiply
///
/// Thread `t` of core `c` owns row `c * tile_dim + t`; each turn covers
/// `tile_dim` output columns. The layout only works when
/// `tile_dim == n / cores` and `cores * threads == n`, which is checked here
/// instead of producing silently wrong results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledSchedule {
    n: usize,
    tile_dim: usize,
}

impl TiledSchedule {
    pub fn new(n: usize, grid: &Grid) -> ForgeResult<Self> {
        if n == 0 || n % grid.core_count() != 0 {
            return Err(NpuForgeError::InvalidProblemSize(format!(
                "tiled schedule needs n divisible by cores: n={}, cores={}",
                n,
                grid.core_count()
            )));
        }
        if grid.unit_count() != n {
            return Err(NpuForgeError::InvalidProblemSize(format!(
                "tiled schedule needs cores * threads == n: {} * {} != {}",
                grid.core_count(),
                grid.thread_count(),
                n
            )));
        }
        Ok(TiledSchedule {
            n,
            tile_dim: n / grid.core_count(),
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn tile_dim(&self) -> usize {
        self.tile_dim
    }

    pub fn turns(&self) -> usize {
        self.n / self.tile_dim
    }

    pub fn row(&self, unit: ExecutionUnit) -> usize {
        unit.core_id * self.tile_dim + unit.thread_id
    }

    /// First output column of `turn`
    pub fn column_offset(&self, turn: usize) -> usize {
        turn * self.tile_dim
    }
}
