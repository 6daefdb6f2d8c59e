//! Batch k-means clustering
//!
//! Initial centroids are copies of the first `k` points. Each batch iteration
//! recomputes the centroids from the current assignment, checks whether the
//! total distance got worse (restoring the previous assignment and stopping
//! if so), then reassigns every point to its nearest centroid and stops when
//! nothing changed or after [`MAX_ITERATIONS`].
//!
//! The loop is a state machine driven by [`PhasedKernel::next_phase`]:
//!
//! ```text
//! distances -> assign -> save -> centroids -> total_distance -> decide
//!                 ^                   ^                           |
//!                 |                   +-- restore <-- worse ------+
//!                 +------ distances <--- save <--- improved ------+
//! ```
//!
//! All floating-point reductions run in point order on a single unit, so the
//! result does not depend on the grid.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::backend::UnitContext;
use crate::datasets;
use crate::error::{expect_len, ForgeResult, NpuForgeError};
use crate::grid::{ExecutionUnit, Grid, PartitionStrategy};
use crate::kernels::{KernelOutput, PhasedKernel};
use crate::memory::{PartialSlots, SharedBuffer};
use crate::problem_error;
use crate::publish::{PublishReport, ResultPublisher};
use crate::sync::{PhaseId, PhasePlan};

pub const MAX_ITERATIONS: usize = 100;

pub const DEFAULT_POINTS: usize = 32;
pub const DEFAULT_CLUSTERS: usize = 4;
pub const DEFAULT_DIMENSIONS: usize = 8;

const DISTANCES: PhaseId = PhaseId(0);
const ASSIGN: PhaseId = PhaseId(1);
const SAVE: PhaseId = PhaseId(2);
const CENTROIDS: PhaseId = PhaseId(3);
const TOTAL_DISTANCE: PhaseId = PhaseId(4);
const DECIDE: PhaseId = PhaseId(5);
const RESTORE: PhaseId = PhaseId(6);
const WRITE_OUTPUT: PhaseId = PhaseId(7);

const UNASSIGNED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Stage {
    Initial = 0,
    Iterating = 1,
    Restoring = 2,
}

impl Stage {
    fn from_u8(value: u8) -> Stage {
        match value {
            0 => Stage::Initial,
            1 => Stage::Iterating,
            _ => Stage::Restoring,
        }
    }
}

pub struct KmeansKernel {
    grid: Grid,
    n: usize,
    k: usize,
    dim: usize,
    max_iterations: usize,
    points: SharedBuffer<f32>,
    centroids: SharedBuffer<f32>,
    /// `n x k` squared distances
    distances: SharedBuffer<f32>,
    current: SharedBuffer<i32>,
    previous: SharedBuffer<i32>,
    point_distance: SharedBuffer<f32>,
    output: SharedBuffer<i32>,
    changes: PartialSlots<u64>,
    stage: AtomicU8,
    iteration: AtomicUsize,
    prev_total: AtomicU64,
    worse: AtomicBool,
    plan: PhasePlan,
    publisher: ResultPublisher<i32>,
}

impl KmeansKernel {
    /// `points` holds `n` row-major points of `dim` coordinates
    pub fn new(grid: Grid, points: &[f32], n: usize, k: usize, dim: usize) -> ForgeResult<Self> {
        if k == 0 || dim == 0 || n < k {
            return Err(problem_error!(
                "k-means needs 0 < k <= n and dim > 0 (n={}, k={}, dim={})",
                n,
                k,
                dim
            ));
        }
        expect_len(points, n * dim)?;

        let plan = PhasePlan::builder()
            .phase("distances", 100)
            .phase("assign", 101)
            .phase("save", 102)
            .phase("centroids", 103)
            .phase("total_distance", 104)
            .phase("decide", 105)
            .phase("restore", 106)
            .phase("write_output", 107)
            .build()?;

        Ok(KmeansKernel {
            grid,
            n,
            k,
            dim,
            max_iterations: MAX_ITERATIONS,
            points: SharedBuffer::from_slice(points),
            centroids: SharedBuffer::from_slice(&points[..k * dim]),
            distances: SharedBuffer::zeroed(n * k),
            current: SharedBuffer::filled(n, UNASSIGNED),
            previous: SharedBuffer::filled(n, UNASSIGNED),
            point_distance: SharedBuffer::zeroed(n),
            output: SharedBuffer::zeroed(n),
            changes: PartialSlots::new(grid.unit_count()),
            stage: AtomicU8::new(Stage::Initial as u8),
            iteration: AtomicUsize::new(0),
            prev_total: AtomicU64::new(f64::INFINITY.to_bits()),
            worse: AtomicBool::new(false),
            plan,
            publisher: ResultPublisher::new(n),
        })
    }

    pub fn with_default_data(grid: Grid, seed: u64) -> ForgeResult<Self> {
        let points = datasets::kmeans_points(DEFAULT_POINTS, DEFAULT_DIMENSIONS, DEFAULT_CLUSTERS, seed);
        Self::new(grid, &points, DEFAULT_POINTS, DEFAULT_CLUSTERS, DEFAULT_DIMENSIONS)
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Completed batch iterations
    pub fn iterations(&self) -> usize {
        self.iteration.load(Ordering::Acquire)
    }

    /// Centroids as of the last completed phase
    pub fn centroids(&self) -> Vec<f32> {
        self.centroids.snapshot()
    }

    fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    fn squared_distance(&self, point: usize, cluster: usize) -> f32 {
        let mut sum = 0.0f32;
        for d in 0..self.dim {
            let diff = self.points.get(point * self.dim + d) - self.centroids.get(cluster * self.dim + d);
            sum += diff * diff;
        }
        sum
    }

    fn unit_points(&self, unit: ExecutionUnit) -> impl Iterator<Item = usize> {
        PartitionStrategy::UnitCyclic.range(self.n, unit, &self.grid).into_iter()
    }

    fn calc_distances(&self, unit: ExecutionUnit) {
        let points = PartitionStrategy::CoreCyclic.range(self.n, unit, &self.grid);
        let clusters = PartitionStrategy::ThreadCyclic.range(self.k, unit, &self.grid);
        for i in points {
            for c in clusters {
                self.distances.set(i * self.k + c, self.squared_distance(i, c));
            }
        }
    }

    fn assign(&self, unit: ExecutionUnit) {
        let mut changed = 0u64;
        for i in self.unit_points(unit) {
            let mut best = UNASSIGNED;
            let mut closest = f32::INFINITY;
            for c in 0..self.k {
                let distance = self.distances.get(i * self.k + c);
                if distance < closest {
                    best = c as i32;
                    closest = distance;
                }
            }
            self.current.set(i, best);
            if best != self.previous.get(i) {
                changed += 1;
            }
        }
        self.changes.set(self.grid.linear_index(unit), changed);
    }

    fn copy_assignment(&self, unit: ExecutionUnit, src: &SharedBuffer<i32>, dst: &SharedBuffer<i32>) {
        for i in self.unit_points(unit) {
            dst.set(i, src.get(i));
        }
    }

    fn calc_centroids(&self, unit: ExecutionUnit) {
        let clusters = PartitionStrategy::UnitCyclic.range(self.k, unit, &self.grid);
        let mut sums = vec![0.0f32; self.dim];
        for c in clusters {
            sums.iter_mut().for_each(|s| *s = 0.0);
            let mut members = 0usize;
            for i in 0..self.n {
                if self.current.get(i) != c as i32 {
                    continue;
                }
                members += 1;
                for (d, sum) in sums.iter_mut().enumerate() {
                    *sum += self.points.get(i * self.dim + d);
                }
            }

            if members == 0 {
                tracing::warn!(cluster = c, "empty cluster keeps its previous centroid");
                continue;
            }
            for (d, sum) in sums.iter().enumerate() {
                self.centroids.set(c * self.dim + d, sum / members as f32);
            }
        }
    }

    fn calc_point_distances(&self, unit: ExecutionUnit) {
        for i in self.unit_points(unit) {
            let cluster = self.current.get(i);
            let distance = if cluster == UNASSIGNED {
                0.0
            } else {
                self.squared_distance(i, cluster as usize)
            };
            self.point_distance.set(i, distance);
        }
    }

    fn decide(&self) {
        let total: f64 = (0..self.n).map(|i| f64::from(self.point_distance.get(i))).sum();
        let prev_total = f64::from_bits(self.prev_total.load(Ordering::Acquire));
        let worse = total > prev_total;
        if !worse {
            self.prev_total.store(total.to_bits(), Ordering::Release);
        }
        self.worse.store(worse, Ordering::Release);
        tracing::debug!(
            iteration = self.iterations(),
            total,
            prev_total,
            worse,
            "k-means total distance"
        );
    }
}

impl PhasedKernel for KmeansKernel {
    fn name(&self) -> &'static str {
        "kmeans"
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    fn reset(&self) {
        self.centroids.reset_from(&self.points.read_range(0, self.k * self.dim));
        self.distances.reset();
        self.current.reset_to(UNASSIGNED);
        self.previous.reset_to(UNASSIGNED);
        self.point_distance.reset();
        self.output.reset();
        self.changes.reset();
        self.set_stage(Stage::Initial);
        self.iteration.store(0, Ordering::Release);
        self.prev_total.store(f64::INFINITY.to_bits(), Ordering::Release);
        self.worse.store(false, Ordering::Release);
        self.publisher.reset();
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()> {
        let unit = ctx.unit();
        match phase {
            DISTANCES => self.calc_distances(unit),
            ASSIGN => self.assign(unit),
            SAVE => self.copy_assignment(unit, &self.current, &self.previous),
            CENTROIDS => self.calc_centroids(unit),
            TOTAL_DISTANCE => self.calc_point_distances(unit),
            DECIDE => {
                if ctx.is_designated() {
                    self.decide();
                }
            }
            RESTORE => self.copy_assignment(unit, &self.previous, &self.current),
            WRITE_OUTPUT => self.copy_assignment(unit, &self.current, &self.output),
            other => return Err(NpuForgeError::UnknownPhase(other.0)),
        }
        Ok(())
    }

    fn next_phase(&self, completed: PhaseId) -> Option<PhaseId> {
        let next = match completed {
            DISTANCES => ASSIGN,
            ASSIGN => {
                if self.stage() == Stage::Initial {
                    SAVE
                } else if self.changes.sum() == 0 {
                    WRITE_OUTPUT
                } else {
                    let iteration = self.iteration.fetch_add(1, Ordering::AcqRel) + 1;
                    if iteration >= self.max_iterations {
                        WRITE_OUTPUT
                    } else {
                        CENTROIDS
                    }
                }
            }
            SAVE => {
                if self.stage() == Stage::Initial {
                    self.set_stage(Stage::Iterating);
                    if self.max_iterations == 0 {
                        WRITE_OUTPUT
                    } else {
                        CENTROIDS
                    }
                } else {
                    DISTANCES
                }
            }
            CENTROIDS => {
                if self.stage() == Stage::Restoring {
                    WRITE_OUTPUT
                } else {
                    TOTAL_DISTANCE
                }
            }
            TOTAL_DISTANCE => DECIDE,
            DECIDE => {
                if self.worse.load(Ordering::Acquire) {
                    RESTORE
                } else {
                    SAVE
                }
            }
            RESTORE => {
                self.set_stage(Stage::Restoring);
                CENTROIDS
            }
            _ => return None,
        };
        Some(next)
    }

    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport> {
        self.publisher.publish(ctx, &self.output)
    }

    fn output(&self) -> KernelOutput {
        KernelOutput::from(self.output.committed_prefix(self.publisher.element_count()))
    }
}
