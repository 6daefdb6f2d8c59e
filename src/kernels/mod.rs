//! Kernel suite
//!
//! Every kernel is a [`PhasedKernel`]: it owns its input and output buffers,
//! declares a [`PhasePlan`], and executes one phase at a time for one unit.
//! Kernels are organized by operation:
//! - `matmul`, `matmul_scratchpad`, `matmul_tiled`: dense matrix multiply
//! - `transpose`, `marching_squares`, `conv`: row-partitioned 2D operators
//! - `dct`: 8x8 integer forward transform
//! - `kmeans`, `lud`: iterative and column-sweep algorithms
//! - `crc`, `fir`: signal processing
//! - `barrier_stress`: barrier micro-benchmark

pub mod barrier_stress;
pub mod conv;
pub mod crc;
pub mod dct;
pub mod fir;
pub mod kmeans;
pub mod lud;
pub mod marching_squares;
pub mod matmul;
pub mod matmul_scratchpad;
pub mod matmul_tiled;
pub mod transpose;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::backend::UnitContext;
use crate::datasets::DEFAULT_SEED;
use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::Grid;
use crate::publish::PublishReport;
use crate::sync::{PhaseId, PhasePlan};

/// A kernel expressed as a sequence of barrier-separated phases
///
/// `run_phase` is called concurrently for every unit of the grid and must
/// only write data the unit owns. `next_phase` is called exactly once per
/// completed phase, after every unit has finished it, and may advance the
/// kernel's control state.
pub trait PhasedKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Grid the kernel was partitioned for
    fn grid(&self) -> Grid;

    fn plan(&self) -> &PhasePlan;

    /// Restore the freshly built state; backends call this before the first phase
    fn reset(&self);

    fn run_phase(&self, phase: PhaseId, ctx: &mut UnitContext<'_>) -> ForgeResult<()>;

    /// Phase to run after `completed`; plans run in declaration order by default
    fn next_phase(&self, completed: PhaseId) -> Option<PhaseId> {
        let next = completed.0.checked_add(1)?;
        if (next as usize) < self.plan().phase_count() {
            Some(PhaseId(next))
        } else {
            None
        }
    }

    /// Publish the result; only the designated unit may call this
    fn publish(&self, ctx: &mut UnitContext<'_>) -> ForgeResult<PublishReport>;

    /// Published result as seen in committed memory
    fn output(&self) -> KernelOutput;
}

/// Result vector of a kernel run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum KernelOutput {
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl KernelOutput {
    pub fn len(&self) -> usize {
        match self {
            KernelOutput::I32(v) => v.len(),
            KernelOutput::U32(v) => v.len(),
            KernelOutput::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> &'static str {
        match self {
            KernelOutput::I32(_) => "i32",
            KernelOutput::U32(_) => "u32",
            KernelOutput::F32(_) => "f32",
        }
    }

    /// Values formatted for display
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            KernelOutput::I32(v) => v.iter().map(|x| x.to_string()).collect(),
            KernelOutput::U32(v) => v.iter().map(|x| x.to_string()).collect(),
            KernelOutput::F32(v) => v.iter().map(|x| format!("{:.4}", x)).collect(),
        }
    }
}

impl From<Vec<i32>> for KernelOutput {
    fn from(values: Vec<i32>) -> Self {
        KernelOutput::I32(values)
    }
}

impl From<Vec<u32>> for KernelOutput {
    fn from(values: Vec<u32>) -> Self {
        KernelOutput::U32(values)
    }
}

impl From<Vec<f32>> for KernelOutput {
    fn from(values: Vec<f32>) -> Self {
        KernelOutput::F32(values)
    }
}

/// Registry of the kernels the CLI and the cosimulation harness can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Matmul,
    MatmulF32,
    MatmulScratchpad,
    MatmulTiled,
    Transpose,
    MarchingSquares,
    Conv,
    Dct,
    Kmeans,
    Lud,
    Crc,
    Fir,
    BarrierStress,
}

impl KernelKind {
    pub const ALL: [KernelKind; 13] = [
        KernelKind::Matmul,
        KernelKind::MatmulF32,
        KernelKind::MatmulScratchpad,
        KernelKind::MatmulTiled,
        KernelKind::Transpose,
        KernelKind::MarchingSquares,
        KernelKind::Conv,
        KernelKind::Dct,
        KernelKind::Kmeans,
        KernelKind::Lud,
        KernelKind::Crc,
        KernelKind::Fir,
        KernelKind::BarrierStress,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::Matmul => "matmul",
            KernelKind::MatmulF32 => "matmul_f32",
            KernelKind::MatmulScratchpad => "matmul_scratchpad",
            KernelKind::MatmulTiled => "matmul_tiled",
            KernelKind::Transpose => "transpose",
            KernelKind::MarchingSquares => "marching_squares",
            KernelKind::Conv => "conv",
            KernelKind::Dct => "dct",
            KernelKind::Kmeans => "kmeans",
            KernelKind::Lud => "lud",
            KernelKind::Crc => "crc",
            KernelKind::Fir => "fir",
            KernelKind::BarrierStress => "barrier_stress",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            KernelKind::Matmul => "16x16 integer matrix multiply, block-strided rows",
            KernelKind::MatmulF32 => "16x16 float matrix multiply, block-strided rows",
            KernelKind::MatmulScratchpad => {
                "16x16 integer matrix multiply staged through the scratchpad"
            }
            KernelKind::MatmulTiled => {
                "NxN integer matrix multiply in column-tile turns (N = cores x threads)"
            }
            KernelKind::Transpose => "16x8 integer matrix transpose",
            KernelKind::MarchingSquares => "16x16 binary field boundary classification",
            KernelKind::Conv => "16x16 integer convolution with a 3x3 filter",
            KernelKind::Dct => "8x8 integer forward DCT with clipping",
            KernelKind::Kmeans => "k-means, 32 points, 4 clusters, 8 dimensions",
            KernelKind::Lud => "16x16 float LU decomposition (L then U)",
            KernelKind::Crc => "X-Modem CRC of a 40-byte message, one per core",
            KernelKind::Fir => "35-tap integer FIR filter over 32 samples",
            KernelKind::BarrierStress => "repeated grid and core barriers with counters",
        }
    }

    /// Integer kernels compare bit-exact, float kernels within a tolerance
    pub fn is_float(&self) -> bool {
        matches!(self, KernelKind::MatmulF32 | KernelKind::Lud)
    }

    /// Build the kernel with its default dataset for `grid`
    pub fn build(&self, grid: Grid) -> ForgeResult<Box<dyn PhasedKernel>> {
        let kernel: Box<dyn PhasedKernel> = match self {
            KernelKind::Matmul => Box::new(matmul::MatmulKernel::<i32>::with_default_data(grid, 16)?),
            KernelKind::MatmulF32 => Box::new(matmul::MatmulKernel::<f32>::with_default_data(grid, 16)?),
            KernelKind::MatmulScratchpad => {
                Box::new(matmul_scratchpad::ScratchpadMatmulKernel::with_default_data(grid, 16)?)
            }
            KernelKind::MatmulTiled => Box::new(matmul_tiled::TiledMatmulKernel::with_default_data(
                grid,
                grid.unit_count(),
            )?),
            KernelKind::Transpose => Box::new(transpose::TransposeKernel::with_default_data(grid, 16, 8)?),
            KernelKind::MarchingSquares => Box::new(
                marching_squares::MarchingSquaresKernel::with_default_data(grid, 16, 16, DEFAULT_SEED)?,
            ),
            KernelKind::Conv => Box::new(conv::ConvKernel::with_default_data(grid, 16, 3, DEFAULT_SEED)?),
            KernelKind::Dct => Box::new(dct::DctKernel::with_default_data(grid)?),
            KernelKind::Kmeans => Box::new(kmeans::KmeansKernel::with_default_data(grid, DEFAULT_SEED)?),
            KernelKind::Lud => Box::new(lud::LudKernel::with_default_data(grid)?),
            KernelKind::Crc => Box::new(crc::CrcKernel::with_default_data(grid)?),
            KernelKind::Fir => Box::new(fir::FirKernel::with_default_data(grid, DEFAULT_SEED)?),
            KernelKind::BarrierStress => Box::new(barrier_stress::BarrierStressKernel::new(grid)?),
        };
        Ok(kernel)
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelKind {
    type Err = NpuForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        KernelKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| NpuForgeError::UnknownName {
                kind: "kernel",
                name: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_kind_round_trips_names() {
        for kind in KernelKind::ALL {
            assert_eq!(kind.name().parse::<KernelKind>().unwrap(), kind);
        }
        assert_eq!("Matmul-Tiled".parse::<KernelKind>().unwrap(), KernelKind::MatmulTiled);
        assert!(matches!(
            "fft".parse::<KernelKind>(),
            Err(NpuForgeError::UnknownName { kind: "kernel", .. })
        ));
    }

    #[test]
    fn test_every_kernel_builds_on_a_small_grid() {
        let grid = Grid::new(2, 2).unwrap();
        for kind in KernelKind::ALL {
            let kernel = kind.build(grid).unwrap();
            assert_eq!(kernel.grid(), grid);
            assert!(kernel.plan().phase_count() > 0, "{} has no phases", kind);
        }
    }

    #[test]
    fn test_kernel_output_accessors() {
        let output = KernelOutput::from(vec![1.0f32, 2.5]);
        assert_eq!(output.len(), 2);
        assert_eq!(output.element_type(), "f32");
        assert_eq!(output.to_strings(), vec!["1.0000", "2.5000"]);
        assert!(KernelOutput::from(Vec::<u32>::new()).is_empty());

        let json = serde_json::to_string(&KernelOutput::from(vec![3i32])).unwrap();
        assert_eq!(json, r#"{"type":"i32","values":[3]}"#);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::PhasedKernel;
    use crate::backend::{ComputeBackend, ParallelBackend, RunReport, SequentialReferenceBackend};
    use crate::grid::Grid;

    pub fn grid(cores: usize, threads: usize) -> Grid {
        Grid::new(cores, threads).unwrap()
    }

    pub fn run_sequential(kernel: &dyn PhasedKernel) -> RunReport {
        SequentialReferenceBackend::new(kernel.grid())
            .execute(kernel)
            .unwrap()
    }

    pub fn run_parallel(kernel: &dyn PhasedKernel) -> RunReport {
        ParallelBackend::new(kernel.grid()).execute(kernel).unwrap()
    }
}
