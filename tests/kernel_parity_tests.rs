//! Cross-backend and cross-grid parity of the kernel suite

mod common;

use common::{grid, run_parallel, run_reference, single_unit_output, GRIDS};
use npuforge::config::RunConfig;
use npuforge::cosim::cosimulate;
use npuforge::kernels::kmeans::KmeansKernel;
use npuforge::kernels::matmul::{host_matmul, MatmulKernel};
use npuforge::kernels::{KernelKind, KernelOutput, PhasedKernel};
use npuforge::NpuForgeError;

/// Kernels whose problem size does not depend on the grid
const GRID_INDEPENDENT: [KernelKind; 10] = [
    KernelKind::Matmul,
    KernelKind::MatmulF32,
    KernelKind::MatmulScratchpad,
    KernelKind::Transpose,
    KernelKind::MarchingSquares,
    KernelKind::Conv,
    KernelKind::Dct,
    KernelKind::Kmeans,
    KernelKind::Lud,
    KernelKind::Fir,
];

#[test]
fn test_every_kernel_cosimulates() {
    for (cores, threads) in [(1, 1), (2, 2), (3, 5)] {
        let config = RunConfig::new().with_grid(cores, threads);
        for kind in KernelKind::ALL {
            let report = cosimulate(kind, &config)
                .unwrap_or_else(|e| panic!("{} on {}x{}: {}", kind, cores, threads, e));
            assert!(report.comparison.is_match());
            assert_eq!(
                report.reference.completion_count as usize,
                report.output.len(),
                "{} completion register",
                kind
            );
        }
    }
}

#[test]
fn test_grid_independent_kernels_match_single_unit() {
    for kind in GRID_INDEPENDENT {
        let expected = single_unit_output(kind);
        for &grid in GRIDS.iter() {
            let kernel = kind.build(grid).unwrap();
            run_parallel(kernel.as_ref());
            assert_eq!(kernel.output(), expected, "{} on grid {}", kind, grid);
        }
    }
}

#[test]
fn test_every_kernel_reruns_identically() {
    for kind in KernelKind::ALL {
        let kernel = kind.build(grid(2, 2)).unwrap();
        let first_report = run_parallel(kernel.as_ref());
        let first = kernel.output();

        let second_report = run_parallel(kernel.as_ref());
        assert_eq!(kernel.output(), first, "{} second parallel run", kind);
        assert_eq!(second_report.phases_executed, first_report.phases_executed, "{}", kind);

        run_reference(kernel.as_ref());
        assert_eq!(kernel.output(), first, "{} reference run after parallel", kind);
    }
}

#[test]
fn test_matmul_n4_on_2x2_equals_sequential_1x1() {
    let a: Vec<i32> = (0..16).collect();
    let b: Vec<i32> = (0..16).rev().collect();

    let reference = MatmulKernel::new(grid(1, 1), 4, &a, &b).unwrap();
    run_reference(&reference);
    let parallel = MatmulKernel::new(grid(2, 2), 4, &a, &b).unwrap();
    run_parallel(&parallel);

    assert_eq!(parallel.output(), reference.output());
    assert_eq!(parallel.output(), KernelOutput::from(host_matmul(&a, &b, 4)));
}

#[test]
fn test_kmeans_parallel_matches_sequential() {
    let reference = KmeansKernel::with_default_data(grid(1, 1), npuforge::datasets::DEFAULT_SEED).unwrap();
    run_reference(&reference);
    let KernelOutput::I32(assignment) = reference.output() else {
        panic!("kmeans assigns i32 cluster ids");
    };
    assert_eq!(assignment.len(), 32);
    assert!(assignment.iter().all(|&c| (0..4).contains(&c)));
    assert!(reference.iterations() <= 100);

    for (cores, threads) in [(2, 2), (4, 4), (1, 8)] {
        let parallel =
            KmeansKernel::with_default_data(grid(cores, threads), npuforge::datasets::DEFAULT_SEED).unwrap();
        run_parallel(&parallel);
        assert_eq!(parallel.output(), reference.output());
        assert_eq!(parallel.iterations(), reference.iterations());
    }
}

#[test]
fn test_kernel_rejects_foreign_grid() {
    let kernel = KernelKind::Dct.build(grid(2, 2)).unwrap();
    let backend = npuforge::backend::create(&RunConfig::new().with_grid(4, 1)).unwrap();
    let err = backend.execute(kernel.as_ref()).unwrap_err();
    assert!(matches!(err, NpuForgeError::InvalidConfiguration(_)));
}

#[test]
fn test_sequential_backend_reports_phases() {
    let kernel = KernelKind::Crc.build(grid(2, 1)).unwrap();
    let report = run_reference(kernel.as_ref());
    assert_eq!(report.phases_executed, kernel.plan().phase_count());
    assert_eq!(report.backend, "sequential");
    assert!(report.flushed_lines >= 1);
}
