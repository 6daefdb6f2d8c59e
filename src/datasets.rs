//! Deterministic kernel inputs
//!
//! Fixed tables for kernels with published reference data, and seeded
//! pseudo-random data for the others. The same seed always yields the same
//! input on every platform, so reference and parallel runs can be compared
//! across processes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed used by the registry and the CLI
pub const DEFAULT_SEED: u64 = 0x5eed_2024;

/// Input block of the 8x8 DCT
pub const DCT_INPUT: [i32; 64] = [
    -33, -27, -17, -5, -3, -2, -7, -8, //
    36, 41, 23, 26, 40, 63, 34, 50, //
    73, 91, 70, 36, 61, 118, 42, 54, //
    70, 90, 58, 30, 55, 80, 29, 25, //
    64, 55, 12, 30, 50, 3, 31, 34, //
    23, -3, 3, 19, 33, -14, 22, 32, //
    -23, -31, 4, -2, 3, -5, 1, -1, //
    -22, -9, -18, -6, -10, -23, -1, -17,
];

/// Dimension of [`LUD_MATRIX`]
pub const LUD_SIZE: usize = 16;

/// Input matrix of the LU decomposition
pub const LUD_MATRIX: [[f32; LUD_SIZE]; LUD_SIZE] = [
    [72., 13., 75., 42., 16., 13., 86., 62., 62., 49., 14., 39., 17., 35., 29., 33.],
    [52., 69., 24., 88., 86., 67., 61., 66., 3., 53., 16., 13., 66., 5., 13., 29.],
    [99., 9., 44., 39., 98., 49., 98., 72., 61., 44., 62., 3., 33., 52., 21., 6.],
    [21., 52., 68., 76., 51., 18., 52., 89., 36., 12., 57., 93., 89., 33., 89., 29.],
    [10., 53., 35., 39., 88., 49., 47., 98., 4., 49., 5., 30., 11., 17., 7., 4.],
    [10., 86., 73., 80., 58., 14., 80., 76., 48., 85., 93., 29., 98., 20., 24., 50.],
    [6., 48., 39., 75., 15., 5., 22., 58., 19., 87., 72., 33., 53., 90., 5., 76.],
    [40., 39., 68., 37., 19., 85., 49., 92., 12., 27., 73., 46., 70., 67., 44., 63.],
    [44., 67., 70., 21., 40., 56., 90., 58., 20., 20., 6., 64., 99., 46., 1., 8.],
    [36., 74., 44., 79., 74., 92., 57., 1., 14., 56., 86., 2., 28., 91., 89., 8.],
    [76., 52., 1., 94., 82., 69., 84., 12., 18., 64., 93., 84., 41., 10., 19., 77.],
    [62., 34., 33., 32., 78., 58., 73., 86., 4., 41., 98., 55., 46., 74., 9., 90.],
    [77., 14., 42., 67., 31., 81., 58., 48., 63., 20., 85., 85., 76., 73., 30., 53.],
    [93., 58., 27., 43., 53., 87., 24., 84., 28., 94., 78., 34., 81., 56., 45., 10.],
    [97., 26., 19., 83., 8., 98., 66., 20., 53., 8., 51., 44., 10., 18., 10., 82.],
    [19., 4., 82., 76., 11., 0., 8., 55., 69., 10., 17., 5., 17., 59., 99., 33.],
];

/// Message checksummed by the CRC kernel
pub const CRC_MESSAGE: &[u8] = b"asdffeagewaHAFEFaeDsFEawFdsFaefaeerdjgp";

/// Row-major `n x n` matrix with `a[i][j] = (i * n + j) % n`
pub fn matmul_operand_i32(n: usize) -> Vec<i32> {
    (0..n * n).map(|idx| (idx % n) as i32).collect()
}

/// Row-major `n x n` matrix of floats in `[-1, 1)`
pub fn matmul_operand_f32(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Row-major `rows x cols` matrix with `a[i][j] = i * cols + j`
pub fn transpose_input(rows: usize, cols: usize) -> Vec<i32> {
    (0..(rows * cols) as i32).collect()
}

/// Binary field with roughly 70% ones, so interior regions exist
pub fn binary_field(rows: usize, cols: usize, seed: u64) -> Vec<i32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * cols)
        .map(|_| i32::from(rng.gen_bool(0.7)))
        .collect()
}

/// Row-major `len` integers uniformly drawn from `[lo, hi]`
pub fn int_samples(len: usize, lo: i32, hi: i32, seed: u64) -> Vec<i32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(lo..=hi)).collect()
}

/// `n` points of `dim` coordinates drawn around `k` separated centres
///
/// Point `i` belongs to blob `i % k`, so the first `k` points (the initial
/// centroids) start in distinct blobs.
pub fn kmeans_points(n: usize, dim: usize, k: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centres: Vec<f32> = (0..k * dim).map(|_| rng.gen_range(-20.0f32..20.0)).collect();
    let mut points = Vec::with_capacity(n * dim);
    for i in 0..n {
        let blob = i % k.max(1);
        for d in 0..dim {
            let spread = rng.gen_range(-4.0f32..4.0);
            points.push(centres[blob * dim + d] + spread);
        }
    }
    points
}
