// tests/common/mod.rs
#![allow(dead_code)]

use ndarray::{s, Array2, ArrayView2, Zip};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Subjects sharing a low-dimensional response `S`, each seeing it through its own
/// random voxel mixing `W_i`: `X_i = S * W_i`, without noise.
pub struct SharedResponseData {
    pub shared_train: Array2<f64>,
    pub shared_test: Array2<f64>,
    pub train: Vec<Array2<f64>>,
    pub test: Vec<Array2<f64>>,
}

pub fn generate_dummy_signal(
    n_subjects: usize,
    n_train: usize,
    n_test: usize,
    n_voxels: usize,
    n_latent: usize,
    seed: u64,
) -> SharedResponseData {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let shared_train = Array2::random_using((n_train, n_latent), StandardNormal, &mut rng);
    let shared_test = Array2::random_using((n_test, n_latent), StandardNormal, &mut rng);
    let mut train = Vec::with_capacity(n_subjects);
    let mut test = Vec::with_capacity(n_subjects);
    for _ in 0..n_subjects {
        let mixing: Array2<f64> = Array2::random_using((n_latent, n_voxels), StandardNormal, &mut rng);
        train.push(shared_train.dot(&mixing));
        test.push(shared_test.dot(&mixing));
    }
    SharedResponseData {
        shared_train,
        shared_test,
        train,
        test,
    }
}

/// Searchlights on a line of voxels spaced `spacing` apart, centered on
/// `n_centers` evenly spread voxels. Returns voxel lists and center distances.
pub fn generate_dummy_searchlights(
    n_voxels: usize,
    n_centers: usize,
    radius: f64,
    spacing: f64,
) -> (Vec<Vec<usize>>, Vec<Vec<f64>>) {
    let mut searchlights = Vec::with_capacity(n_centers);
    let mut distances = Vec::with_capacity(n_centers);
    for i in 0..n_centers {
        let center = ((i * (n_voxels - 1)) as f64 / (n_centers - 1) as f64).round() as usize;
        let mut voxels = Vec::new();
        let mut dists = Vec::new();
        for v in 0..n_voxels {
            let d = (v as f64 - center as f64).abs() * spacing;
            if d <= radius {
                voxels.push(v);
                dists.push(d);
            }
        }
        searchlights.push(voxels);
        distances.push(dists);
    }
    (searchlights, distances)
}

/// Parcels from the labels `voxel % n_parcels`.
pub fn modular_parcels(n_voxels: usize, n_parcels: usize) -> Vec<Vec<usize>> {
    (0..n_parcels)
        .map(|label| (0..n_voxels).filter(|v| v % n_parcels == label).collect())
        .collect()
}

pub fn max_abs_difference(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
    assert_eq!(a.dim(), b.dim(), "compared signals differ in shape");
    Zip::from(&a).and(&b).fold(0.0f64, |acc, x, y| acc.max((x - y).abs()))
}

pub fn assert_signals_close(actual: ArrayView2<f64>, expected: ArrayView2<f64>, tolerance: f64, context: &str) {
    let diff = max_abs_difference(actual, expected);
    assert!(
        diff < tolerance,
        "{}: max abs difference {} exceeds {} (first row predicted {:?}, expected {:?})",
        context,
        diff,
        tolerance,
        actual.slice(s![0, ..3.min(actual.ncols())]).to_vec(),
        expected.slice(s![0, ..3.min(expected.ncols())]).to_vec()
    );
}
