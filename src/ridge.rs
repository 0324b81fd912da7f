//! Multi-output ridge regression with the penalty chosen by K-fold cross-validation.

use crate::error::AlignmentError;
use crate::linalg_backends::thin_svd;
use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    /// Candidate penalties, tried in order.
    pub alphas: Vec<f64>,
    /// Number of contiguous folds; clamped to the number of samples.
    pub cv_folds: usize,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            alphas: vec![1e-3, 1e-2, 0.1, 1.0, 10.0, 100.0, 1000.0],
            cv_folds: 4,
        }
    }
}

/// Fitted coefficients of `Y ~ X * B + b`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RidgeFit {
    /// (n_features_in x n_features_out)
    pub coefficients: Array2<f64>,
    pub intercept: Array1<f64>,
    pub alpha: f64,
}

impl RidgeFit {
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        if x.ncols() != self.coefficients.nrows() {
            return Err(AlignmentError::shape(
                "ridge feature count",
                self.coefficients.nrows(),
                x.ncols(),
            ));
        }
        Ok(x.dot(&self.coefficients) + &self.intercept)
    }
}

/// Centers the columns of `x`, returning the centered copy and the column means.
fn center_columns(x: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>), AlignmentError> {
    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| AlignmentError::InvalidInput("cannot center a signal without samples".to_string()))?;
    Ok((&x - &mean, mean))
}

/// Shrinkage factors s / (s^2 + alpha).
fn shrinkage(singular_values: &Array1<f64>, alpha: f64) -> Array1<f64> {
    singular_values.mapv(|s| {
        let denominator = s * s + alpha;
        if denominator > 0.0 {
            s / denominator
        } else {
            0.0
        }
    })
}

/// SVD of a centered design, reused for every candidate penalty.
struct CenteredSolver {
    x_mean: Array1<f64>,
    y_mean: Array1<f64>,
    singular_values: Array1<f64>,
    /// (k x n_features_in)
    vt: Array2<f64>,
    /// U^T * Y_centered, (k x n_features_out)
    projected_target: Array2<f64>,
}

impl CenteredSolver {
    fn new(x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<Self, AlignmentError> {
        let (x_centered, x_mean) = center_columns(x)?;
        let (y_centered, y_mean) = center_columns(y)?;
        let svd = thin_svd(x_centered)?;
        let projected_target = svd.u.t().dot(&y_centered);
        Ok(Self {
            x_mean,
            y_mean,
            singular_values: svd.s,
            vt: svd.vt,
            projected_target,
        })
    }

    /// B = V diag(s / (s^2 + alpha)) U^T Y_c
    fn coefficients(&self, alpha: f64) -> Array2<f64> {
        let factors = shrinkage(&self.singular_values, alpha);
        let scaled = &self.projected_target * &factors.insert_axis(Axis(1));
        self.vt.t().dot(&scaled)
    }

    fn fit(&self, alpha: f64) -> RidgeFit {
        let coefficients = self.coefficients(alpha);
        let intercept = &self.y_mean - &self.x_mean.dot(&coefficients);
        RidgeFit {
            coefficients,
            intercept,
            alpha,
        }
    }

    /// Held-out squared error of every alpha on (x_test, y_test).
    fn held_out_errors(&self, alphas: &[f64], x_test: ArrayView2<f64>, y_test: ArrayView2<f64>) -> Vec<f64> {
        // Rotating the test design once makes every alpha a diagonal rescale.
        let rotated = (&x_test - &self.x_mean).dot(&self.vt.t());
        alphas
            .iter()
            .map(|&alpha| {
                let factors = shrinkage(&self.singular_values, alpha);
                let scaled = &self.projected_target * &factors.insert_axis(Axis(1));
                let prediction = rotated.dot(&scaled) + &self.y_mean;
                (&prediction - &y_test).iter().map(|r| r * r).sum::<f64>()
            })
            .collect()
    }
}

/// Contiguous fold boundaries; the first `n % k` folds take one extra sample.
fn fold_ranges(n_samples: usize, n_folds: usize) -> Vec<std::ops::Range<usize>> {
    let base = n_samples / n_folds;
    let extra = n_samples % n_folds;
    let mut start = 0;
    (0..n_folds)
        .map(|fold| {
            let len = base + usize::from(fold < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

fn select_alpha(x: ArrayView2<f64>, y: ArrayView2<f64>, config: &RidgeConfig) -> Result<f64, AlignmentError> {
    let n_samples = x.nrows();
    let n_folds = config.cv_folds.min(n_samples);
    if config.alphas.len() == 1 || n_folds < 2 {
        return Ok(config.alphas[0]);
    }

    let mut total_errors = vec![0.0; config.alphas.len()];
    for (fold, test_range) in fold_ranges(n_samples, n_folds).into_iter().enumerate() {
        let train_index: Vec<usize> = (0..n_samples).filter(|i| !test_range.contains(i)).collect();
        let test_index: Vec<usize> = test_range.collect();
        let solver = CenteredSolver::new(
            x.select(Axis(0), &train_index).view(),
            y.select(Axis(0), &train_index).view(),
        )?;
        let errors = solver.held_out_errors(
            &config.alphas,
            x.select(Axis(0), &test_index).view(),
            y.select(Axis(0), &test_index).view(),
        );
        trace!("Ridge fold {}: held-out errors {:?}", fold, errors);
        for (total, error) in total_errors.iter_mut().zip(errors) {
            *total += error;
        }
    }

    let mut best = 0;
    for (candidate, error) in total_errors.iter().enumerate() {
        if *error < total_errors[best] {
            best = candidate;
        }
    }
    Ok(config.alphas[best])
}

/// Fits `target ~ source * B + b`, choosing alpha by cross-validation.
pub fn fit_ridge_cv(
    source: ArrayView2<f64>,
    target: ArrayView2<f64>,
    config: &RidgeConfig,
) -> Result<RidgeFit, AlignmentError> {
    if source.nrows() != target.nrows() {
        return Err(AlignmentError::shape("ridge sample count", source.nrows(), target.nrows()));
    }
    if config.alphas.is_empty() {
        return Err(AlignmentError::InvalidInput("ridge needs at least one alpha".to_string()));
    }
    if let Some(bad) = config.alphas.iter().find(|a| !(a.is_finite() && **a >= 0.0)) {
        return Err(AlignmentError::InvalidInput(format!("ridge alpha must be finite and non-negative, got {}", bad)));
    }

    let alpha = select_alpha(source, target, config)?;
    debug!("Ridge selected alpha {} from {} candidates.", alpha, config.alphas.len());
    Ok(CenteredSolver::new(source, target)?.fit(alpha))
}
