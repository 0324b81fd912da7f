//! Stateless numerical routines shared by the alignment estimators and the
//! region aggregation step.

use crate::error::AlignmentError;
use crate::linalg_backends::{full_svd, thin_svd};
use log::{debug, trace};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Frobenius norm of a matrix.
pub fn frobenius_norm(matrix: ArrayView2<f64>) -> f64 {
    matrix.iter().map(|v| v * v).sum::<f64>().sqrt()
}

// --- Scaled orthogonal Procrustes ---

/// Finds the orthogonal `R` and scalar `s` minimizing `||s * X * R - Y||_F`.
///
/// * `source` / `target` - signals of identical shape (n_samples, n_features).
/// * `scaling` - when false the returned scale is `1.0`.
/// * `primal` - `Some(true)` factors the (p x p) cross-covariance `X^T Y`,
///   `Some(false)` works from the SVDs of `X` and `Y` and only decomposes a
///   (k x k) matrix with k = min(n, p). `None` picks primal iff n > p.
///
/// Both paths return an orthogonal (p x p) matrix and the same prediction
/// `s * X * R`. If either input is all zero the result is `(I, 1.0)`.
pub fn scaled_procrustes(
    source: ArrayView2<f64>,
    target: ArrayView2<f64>,
    scaling: bool,
    primal: Option<bool>,
) -> Result<(Array2<f64>, f64), AlignmentError> {
    if source.nrows() != target.nrows() {
        return Err(AlignmentError::shape("procrustes sample count", source.nrows(), target.nrows()));
    }
    if source.ncols() != target.ncols() {
        return Err(AlignmentError::shape("procrustes feature count", source.ncols(), target.ncols()));
    }
    let n_features = source.ncols();

    let source_norm = frobenius_norm(source);
    let target_norm = frobenius_norm(target);
    if source_norm == 0.0 || target_norm == 0.0 {
        debug!("Procrustes on an all-zero signal, returning the identity rotation.");
        return Ok((Array2::eye(n_features), 1.0));
    }

    let x = &source / source_norm;
    let y = &target / target_norm;
    let use_primal = primal.unwrap_or(x.nrows() > x.ncols());
    trace!(
        "Procrustes on ({} x {}) signals using the {} form.",
        x.nrows(),
        x.ncols(),
        if use_primal { "primal" } else { "dual" }
    );

    let (rotation, singular_value_sum) = if use_primal {
        primal_rotation(x, y)?
    } else {
        dual_rotation(x, y)?
    };

    let scale = if scaling {
        singular_value_sum * target_norm / source_norm
    } else {
        1.0
    };
    Ok((rotation, scale))
}

fn primal_rotation(x: Array2<f64>, y: Array2<f64>) -> Result<(Array2<f64>, f64), AlignmentError> {
    let cross_covariance = x.t().dot(&y);
    let svd = thin_svd(cross_covariance)?;
    Ok((svd.u.dot(&svd.vt), svd.s.sum()))
}

/// X = Ux Sx Vx^T and Y = Uy Sy Vy^T give X^T Y = Vx (Sx Ux^T Uy Sy) Vy^T, so only
/// the small middle factor needs a decomposition. The rotation is then completed
/// on the orthogonal complements of both row spaces, which leaves `X * R` unchanged.
fn dual_rotation(x: Array2<f64>, y: Array2<f64>) -> Result<(Array2<f64>, f64), AlignmentError> {
    let n_features = x.ncols();
    let k = x.nrows().min(n_features);

    let source_svd = full_svd(x)?;
    let target_svd = full_svd(y)?;

    let mut middle = source_svd
        .u
        .slice(s![.., ..k])
        .t()
        .dot(&target_svd.u.slice(s![.., ..k]));
    for (mut row, &sigma) in middle.rows_mut().into_iter().zip(source_svd.s.iter()) {
        row *= sigma;
    }
    for (mut column, &sigma) in middle.columns_mut().into_iter().zip(target_svd.s.iter()) {
        column *= sigma;
    }
    let inner = thin_svd(middle)?;

    let source_basis = source_svd.vt.slice(s![..k, ..]);
    let target_basis = target_svd.vt.slice(s![..k, ..]);
    let mut rotation = source_basis.t().dot(&inner.u.dot(&inner.vt)).dot(&target_basis);

    if k < n_features {
        let source_complement = source_svd.vt.slice(s![k.., ..]);
        let target_complement = target_svd.vt.slice(s![k.., ..]);
        rotation += &source_complement.t().dot(&target_complement);
    }
    Ok((rotation, inner.s.sum()))
}

// --- Column distances ---

/// Ground metric between column profiles (one column = one voxel's time course).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundMetric {
    #[default]
    Euclidean,
    SqEuclidean,
    Cityblock,
    Cosine,
}

impl fmt::Display for GroundMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroundMetric::Euclidean => "euclidean",
            GroundMetric::SqEuclidean => "sqeuclidean",
            GroundMetric::Cityblock => "cityblock",
            GroundMetric::Cosine => "cosine",
        };
        f.write_str(name)
    }
}

impl FromStr for GroundMetric {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(GroundMetric::Euclidean),
            "sqeuclidean" | "sq_euclidean" => Ok(GroundMetric::SqEuclidean),
            "cityblock" | "manhattan" => Ok(GroundMetric::Cityblock),
            "cosine" => Ok(GroundMetric::Cosine),
            other => Err(AlignmentError::InvalidInput(format!("unknown ground metric '{}'", other))),
        }
    }
}

/// Distance matrix between the columns of `source` and the columns of `target`.
///
/// Returns shape (source.ncols(), target.ncols()). Cosine distance against an
/// all-zero column is taken as 1.
pub fn pairwise_distances(
    source: ArrayView2<f64>,
    target: ArrayView2<f64>,
    metric: GroundMetric,
) -> Result<Array2<f64>, AlignmentError> {
    if source.nrows() != target.nrows() {
        return Err(AlignmentError::shape("distance sample count", source.nrows(), target.nrows()));
    }
    let source_sq: Array1<f64> = source.columns().into_iter().map(|c| c.dot(&c)).collect();
    let target_sq: Array1<f64> = target.columns().into_iter().map(|c| c.dot(&c)).collect();

    let distances = match metric {
        GroundMetric::Euclidean | GroundMetric::SqEuclidean => {
            let mut squared = source.t().dot(&target);
            Zip::indexed(&mut squared).for_each(|(i, j), value| {
                *value = (source_sq[i] + target_sq[j] - 2.0 * *value).max(0.0);
            });
            if metric == GroundMetric::Euclidean {
                squared.mapv_inplace(f64::sqrt);
            }
            squared
        }
        GroundMetric::Cosine => {
            let mut similarity = source.t().dot(&target);
            Zip::indexed(&mut similarity).for_each(|(i, j), value| {
                let denominator = (source_sq[i] * target_sq[j]).sqrt();
                *value = if denominator > 0.0 { 1.0 - *value / denominator } else { 1.0 };
            });
            similarity
        }
        GroundMetric::Cityblock => Array2::from_shape_fn((source.ncols(), target.ncols()), |(i, j)| {
            Zip::from(source.column(i))
                .and(target.column(j))
                .fold(0.0, |acc, &a, &b| acc + (a - b).abs())
        }),
    };
    Ok(distances)
}

// --- Exact assignment ---

/// Minimum-cost one-to-one matching between rows and columns of `cost`.
///
/// Returns `(row, column)` pairs sorted by row. Every element of the smaller
/// side is matched exactly once. Solved with the shortest augmenting path
/// (Hungarian) algorithm, which yields the global optimum in O(n^2 m).
pub fn linear_sum_assignment(cost: ArrayView2<f64>) -> Result<Vec<(usize, usize)>, AlignmentError> {
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(AlignmentError::InvalidInput(
            "assignment cost matrix contains non-finite values".to_string(),
        ));
    }
    let (n_rows, n_cols) = cost.dim();
    if n_rows <= n_cols {
        Ok(shortest_augmenting_path(cost).into_iter().enumerate().collect())
    } else {
        let mut pairs: Vec<(usize, usize)> = shortest_augmenting_path(cost.t())
            .into_iter()
            .enumerate()
            .map(|(col, row)| (row, col))
            .collect();
        pairs.sort_unstable();
        Ok(pairs)
    }
}

/// Column assigned to each row; rows must not outnumber columns.
fn shortest_augmenting_path(cost: ArrayView2<f64>) -> Vec<usize> {
    let (n, m) = cost.dim();
    // Index 0 is a sentinel column/row, real entries are 1-based.
    let mut row_potential = vec![0.0f64; n + 1];
    let mut col_potential = vec![0.0f64; m + 1];
    let mut row_of_col = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        row_of_col[0] = i;
        let mut j0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = row_of_col[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[[i0 - 1, j - 1]] - row_potential[i0] - col_potential[j];
                if reduced < min_slack[j] {
                    min_slack[j] = reduced;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    row_potential[row_of_col[j]] += delta;
                    col_potential[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }
            j0 = j1;
            if row_of_col[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            row_of_col[j0] = row_of_col[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut col_of_row = vec![0usize; n];
    for j in 1..=m {
        if row_of_col[j] != 0 {
            col_of_row[row_of_col[j] - 1] = j - 1;
        }
    }
    col_of_row
}

/// Sparse 0/1 matrix with at most one non-zero per row and per column, stored
/// as the column index of each row's one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permutation {
    n_rows: usize,
    n_cols: usize,
    col_of_row: Vec<Option<usize>>,
}

impl Permutation {
    /// Builds a matrix with a one at every `(row, col)` pair.
    pub fn from_pairs(n_rows: usize, n_cols: usize, pairs: &[(usize, usize)]) -> Result<Self, AlignmentError> {
        let mut col_of_row = vec![None; n_rows];
        let mut col_taken = vec![false; n_cols];
        for &(row, col) in pairs {
            if row >= n_rows || col >= n_cols {
                return Err(AlignmentError::InvalidInput(format!(
                    "pair ({}, {}) outside a {} x {} permutation",
                    row, col, n_rows, n_cols
                )));
            }
            if col_of_row[row].is_some() || col_taken[col] {
                return Err(AlignmentError::InvalidInput(format!(
                    "pair ({}, {}) reuses a matched feature",
                    row, col
                )));
            }
            col_of_row[row] = Some(col);
            col_taken[col] = true;
        }
        Ok(Self {
            n_rows,
            n_cols,
            col_of_row,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Column holding the one of `row`, if any.
    pub fn col_of(&self, row: usize) -> Option<usize> {
        self.col_of_row.get(row).copied().flatten()
    }

    /// Number of stored ones.
    pub fn nnz(&self) -> usize {
        self.col_of_row.iter().filter(|c| c.is_some()).count()
    }

    pub fn transpose(&self) -> Permutation {
        let mut col_of_row = vec![None; self.n_cols];
        for (row, col) in self.col_of_row.iter().enumerate() {
            if let Some(col) = col {
                col_of_row[*col] = Some(row);
            }
        }
        Permutation {
            n_rows: self.n_cols,
            n_cols: self.n_rows,
            col_of_row,
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n_rows, self.n_cols));
        for (row, col) in self.col_of_row.iter().enumerate() {
            if let Some(col) = col {
                dense[[row, *col]] = 1.0;
            }
        }
        dense
    }

    /// Computes `X * P`: column `i` of `X` moves to column `col_of(i)`; columns
    /// without a one stay zero.
    pub fn apply(&self, signal: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        if signal.ncols() != self.n_rows {
            return Err(AlignmentError::shape("permutation feature count", self.n_rows, signal.ncols()));
        }
        let mut permuted = Array2::zeros((signal.nrows(), self.n_cols));
        for (row, col) in self.col_of_row.iter().enumerate() {
            if let Some(col) = col {
                permuted.column_mut(*col).assign(&signal.column(row));
            }
        }
        Ok(permuted)
    }
}

/// Exact optimal matching of the features (columns) of `source` onto those of
/// `target`, minimizing the summed squared Euclidean distance between matched
/// column profiles.
///
/// The result `P` has shape (n_target, n_source) with `P[j, i] = 1` when source
/// feature `i` is matched to target feature `j`, so `P * X^T` reorders the rows
/// of `X^T` to match `Y^T`. Its transpose maps `X` onto `Y` as `X * P^T`.
pub fn optimal_permutation(
    source: ArrayView2<f64>,
    target: ArrayView2<f64>,
) -> Result<Permutation, AlignmentError> {
    let cost = pairwise_distances(source, target, GroundMetric::SqEuclidean)?;
    let pairs: Vec<(usize, usize)> = linear_sum_assignment(cost.view())?
        .into_iter()
        .map(|(s, t)| (t, s))
        .collect();
    Permutation::from_pairs(target.ncols(), source.ncols(), &pairs)
}

// --- Voxelwise projection ---

/// Least-squares coefficient `d` minimizing `||d * x - y||`; zero when `x` is all zero.
pub fn projection_coefficient(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let energy = x.dot(&x);
    if energy == 0.0 {
        0.0
    } else {
        x.dot(&y) / energy
    }
}

/// One projection coefficient per row pair of `sources` and `targets`.
///
/// Row `i` of the result is `<x_i, y_i> / ||x_i||^2`, the scalar that best
/// explains `y_i` from `x_i`. A row of `sources` that is all zero yields 0.
pub fn voxelwise_signal_projection(
    sources: ArrayView2<f64>,
    targets: ArrayView2<f64>,
) -> Result<Array1<f64>, AlignmentError> {
    if sources.nrows() != targets.nrows() {
        return Err(AlignmentError::shape("projection row count", sources.nrows(), targets.nrows()));
    }
    if sources.ncols() != targets.ncols() {
        return Err(AlignmentError::shape("projection row length", sources.ncols(), targets.ncols()));
    }
    Ok(Zip::from(sources.rows())
        .and(targets.rows())
        .par_map_collect(|x, y| projection_coefficient(x, y)))
}
