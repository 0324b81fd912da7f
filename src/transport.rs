//! Entropic optimal transport between uniform distributions over features.

use crate::error::AlignmentError;
use crate::kernels::{linear_sum_assignment, GroundMetric};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Scalings larger than this are folded back into the dual potentials.
const ABSORPTION_THRESHOLD: f64 = 1e3;

/// Algorithm used to compute the transport plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkhornSolver {
    /// Alternating updates of the dual potentials with log-sum-exp.
    #[default]
    LogDomain,
    /// Sinkhorn-Knopp scaling of the Gibbs kernel with absorption of large scalings.
    Stabilized,
    /// Unregularized plan for square problems, solved as an assignment.
    Exact,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimalTransportConfig {
    /// Entropic regularization strength; ignored by the exact solver.
    pub reg: f64,
    pub metric: GroundMetric,
    /// Stop once the L1 violation of the constrained marginal falls below this.
    pub tol: f64,
    pub max_iter: usize,
    pub solver: SinkhornSolver,
}

impl Default for OptimalTransportConfig {
    fn default() -> Self {
        Self {
            reg: 1.0,
            metric: GroundMetric::Euclidean,
            tol: 1e-6,
            max_iter: 1000,
            solver: SinkhornSolver::LogDomain,
        }
    }
}

/// A coupling between `n` source and `m` target features.
#[derive(Clone, Debug)]
pub struct TransportPlan {
    /// (n x m) joint distribution; rows sum to 1/n and columns to 1/m.
    pub plan: Array2<f64>,
    pub iterations: usize,
    pub marginal_error: f64,
}

/// Computes the transport plan for `cost` between uniform marginals.
pub fn solve_transport(
    cost: ArrayView2<f64>,
    config: &OptimalTransportConfig,
) -> Result<TransportPlan, AlignmentError> {
    let (n, m) = cost.dim();
    if n == 0 || m == 0 {
        return Err(AlignmentError::InvalidInput("transport between empty feature sets".to_string()));
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(AlignmentError::InvalidInput("transport cost contains non-finite values".to_string()));
    }
    if config.solver != SinkhornSolver::Exact && !(config.reg > 0.0 && config.reg.is_finite()) {
        return Err(AlignmentError::InvalidInput(format!(
            "entropic regularization must be positive and finite, got {}",
            config.reg
        )));
    }
    if config.max_iter == 0 {
        return Err(AlignmentError::InvalidInput("max_iter must be at least 1".to_string()));
    }

    let result = match config.solver {
        SinkhornSolver::LogDomain => sinkhorn_log_domain(cost, config)?,
        SinkhornSolver::Stabilized => sinkhorn_stabilized(cost, config)?,
        SinkhornSolver::Exact => exact_transport(cost)?,
    };
    debug!(
        "{:?} transport on a {}x{} cost converged after {} iterations (marginal error {:.3e}).",
        config.solver, n, m, result.iterations, result.marginal_error
    );
    Ok(result)
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Potential update `reg * (log_weight - LSE_k((other_k - cost_k) / reg))`.
fn potential_update(costs: ArrayView1<f64>, other: &Array1<f64>, log_weight: f64, reg: f64, buffer: &mut Vec<f64>) -> f64 {
    buffer.clear();
    buffer.extend(costs.iter().zip(other.iter()).map(|(&c, &o)| (o - c) / reg));
    reg * (log_weight - log_sum_exp(buffer))
}

fn sinkhorn_log_domain(
    cost: ArrayView2<f64>,
    config: &OptimalTransportConfig,
) -> Result<TransportPlan, AlignmentError> {
    let (n, m) = cost.dim();
    let reg = config.reg;
    let log_a = -(n as f64).ln();
    let log_b = -(m as f64).ln();
    let row_mass = 1.0 / n as f64;

    let mut f = Array1::<f64>::zeros(n);
    let mut g = Array1::<f64>::zeros(m);
    let mut buffer = Vec::with_capacity(n.max(m));
    let mut error = f64::INFINITY;

    for iteration in 1..=config.max_iter {
        for (i, row) in cost.axis_iter(Axis(0)).enumerate() {
            f[i] = potential_update(row, &g, log_a, reg, &mut buffer);
        }
        for (j, column) in cost.axis_iter(Axis(1)).enumerate() {
            g[j] = potential_update(column, &f, log_b, reg, &mut buffer);
        }

        // Columns are exact after the g update; the rows carry the violation.
        error = cost
            .axis_iter(Axis(0))
            .zip(f.iter())
            .map(|(row, &fi)| {
                let mass: f64 = row
                    .iter()
                    .zip(g.iter())
                    .map(|(&c, &gj)| ((fi + gj - c) / reg).exp())
                    .sum();
                (mass - row_mass).abs()
            })
            .sum();
        if !error.is_finite() {
            break;
        }
        if error < config.tol {
            let mut plan = Array2::<f64>::zeros((n, m));
            Zip::indexed(&mut plan)
                .and(&cost)
                .for_each(|(i, j), p, &c| *p = ((f[i] + g[j] - c) / reg).exp());
            return Ok(TransportPlan {
                plan,
                iterations: iteration,
                marginal_error: error,
            });
        }
    }

    warn!("Log-domain Sinkhorn stopped with marginal error {:.3e}.", error);
    Err(AlignmentError::ConvergenceFailure {
        max_iter: config.max_iter,
        error,
        tol: config.tol,
    })
}

fn gibbs_kernel(cost: ArrayView2<f64>, alpha: &Array1<f64>, beta: &Array1<f64>, reg: f64) -> Array2<f64> {
    let mut kernel = Array2::<f64>::zeros(cost.dim());
    Zip::indexed(&mut kernel)
        .and(&cost)
        .for_each(|(i, j), k, &c| *k = (-(c - alpha[i] - beta[j]) / reg).exp());
    kernel
}

fn sinkhorn_stabilized(
    cost: ArrayView2<f64>,
    config: &OptimalTransportConfig,
) -> Result<TransportPlan, AlignmentError> {
    let (n, m) = cost.dim();
    let reg = config.reg;
    let row_mass = 1.0 / n as f64;
    let col_mass = 1.0 / m as f64;

    // Start from potentials that give every row and column a unit kernel entry.
    let mut alpha: Array1<f64> = cost
        .axis_iter(Axis(0))
        .map(|row| row.iter().copied().fold(f64::INFINITY, f64::min))
        .collect();
    let mut beta: Array1<f64> = cost
        .axis_iter(Axis(1))
        .map(|column| {
            column
                .iter()
                .zip(alpha.iter())
                .map(|(&c, &a)| c - a)
                .fold(f64::INFINITY, f64::min)
        })
        .collect();

    let mut kernel = gibbs_kernel(cost, &alpha, &beta, reg);
    let mut u = Array1::<f64>::ones(n);
    let mut v = Array1::<f64>::ones(m);
    let mut error = f64::INFINITY;

    for iteration in 1..=config.max_iter {
        let kt_u = kernel.t().dot(&u);
        v = kt_u.mapv(|x| col_mass / x);
        let k_v = kernel.dot(&v);
        u = k_v.mapv(|x| row_mass / x);

        if u.iter().chain(v.iter()).any(|x| !x.is_finite()) {
            break;
        }

        // Rows are exact after the u update; the columns carry the violation.
        let column_mass = kernel.t().dot(&u);
        error = Zip::from(&column_mass)
            .and(&v)
            .fold(0.0, |acc, &km, &vj| acc + (vj * km - col_mass).abs());

        if error < config.tol {
            let mut plan = kernel;
            Zip::indexed(&mut plan).for_each(|(i, j), p| *p *= u[i] * v[j]);
            return Ok(TransportPlan {
                plan,
                iterations: iteration,
                marginal_error: error,
            });
        }

        if u.iter().chain(v.iter()).any(|x| x.abs() > ABSORPTION_THRESHOLD) {
            alpha.zip_mut_with(&u, |a, &ui| *a += reg * ui.ln());
            beta.zip_mut_with(&v, |b, &vj| *b += reg * vj.ln());
            u.fill(1.0);
            v.fill(1.0);
            kernel = gibbs_kernel(cost, &alpha, &beta, reg);
        }
    }

    warn!("Stabilized Sinkhorn stopped with marginal error {:.3e}.", error);
    Err(AlignmentError::ConvergenceFailure {
        max_iter: config.max_iter,
        error,
        tol: config.tol,
    })
}

fn exact_transport(cost: ArrayView2<f64>) -> Result<TransportPlan, AlignmentError> {
    let (n, m) = cost.dim();
    if n != m {
        return Err(AlignmentError::shape("exact transport target feature count", n, m));
    }
    let mut plan = Array2::<f64>::zeros((n, m));
    for (i, j) in linear_sum_assignment(cost)? {
        plan[[i, j]] = 1.0 / n as f64;
    }
    Ok(TransportPlan {
        plan,
        iterations: 1,
        marginal_error: 0.0,
    })
}
