//! Pairwise alignment estimators.
//!
//! Every estimator learns a mapping from a source signal `X` (n x p) to a target
//! signal `Y` (n x q) sharing the same samples, then applies that mapping to new
//! source data. [`AlignmentMethod`] is the serializable recipe for an estimator and
//! [`AlignmentEstimator`] the fitted (or unfitted) instance stored in region caches.

use crate::error::AlignmentError;
use crate::kernels::{optimal_permutation, pairwise_distances, scaled_procrustes, voxelwise_signal_projection, Permutation};
use crate::ridge::{fit_ridge_cv, RidgeConfig, RidgeFit};
use crate::transport::{solve_transport, OptimalTransportConfig};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Common interface of the pairwise estimators.
///
/// `fit` only replaces the fitted state once the whole computation succeeded, so a
/// failed refit leaves the previous mapping in place.
pub trait Alignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError>;

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError>;
}

fn check_paired(source: &ArrayView2<f64>, target: &ArrayView2<f64>) -> Result<(), AlignmentError> {
    if source.nrows() != target.nrows() {
        return Err(AlignmentError::shape("alignment sample count", source.nrows(), target.nrows()));
    }
    if source.nrows() == 0 || source.ncols() == 0 || target.ncols() == 0 {
        return Err(AlignmentError::InvalidInput(format!(
            "cannot align empty signals of shapes {:?} and {:?}",
            source.dim(),
            target.dim()
        )));
    }
    Ok(())
}

fn check_same_features(source: &ArrayView2<f64>, target: &ArrayView2<f64>) -> Result<(), AlignmentError> {
    if source.ncols() != target.ncols() {
        return Err(AlignmentError::shape("alignment feature count", source.ncols(), target.ncols()));
    }
    Ok(())
}

fn check_transform_features(expected: usize, source: &ArrayView2<f64>) -> Result<(), AlignmentError> {
    if source.ncols() != expected {
        return Err(AlignmentError::shape("transform feature count", expected, source.ncols()));
    }
    Ok(())
}

/// Baseline mapping that returns the source unchanged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdentityAlignment {
    n_features: Option<usize>,
}

impl Alignment for IdentityAlignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        check_paired(&source, &target)?;
        check_same_features(&source, &target)?;
        self.n_features = Some(source.ncols());
        Ok(())
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        let n_features = self.n_features.ok_or(AlignmentError::NotFitted)?;
        check_transform_features(n_features, &source)?;
        Ok(source.to_owned())
    }
}

/// Ridge regression from source to target voxels, penalty picked by cross-validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RidgeAlignment {
    config: RidgeConfig,
    fitted: Option<RidgeFit>,
}

impl RidgeAlignment {
    pub fn new(config: RidgeConfig) -> Self {
        Self { config, fitted: None }
    }

    pub fn fitted(&self) -> Option<&RidgeFit> {
        self.fitted.as_ref()
    }
}

impl Alignment for RidgeAlignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        check_paired(&source, &target)?;
        self.fitted = Some(fit_ridge_cv(source, target, &self.config)?);
        Ok(())
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        self.fitted.as_ref().ok_or(AlignmentError::NotFitted)?.predict(source)
    }
}

/// Orthogonal Procrustes alignment, optionally with a global scale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScaledOrthogonalAlignment {
    scaling: bool,
    primal: Option<bool>,
    rotation: Option<Array2<f64>>,
    scale: f64,
}

impl Default for ScaledOrthogonalAlignment {
    fn default() -> Self {
        Self::new(true, None)
    }
}

impl ScaledOrthogonalAlignment {
    pub fn new(scaling: bool, primal: Option<bool>) -> Self {
        Self {
            scaling,
            primal,
            rotation: None,
            scale: 1.0,
        }
    }

    pub fn rotation(&self) -> Option<&Array2<f64>> {
        self.rotation.as_ref()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Alignment for ScaledOrthogonalAlignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        check_paired(&source, &target)?;
        check_same_features(&source, &target)?;
        let (rotation, scale) = scaled_procrustes(source, target, self.scaling, self.primal)?;
        self.rotation = Some(rotation);
        self.scale = scale;
        Ok(())
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        let rotation = self.rotation.as_ref().ok_or(AlignmentError::NotFitted)?;
        check_transform_features(rotation.nrows(), &source)?;
        Ok(source.dot(rotation) * self.scale)
    }
}

/// Entropic optimal transport between the columns of source and target.
///
/// The plan couples uniform distributions over features; it is multiplied by
/// the source feature count so that each row of `R` sums to one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OptimalTransportAlignment {
    config: OptimalTransportConfig,
    transport: Option<Array2<f64>>,
}

impl OptimalTransportAlignment {
    pub fn new(config: OptimalTransportConfig) -> Self {
        Self { config, transport: None }
    }

    pub fn transport(&self) -> Option<&Array2<f64>> {
        self.transport.as_ref()
    }
}

impl Alignment for OptimalTransportAlignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        check_paired(&source, &target)?;
        let cost = pairwise_distances(source, target, self.config.metric)?;
        let solution = solve_transport(cost.view(), &self.config)?;
        self.transport = Some(solution.plan * source.ncols() as f64);
        Ok(())
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        let transport = self.transport.as_ref().ok_or(AlignmentError::NotFitted)?;
        check_transform_features(transport.nrows(), &source)?;
        Ok(source.dot(transport))
    }
}

/// Hard one-to-one matching of source features onto target features.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PermutationAlignment {
    permutation: Option<Permutation>,
}

impl PermutationAlignment {
    /// `R` of shape (n_source, n_target), applied as `X * R`.
    pub fn permutation(&self) -> Option<&Permutation> {
        self.permutation.as_ref()
    }
}

impl Alignment for PermutationAlignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        check_paired(&source, &target)?;
        self.permutation = Some(optimal_permutation(source, target)?.transpose());
        Ok(())
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        self.permutation.as_ref().ok_or(AlignmentError::NotFitted)?.apply(source)
    }
}

/// Per-voxel scalar gain between matching source and target voxels.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiagonalAlignment {
    coefficients: Option<Array1<f64>>,
}

impl DiagonalAlignment {
    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coefficients.as_ref()
    }
}

impl Alignment for DiagonalAlignment {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        check_paired(&source, &target)?;
        check_same_features(&source, &target)?;
        self.coefficients = Some(voxelwise_signal_projection(source.t(), target.t())?);
        Ok(())
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        let coefficients = self.coefficients.as_ref().ok_or(AlignmentError::NotFitted)?;
        check_transform_features(coefficients.len(), &source)?;
        Ok(&source * coefficients)
    }
}

/// Closed set of estimators, serializable so region fits can be cached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AlignmentEstimator {
    Identity(IdentityAlignment),
    Ridge(RidgeAlignment),
    ScaledOrthogonal(ScaledOrthogonalAlignment),
    OptimalTransport(OptimalTransportAlignment),
    Permutation(PermutationAlignment),
    Diagonal(DiagonalAlignment),
}

impl AlignmentEstimator {
    /// Dense `R` (source features x target features) for the estimators that have one.
    /// Ridge and identity return `None`; the orthogonal variant returns the rotation
    /// without its scale.
    pub fn transformation_matrix(&self) -> Option<Array2<f64>> {
        match self {
            AlignmentEstimator::Identity(_) | AlignmentEstimator::Ridge(_) => None,
            AlignmentEstimator::ScaledOrthogonal(e) => e.rotation().cloned(),
            AlignmentEstimator::OptimalTransport(e) => e.transport().cloned(),
            AlignmentEstimator::Permutation(e) => e.permutation().map(Permutation::to_dense),
            AlignmentEstimator::Diagonal(e) => e.coefficients().map(|c| Array2::from_diag(c)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlignmentEstimator::Identity(_) => "identity",
            AlignmentEstimator::Ridge(_) => "ridge",
            AlignmentEstimator::ScaledOrthogonal(_) => "scaled_orthogonal",
            AlignmentEstimator::OptimalTransport(_) => "optimal_transport",
            AlignmentEstimator::Permutation(_) => "permutation",
            AlignmentEstimator::Diagonal(_) => "diagonal",
        }
    }
}

impl Alignment for AlignmentEstimator {
    fn fit(&mut self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<(), AlignmentError> {
        match self {
            AlignmentEstimator::Identity(e) => e.fit(source, target),
            AlignmentEstimator::Ridge(e) => e.fit(source, target),
            AlignmentEstimator::ScaledOrthogonal(e) => e.fit(source, target),
            AlignmentEstimator::OptimalTransport(e) => e.fit(source, target),
            AlignmentEstimator::Permutation(e) => e.fit(source, target),
            AlignmentEstimator::Diagonal(e) => e.fit(source, target),
        }
    }

    fn transform(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        match self {
            AlignmentEstimator::Identity(e) => e.transform(source),
            AlignmentEstimator::Ridge(e) => e.transform(source),
            AlignmentEstimator::ScaledOrthogonal(e) => e.transform(source),
            AlignmentEstimator::OptimalTransport(e) => e.transform(source),
            AlignmentEstimator::Permutation(e) => e.transform(source),
            AlignmentEstimator::Diagonal(e) => e.transform(source),
        }
    }
}

fn default_scaling() -> bool {
    true
}

/// Serializable choice of estimator and its options.
///
/// JSON form: `{"method": "scaled_orthogonal", "scaling": false}`,
/// `{"method": "ridge", "alphas": [0.1, 1.0]}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AlignmentMethod {
    Identity,
    #[serde(alias = "ridge_cv")]
    Ridge(RidgeConfig),
    ScaledOrthogonal {
        #[serde(default = "default_scaling")]
        scaling: bool,
        #[serde(default)]
        primal: Option<bool>,
    },
    #[serde(alias = "ot")]
    OptimalTransport(OptimalTransportConfig),
    #[serde(alias = "hungarian")]
    Permutation,
    Diagonal,
}

impl Default for AlignmentMethod {
    fn default() -> Self {
        AlignmentMethod::Ridge(RidgeConfig::default())
    }
}

impl AlignmentMethod {
    /// Fresh, unfitted estimator for this method.
    pub fn build(&self) -> AlignmentEstimator {
        match self {
            AlignmentMethod::Identity => AlignmentEstimator::Identity(IdentityAlignment::default()),
            AlignmentMethod::Ridge(config) => AlignmentEstimator::Ridge(RidgeAlignment::new(config.clone())),
            AlignmentMethod::ScaledOrthogonal { scaling, primal } => {
                AlignmentEstimator::ScaledOrthogonal(ScaledOrthogonalAlignment::new(*scaling, *primal))
            }
            AlignmentMethod::OptimalTransport(config) => {
                AlignmentEstimator::OptimalTransport(OptimalTransportAlignment::new(config.clone()))
            }
            AlignmentMethod::Permutation => AlignmentEstimator::Permutation(PermutationAlignment::default()),
            AlignmentMethod::Diagonal => AlignmentEstimator::Diagonal(DiagonalAlignment::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlignmentMethod::Identity => "identity",
            AlignmentMethod::Ridge(_) => "ridge",
            AlignmentMethod::ScaledOrthogonal { .. } => "scaled_orthogonal",
            AlignmentMethod::OptimalTransport(_) => "optimal_transport",
            AlignmentMethod::Permutation => "permutation",
            AlignmentMethod::Diagonal => "diagonal",
        }
    }
}

impl fmt::Display for AlignmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlignmentMethod {
    type Err = AlignmentError;

    /// Parses a method name into its default configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(AlignmentMethod::Identity),
            "ridge" | "ridge_cv" => Ok(AlignmentMethod::Ridge(RidgeConfig::default())),
            "scaled_orthogonal" | "procrustes" => Ok(AlignmentMethod::ScaledOrthogonal {
                scaling: true,
                primal: None,
            }),
            "optimal_transport" | "ot" => Ok(AlignmentMethod::OptimalTransport(OptimalTransportConfig::default())),
            "permutation" | "hungarian" => Ok(AlignmentMethod::Permutation),
            "diagonal" => Ok(AlignmentMethod::Diagonal),
            other => Err(AlignmentError::InvalidInput(format!("unknown alignment method '{}'", other))),
        }
    }
}
