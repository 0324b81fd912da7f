// Region-wise functional alignment

#![doc = include_str!("../README.md")]

pub mod alignment;
pub mod cache;
pub mod error;
pub mod hyperalignment;
pub mod kernels;
pub mod linalg_backends;
pub mod metrics;
pub mod regions;
pub mod ridge;
pub mod template;
pub mod transport;

pub use alignment::{
    Alignment, AlignmentEstimator, AlignmentMethod, DiagonalAlignment, IdentityAlignment,
    OptimalTransportAlignment, PermutationAlignment, RidgeAlignment, ScaledOrthogonalAlignment,
};
pub use cache::{CacheLocation, RegionFit, RegionFitCache, RegionModel};
pub use error::{AlignmentError, RegionFailure};
pub use hyperalignment::{Hyperalignment, HyperalignmentConfig};
pub use kernels::{
    optimal_permutation, pairwise_distances, scaled_procrustes, voxelwise_signal_projection, GroundMetric,
    Permutation,
};
pub use metrics::zero_mean_coefficient_determination;
pub use regions::{PartitionMode, Region, RegionId, RegionPartition};
pub use ridge::{RidgeConfig, RidgeFit};
pub use template::{create_template, rescaled_euclidean_mean, TemplateAlignment, TemplateAlignmentConfig};
pub use transport::{OptimalTransportConfig, SinkhornSolver, TransportPlan};
