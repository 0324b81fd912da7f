//! Region-wise hyperalignment.
//!
//! One independent estimator (or set of estimators) is fit per region of a
//! [`RegionPartition`], in parallel, and persisted through a [`RegionFitCache`].
//! Predictions are made region by region and merged back into full voxel space.

use crate::alignment::{Alignment, AlignmentEstimator, AlignmentMethod};
use crate::cache::{CacheLocation, RegionFit, RegionFitCache, RegionModel};
use crate::error::{AlignmentError, RegionFailure};
use crate::kernels::voxelwise_signal_projection;
use crate::regions::{PartitionMode, Region, RegionId, RegionPartition};
use crate::template::create_template;
use log::{debug, info, trace, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperalignmentConfig {
    pub mode: PartitionMode,
    pub alignment_method: AlignmentMethod,
    /// 1 runs regions sequentially, -1 uses every worker, -k all but k - 1.
    pub n_jobs: i32,
    pub cache: CacheLocation,
    /// Template estimates per region; 1 keeps the plain mean of the subjects.
    pub template_iterations: usize,
    /// Rescale region templates to the average norm of the aligned signals.
    pub scale_template: bool,
}

impl Default for HyperalignmentConfig {
    fn default() -> Self {
        Self {
            mode: PartitionMode::Searchlight,
            alignment_method: AlignmentMethod::default(),
            n_jobs: 1,
            cache: CacheLocation::default(),
            template_iterations: 2,
            scale_template: false,
        }
    }
}

/// Number of worker threads for an `n_jobs` setting.
pub fn resolve_n_jobs(n_jobs: i32) -> Result<usize, AlignmentError> {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match n_jobs {
        0 => Err(AlignmentError::InvalidInput("n_jobs must be non-zero".to_string())),
        n if n > 0 => Ok(n as usize),
        n => Ok((available as i64 + 1 + n as i64).max(1) as usize),
    }
}

pub(crate) fn worker_pool(n_jobs: i32) -> Result<rayon::ThreadPool, AlignmentError> {
    let threads = resolve_n_jobs(n_jobs)?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| AlignmentError::InvalidInput(format!("could not start {} workers: {}", threads, e)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FitKind {
    Shared { n_subjects: usize },
    Pairwise,
}

#[derive(Clone, Debug)]
struct FittedState {
    partition: RegionPartition,
    kind: FitKind,
}

/// Fits and applies region-wise alignments.
pub struct Hyperalignment {
    config: HyperalignmentConfig,
    cache: RegionFitCache,
    state: Option<FittedState>,
}

impl Hyperalignment {
    pub fn new(config: HyperalignmentConfig) -> Self {
        let cache = RegionFitCache::new(&config.cache);
        Self {
            config,
            cache,
            state: None,
        }
    }

    pub fn config(&self) -> &HyperalignmentConfig {
        &self.config
    }

    pub fn cache(&self) -> &RegionFitCache {
        &self.cache
    }

    /// Partition seen at fit time.
    pub fn partition(&self) -> Option<&RegionPartition> {
        self.state.as_ref().map(|s| &s.partition)
    }

    fn check_partition(&self, partition: &RegionPartition, n_voxels: usize) -> Result<(), AlignmentError> {
        if partition.mode() != self.config.mode {
            return Err(AlignmentError::InvalidInput(format!(
                "configured for {} regions but given a {} partition",
                self.config.mode,
                partition.mode()
            )));
        }
        if partition.n_voxels() != n_voxels {
            return Err(AlignmentError::shape("partition voxel count", n_voxels, partition.n_voxels()));
        }
        Ok(())
    }

    /// Multi-subject fit: per region, a template plus mappings into and out of it
    /// for every subject.
    pub fn fit(&mut self, subjects: &[Array2<f64>], partition: &RegionPartition) -> Result<(), AlignmentError> {
        let started = Instant::now();
        let (n_samples, n_voxels) = check_subjects(subjects)?;
        if subjects.len() < 2 {
            return Err(AlignmentError::InvalidInput(
                "hyperalignment needs at least two subjects".to_string(),
            ));
        }
        self.check_partition(partition, n_voxels)?;
        self.cache.prepare()?;
        info!(
            "Fitting {} {} regions for {} subjects ({} samples x {} voxels) with {} alignment.",
            partition.len(),
            partition.mode(),
            subjects.len(),
            n_samples,
            n_voxels,
            self.config.alignment_method
        );

        let this = &*self;
        let outcome = this.fit_regions(partition, |id, region| this.fit_shared_region(id, region, subjects));
        self.state = Some(FittedState {
            partition: partition.clone(),
            kind: FitKind::Shared {
                n_subjects: subjects.len(),
            },
        });
        info!("Hyperalignment fit finished in {:.2?}.", started.elapsed());
        outcome
    }

    /// Pairwise fit: per region, one mapping from `source` to `target`.
    pub fn fit_pair(
        &mut self,
        source: ArrayView2<f64>,
        target: ArrayView2<f64>,
        partition: &RegionPartition,
    ) -> Result<(), AlignmentError> {
        let started = Instant::now();
        if source.dim() != target.dim() {
            let (expected, found) = if source.nrows() != target.nrows() {
                (source.nrows(), target.nrows())
            } else {
                (source.ncols(), target.ncols())
            };
            return Err(AlignmentError::shape("pairwise signal shape", expected, found));
        }
        self.check_partition(partition, source.ncols())?;
        self.cache.prepare()?;
        debug!(
            "Fitting {} pairwise {} regions with {} alignment.",
            partition.len(),
            partition.mode(),
            self.config.alignment_method
        );

        let this = &*self;
        let outcome = this.fit_regions(partition, |id, region| {
            let mut estimator = this.config.alignment_method.build();
            estimator.fit(
                source.select(Axis(1), region.voxels()).view(),
                target.select(Axis(1), region.voxels()).view(),
            )?;
            Ok(RegionFit {
                region: id,
                model: RegionModel::Pairwise(estimator),
            })
        });
        self.state = Some(FittedState {
            partition: partition.clone(),
            kind: FitKind::Pairwise,
        });
        debug!("Pairwise fit finished in {:.2?}.", started.elapsed());
        outcome
    }

    /// Runs `fit_region` for every region on the worker pool and stores the results.
    /// Failed regions are logged, evicted from the cache and reported together.
    fn fit_regions<F>(&self, partition: &RegionPartition, fit_region: F) -> Result<(), AlignmentError>
    where
        F: Fn(RegionId, &Region) -> Result<RegionFit, AlignmentError> + Sync,
    {
        let key = partition.key();
        let pool = worker_pool(self.config.n_jobs)?;
        let outcomes: Vec<(RegionId, Result<(), AlignmentError>)> = pool.install(|| {
            partition
                .regions()
                .par_iter()
                .enumerate()
                .map(|(index, region)| {
                    let id = RegionId(index);
                    let outcome = fit_region(id, region).and_then(|fit| self.cache.store(&key, &fit));
                    trace!("Region {} of {} done.", index, partition.len());
                    (id, outcome)
                })
                .collect()
        });

        let mut failures = Vec::new();
        for (id, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!("Region {} failed to fit: {}", id, e);
                let message = match self.cache.remove(&key, id) {
                    Ok(()) => e.to_string(),
                    Err(evict) => {
                        warn!("Could not evict the stale record of region {}: {}", id, evict);
                        format!("{}; stale record left in cache: {}", e, evict)
                    }
                };
                failures.push(RegionFailure {
                    region: id.0,
                    message,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AlignmentError::RegionFailures {
                total: partition.len(),
                failures,
            })
        }
    }

    fn fit_shared_region(
        &self,
        id: RegionId,
        region: &Region,
        subjects: &[Array2<f64>],
    ) -> Result<RegionFit, AlignmentError> {
        let method = &self.config.alignment_method;
        let slices: Vec<Array2<f64>> = subjects
            .iter()
            .map(|subject| subject.select(Axis(1), region.voxels()))
            .collect();

        let (template, _) = create_template(
            &slices,
            self.config.template_iterations,
            self.config.scale_template,
            |source, target| {
                let mut estimator = method.build();
                estimator.fit(source.view(), target.view())?;
                estimator.transform(source.view())
            },
        )?;

        let mut to_template = Vec::with_capacity(slices.len());
        let mut from_template = Vec::with_capacity(slices.len());
        for slice in &slices {
            let mut forward = method.build();
            forward.fit(slice.view(), template.view())?;
            let mut backward = method.build();
            backward.fit(template.view(), slice.view())?;
            to_template.push(forward);
            from_template.push(backward);
        }
        Ok(RegionFit {
            region: id,
            model: RegionModel::Shared {
                to_template,
                from_template,
            },
        })
    }

    /// Loads the cached estimators of one region.
    pub fn region_fit(&self, region: RegionId) -> Result<RegionFit, AlignmentError> {
        let state = self.state.as_ref().ok_or(AlignmentError::NotFitted)?;
        if region.0 >= state.partition.len() {
            return Err(AlignmentError::InvalidInput(format!(
                "region {} outside a partition of {} regions",
                region,
                state.partition.len()
            )));
        }
        self.cache.load(&state.partition.key(), region)
    }

    /// Maps every subject through the shared space and back, returning one
    /// prediction per subject with the subject's shape.
    pub fn transform(&self, subjects: &[Array2<f64>]) -> Result<Vec<Array2<f64>>, AlignmentError> {
        let started = Instant::now();
        let state = self.state.as_ref().ok_or(AlignmentError::NotFitted)?;
        match state.kind {
            FitKind::Shared { n_subjects } if n_subjects != subjects.len() => {
                return Err(AlignmentError::shape("subject count", n_subjects, subjects.len()));
            }
            FitKind::Pairwise => {
                return Err(AlignmentError::InvalidInput(
                    "model was fit pairwise; use transform_pair".to_string(),
                ));
            }
            FitKind::Shared { .. } => {}
        }
        let (n_samples, n_voxels) = check_subjects(subjects)?;
        if n_voxels != state.partition.n_voxels() {
            return Err(AlignmentError::shape("subject voxel count", state.partition.n_voxels(), n_voxels));
        }

        let key = state.partition.key();
        let pool = worker_pool(self.config.n_jobs)?;
        let per_region: Vec<Vec<Array2<f64>>> = pool.install(|| {
            state
                .partition
                .regions()
                .par_iter()
                .enumerate()
                .map(|(index, region)| {
                    let fit = self.cache.load(&key, RegionId(index))?;
                    predict_shared_region(&fit, region, subjects)
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let predictions = subjects
            .iter()
            .enumerate()
            .map(|(s, subject)| {
                let region_predictions: Vec<&Array2<f64>> = per_region.iter().map(|p| &p[s]).collect();
                aggregate_region_predictions(&state.partition, &region_predictions, n_samples, Some(subject.view()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Transformed {} subjects over {} regions in {:.2?}.",
            subjects.len(),
            state.partition.len(),
            started.elapsed()
        );
        Ok(predictions)
    }

    /// Predicts the target signal from `source` with the pairwise region fits.
    pub fn transform_pair(&self, source: ArrayView2<f64>) -> Result<Array2<f64>, AlignmentError> {
        let state = self.state.as_ref().ok_or(AlignmentError::NotFitted)?;
        if state.kind != FitKind::Pairwise {
            return Err(AlignmentError::InvalidInput(
                "model was fit on several subjects; use transform".to_string(),
            ));
        }
        if source.ncols() != state.partition.n_voxels() {
            return Err(AlignmentError::shape(
                "source voxel count",
                state.partition.n_voxels(),
                source.ncols(),
            ));
        }

        let key = state.partition.key();
        let pool = worker_pool(self.config.n_jobs)?;
        let per_region: Vec<Array2<f64>> = pool.install(|| {
            state
                .partition
                .regions()
                .par_iter()
                .enumerate()
                .map(|(index, region)| {
                    let fit = self.cache.load(&key, RegionId(index))?;
                    match &fit.model {
                        RegionModel::Pairwise(estimator) => {
                            estimator.transform(source.select(Axis(1), region.voxels()).view())
                        }
                        RegionModel::Shared { .. } => Err(AlignmentError::CacheCodec(format!(
                            "region {} holds a multi-subject fit",
                            index
                        ))),
                    }
                })
                .collect::<Result<Vec<_>, _>>()
        })?;
        let references: Vec<&Array2<f64>> = per_region.iter().collect();
        aggregate_region_predictions(&state.partition, &references, source.nrows(), None)
    }
}

/// Checks that all subjects share one shape and returns it.
fn check_subjects(subjects: &[Array2<f64>]) -> Result<(usize, usize), AlignmentError> {
    let first = subjects
        .first()
        .ok_or_else(|| AlignmentError::InvalidInput("no subjects given".to_string()))?;
    let (n_samples, n_voxels) = first.dim();
    for subject in &subjects[1..] {
        if subject.nrows() != n_samples {
            return Err(AlignmentError::shape("subject sample count", n_samples, subject.nrows()));
        }
        if subject.ncols() != n_voxels {
            return Err(AlignmentError::shape("subject voxel count", n_voxels, subject.ncols()));
        }
    }
    Ok((n_samples, n_voxels))
}

fn shared_estimators(fit: &RegionFit, n_subjects: usize) -> Result<(&[AlignmentEstimator], &[AlignmentEstimator]), AlignmentError> {
    match &fit.model {
        RegionModel::Shared {
            to_template,
            from_template,
        } if to_template.len() == n_subjects && from_template.len() == n_subjects => {
            Ok((to_template.as_slice(), from_template.as_slice()))
        }
        RegionModel::Shared { to_template, .. } => {
            Err(AlignmentError::shape("region subject count", to_template.len(), n_subjects))
        }
        RegionModel::Pairwise(_) => Err(AlignmentError::CacheCodec(format!(
            "region {} holds a pairwise fit",
            fit.region
        ))),
    }
}

/// Maps each subject's region slice into the template space, averages the
/// projections into a shared response and maps it back to every subject.
fn predict_shared_region(
    fit: &RegionFit,
    region: &Region,
    subjects: &[Array2<f64>],
) -> Result<Vec<Array2<f64>>, AlignmentError> {
    let (to_template, from_template) = shared_estimators(fit, subjects.len())?;
    let mut shared: Option<Array2<f64>> = None;
    for (subject, forward) in subjects.iter().zip(to_template) {
        let projected = forward.transform(subject.select(Axis(1), region.voxels()).view())?;
        shared = Some(match shared.take() {
            Some(total) => total + &projected,
            None => projected,
        });
    }
    let mut shared = shared.ok_or_else(|| AlignmentError::InvalidInput("no subjects given".to_string()))?;
    shared /= subjects.len() as f64;
    from_template
        .iter()
        .map(|backward| backward.transform(shared.view()))
        .collect()
}

/// Merges per-region predictions into one (n_samples x n_voxels) signal.
///
/// A voxel predicted by a single region takes that prediction as is. A voxel
/// predicted by several regions takes their weighted mean (searchlight weights
/// `(radius - d) / radius`, uniform if every weight is zero); when `reference`
/// is given, that mean is then rescaled by its least-squares projection
/// coefficient onto the reference voxel.
pub fn aggregate_region_predictions(
    partition: &RegionPartition,
    predictions: &[&Array2<f64>],
    n_samples: usize,
    reference: Option<ArrayView2<f64>>,
) -> Result<Array2<f64>, AlignmentError> {
    if predictions.len() != partition.len() {
        return Err(AlignmentError::shape("region prediction count", partition.len(), predictions.len()));
    }
    let n_voxels = partition.n_voxels();
    if let Some(reference) = &reference {
        if reference.dim() != (n_samples, n_voxels) {
            return Err(AlignmentError::shape("reference voxel count", n_voxels, reference.ncols()));
        }
    }

    let mut weighted_sum = Array2::<f64>::zeros((n_samples, n_voxels));
    let mut plain_sum = Array2::<f64>::zeros((n_samples, n_voxels));
    let mut weight_total = Array1::<f64>::zeros(n_voxels);
    let mut contributors = vec![0usize; n_voxels];

    for (region, prediction) in partition.regions().iter().zip(predictions) {
        if prediction.nrows() != n_samples {
            return Err(AlignmentError::shape("region prediction samples", n_samples, prediction.nrows()));
        }
        if prediction.ncols() != region.len() {
            return Err(AlignmentError::shape("region prediction voxels", region.len(), prediction.ncols()));
        }
        let weights = partition.voxel_weights(region);
        for (local, &voxel) in region.voxels().iter().enumerate() {
            let column = prediction.column(local);
            let mut weighted = weighted_sum.column_mut(voxel);
            weighted.scaled_add(weights[local], &column);
            let mut plain = plain_sum.column_mut(voxel);
            plain += &column;
            weight_total[voxel] += weights[local];
            contributors[voxel] += 1;
        }
    }

    let mut aggregated = Array2::<f64>::zeros((n_samples, n_voxels));
    let mut overlapped = Vec::new();
    for voxel in 0..n_voxels {
        let mut target = aggregated.column_mut(voxel);
        match contributors[voxel] {
            0 => {
                return Err(AlignmentError::InvalidInput(format!("voxel {} is not covered by any region", voxel)));
            }
            1 => target.assign(&plain_sum.column(voxel)),
            k => {
                if weight_total[voxel] > 0.0 {
                    target.assign(&(&weighted_sum.column(voxel) / weight_total[voxel]));
                } else {
                    target.assign(&(&plain_sum.column(voxel) / k as f64));
                }
                overlapped.push(voxel);
            }
        }
    }

    if let Some(reference) = reference {
        if !overlapped.is_empty() {
            let means = aggregated.select(Axis(1), &overlapped);
            let observed = reference.select(Axis(1), &overlapped);
            let coefficients = voxelwise_signal_projection(means.t(), observed.t())?;
            for (&voxel, &c) in overlapped.iter().zip(coefficients.iter()) {
                aggregated.column_mut(voxel).mapv_inplace(|v| v * c);
            }
        }
    }
    Ok(aggregated)
}
