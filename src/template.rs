//! Group templates learned by alternating minimization, and prediction of
//! unseen conditions for new subjects from such a template.

use crate::alignment::AlignmentMethod;
use crate::cache::CacheLocation;
use crate::error::AlignmentError;
use crate::hyperalignment::{worker_pool, Hyperalignment, HyperalignmentConfig};
use crate::kernels::frobenius_norm;
use crate::regions::RegionPartition;
use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Element-wise mean of `signals`, optionally rescaled to their average norm.
pub fn rescaled_euclidean_mean(signals: &[Array2<f64>], scale_average: bool) -> Result<Array2<f64>, AlignmentError> {
    let first = signals
        .first()
        .ok_or_else(|| AlignmentError::InvalidInput("cannot average zero signals".to_string()))?;
    let mut mean = Array2::<f64>::zeros(first.dim());
    for signal in signals {
        if signal.dim() != first.dim() {
            let (expected, found) = if signal.nrows() != first.nrows() {
                (first.nrows(), signal.nrows())
            } else {
                (first.ncols(), signal.ncols())
            };
            return Err(AlignmentError::shape("averaged signal shape", expected, found));
        }
        mean += signal;
    }
    mean /= signals.len() as f64;

    if scale_average {
        let average_norm = signals.iter().map(|s| frobenius_norm(s.view())).sum::<f64>() / signals.len() as f64;
        let mean_norm = frobenius_norm(mean.view());
        if mean_norm > 0.0 {
            mean *= average_norm / mean_norm;
        }
    }
    Ok(mean)
}

/// Alternates between averaging and aligning every signal onto the average.
///
/// `align(source, template)` must return `source` mapped into the template space.
/// `n_iter` counts template estimates: the first is the (rescaled) mean of the
/// raw signals and each later one is the mean of the signals aligned to the
/// previous estimate. The last estimate is returned, so `n_iter` of 0 or 1 gives
/// the plain mean. The history holds the estimates strictly between the first
/// and the last.
pub fn create_template<F>(
    signals: &[Array2<f64>],
    n_iter: usize,
    scale: bool,
    mut align: F,
) -> Result<(Array2<f64>, Vec<Array2<f64>>), AlignmentError>
where
    F: FnMut(&Array2<f64>, &Array2<f64>) -> Result<Array2<f64>, AlignmentError>,
{
    let mut template = rescaled_euclidean_mean(signals, scale)?;
    let mut history = Vec::with_capacity(n_iter.saturating_sub(2));
    for round in 1..n_iter {
        let aligned = signals
            .iter()
            .map(|signal| align(signal, &template))
            .collect::<Result<Vec<_>, _>>()?;
        let next = rescaled_euclidean_mean(&aligned, scale)?;
        let previous = std::mem::replace(&mut template, next);
        if round > 1 {
            history.push(previous);
        }
    }
    Ok((template, history))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateAlignmentConfig {
    pub alignment_method: AlignmentMethod,
    pub n_iter: usize,
    pub scale_template: bool,
    /// Workers for the region fits during `fit` and for the subjects during `transform`.
    pub n_jobs: i32,
}

impl Default for TemplateAlignmentConfig {
    fn default() -> Self {
        Self {
            alignment_method: AlignmentMethod::ScaledOrthogonal {
                scaling: true,
                primal: None,
            },
            n_iter: 2,
            scale_template: false,
            n_jobs: 1,
        }
    }
}

/// Learns a full-brain template from training subjects and predicts new
/// subjects' responses to conditions only the template has seen.
pub struct TemplateAlignment {
    config: TemplateAlignmentConfig,
    partition: Option<RegionPartition>,
    template: Option<Array2<f64>>,
    template_history: Vec<Array2<f64>>,
}

impl TemplateAlignment {
    pub fn new(config: TemplateAlignmentConfig) -> Self {
        Self {
            config,
            partition: None,
            template: None,
            template_history: Vec::new(),
        }
    }

    pub fn template(&self) -> Option<&Array2<f64>> {
        self.template.as_ref()
    }

    pub fn template_history(&self) -> &[Array2<f64>] {
        &self.template_history
    }

    fn pairwise(&self, partition: &RegionPartition, n_jobs: i32) -> Hyperalignment {
        Hyperalignment::new(HyperalignmentConfig {
            mode: partition.mode(),
            alignment_method: self.config.alignment_method.clone(),
            n_jobs,
            cache: CacheLocation::Memory,
            template_iterations: 0,
            scale_template: false,
        })
    }

    /// Region-wise prediction of `target` from `source`.
    fn align_pair(
        &self,
        partition: &RegionPartition,
        n_jobs: i32,
        fit_source: ArrayView2<f64>,
        fit_target: ArrayView2<f64>,
        predict_from: ArrayView2<f64>,
    ) -> Result<Array2<f64>, AlignmentError> {
        let mut model = self.pairwise(partition, n_jobs);
        model.fit_pair(fit_source, fit_target, partition)?;
        model.transform_pair(predict_from)
    }

    pub fn fit(&mut self, subjects: &[Array2<f64>], partition: &RegionPartition) -> Result<(), AlignmentError> {
        let started = Instant::now();
        if subjects.len() < 2 {
            return Err(AlignmentError::InvalidInput(
                "a template needs at least two subjects".to_string(),
            ));
        }
        info!(
            "Learning a template from {} subjects over {} {} regions ({} rounds).",
            subjects.len(),
            partition.len(),
            partition.mode(),
            self.config.n_iter
        );
        let (template, history) = create_template(
            subjects,
            self.config.n_iter,
            self.config.scale_template,
            |source, target| self.align_pair(partition, self.config.n_jobs, source.view(), target.view(), source.view()),
        )?;
        self.template = Some(template);
        self.template_history = history;
        self.partition = Some(partition.clone());
        info!("Template learned in {:.2?}.", started.elapsed());
        Ok(())
    }

    /// Predicts, for every subject, the template rows `test_index`.
    ///
    /// Each subject's signal must correspond to the template rows `train_index`;
    /// the mapping learned from those rows is applied to the `test_index` rows.
    pub fn transform(
        &self,
        subjects: &[Array2<f64>],
        train_index: &[usize],
        test_index: &[usize],
    ) -> Result<Vec<Array2<f64>>, AlignmentError> {
        let template = self.template.as_ref().ok_or(AlignmentError::NotFitted)?;
        let partition = self.partition.as_ref().ok_or(AlignmentError::NotFitted)?;
        for (name, index) in [("train_index", train_index), ("test_index", test_index)] {
            if index.is_empty() {
                return Err(AlignmentError::InvalidInput(format!("{} is empty", name)));
            }
            if let Some(&bad) = index.iter().find(|&&i| i >= template.nrows()) {
                return Err(AlignmentError::InvalidInput(format!(
                    "{} entry {} outside a template of {} samples",
                    name,
                    bad,
                    template.nrows()
                )));
            }
        }
        for subject in subjects {
            if subject.nrows() != train_index.len() {
                return Err(AlignmentError::shape("subject sample count", train_index.len(), subject.nrows()));
            }
            if subject.ncols() != template.ncols() {
                return Err(AlignmentError::shape("subject voxel count", template.ncols(), subject.ncols()));
            }
        }

        let mapping_rows = template.select(Axis(0), train_index);
        let predicted_rows = template.select(Axis(0), test_index);
        debug!(
            "Predicting {} samples for {} subjects from {} shared samples.",
            test_index.len(),
            subjects.len(),
            train_index.len()
        );
        let pool = worker_pool(self.config.n_jobs)?;
        pool.install(|| {
            subjects
                .par_iter()
                .map(|subject| {
                    self.align_pair(
                        partition,
                        1,
                        mapping_rows.view(),
                        subject.view(),
                        predicted_rows.view(),
                    )
                })
                .collect()
        })
    }
}
