use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{BciError, Result};
use crate::types::{Epoch, Prediction};

/// Covariance estimators accepted by [`ClassifierConfig`].
pub const COVARIANCE_ESTIMATORS: &[&str] = &["empirical", "oas", "shrunk"];

/// Shrinkage factor used by the fixed "shrunk" estimator.
const SHRUNK_ALPHA: f64 = 0.1;

/// Classifier configuration.
///
/// `oversample_ratio` and `undersample_ratio` re-balance the training set
/// before a fit and are mutually exclusive. With ratio `r`, oversampling
/// duplicates random members of smaller classes up to `ceil(r * largest)`,
/// and undersampling trims larger classes down to `ceil(r * smallest)`;
/// `r = 1.0` therefore means full balance in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Cross-validation fold count, at least 2.
    pub n_splits: usize,
    pub oversample_ratio: f64,
    pub undersample_ratio: f64,
    /// One of [`COVARIANCE_ESTIMATORS`].
    pub covariance_estimator: String,
    /// Seed for every stochastic sub-procedure (shuffling, resampling).
    pub random_seed: u64,
    /// Labeled epochs required before the first fit; the effective minimum
    /// is never below `2 * n_splits`.
    pub min_training_epochs: Option<usize>,
    /// Explicit opt-in: after each predict call, fold the predicted labels
    /// back into the training set as pseudo-labels and refit. Off by
    /// default; pseudo-labels can drift the model.
    pub update_after_predict: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            n_splits: 5,
            oversample_ratio: 0.0,
            undersample_ratio: 0.0,
            covariance_estimator: "oas".to_string(),
            random_seed: 42,
            min_training_epochs: None,
            update_after_predict: false,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_splits < 2 {
            return Err(BciError::Configuration(format!(
                "n_splits must be at least 2, got {}",
                self.n_splits
            )));
        }
        if self.oversample_ratio < 0.0 || self.undersample_ratio < 0.0 {
            return Err(BciError::Configuration(
                "resampling ratios must be non-negative".to_string(),
            ));
        }
        if self.oversample_ratio > 0.0 && self.undersample_ratio > 0.0 {
            return Err(BciError::Configuration(
                "oversample_ratio and undersample_ratio are mutually exclusive".to_string(),
            ));
        }
        if !COVARIANCE_ESTIMATORS.contains(&self.covariance_estimator.as_str()) {
            return Err(BciError::Configuration(format!(
                "unknown covariance estimator '{}', expected one of {:?}",
                self.covariance_estimator, COVARIANCE_ESTIMATORS
            )));
        }
        Ok(())
    }

    /// Labeled epochs required before the first fit.
    pub fn effective_min_epochs(&self) -> usize {
        self.min_training_epochs
            .unwrap_or(0)
            .max(2 * self.n_splits)
    }
}

/// What a `train` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// Epochs were stored but the configured minimum is not reached yet.
    Accumulated { total: usize },
    /// The model was (re)fit over the accumulated set.
    Fitted { cv_accuracy: f64 },
}

/// Stateful trainable/predictive unit.
///
/// `train` and `predict` are selected per call, never inferred from data
/// shape. Implementations are driven from a single loop; no internal
/// locking is expected.
pub trait Classifier: Send {
    fn config(&self) -> &ClassifierConfig;

    fn is_trained(&self) -> bool;

    /// Accumulate labeled epochs and fit once the configured minimum is
    /// reached. Fails with `InsufficientLabels` when fewer than two
    /// distinct labels are present at fit time.
    fn train(&mut self, epochs: &[Epoch]) -> Result<TrainOutcome>;

    /// One label (plus per-class scores) per input epoch, in input order.
    /// Fails with `NotTrained` before the first successful fit. Read-only
    /// with respect to the model unless `update_after_predict` is set.
    fn predict(&mut self, epochs: &[Epoch]) -> Result<Prediction>;
}

#[derive(Debug, Clone, Copy)]
enum CovEstimator {
    Empirical,
    Oas,
    Shrunk,
}

impl CovEstimator {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "empirical" => Ok(Self::Empirical),
            "oas" => Ok(Self::Oas),
            "shrunk" => Ok(Self::Shrunk),
            other => Err(BciError::Configuration(format!(
                "unknown covariance estimator '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct TrainingFeature {
    label: i32,
    cov: DMatrix<f64>,
}

/// Minimum-distance-to-mean classifier over channel covariance features.
///
/// Each epoch is reduced to a shrinkage-regularized channel covariance
/// matrix; a class is represented by the mean covariance of its training
/// epochs and prediction picks the class whose mean is nearest in Frobenius
/// distance. Every (re)fit reports seeded k-fold cross-validated accuracy.
pub struct MdmClassifier {
    config: ClassifierConfig,
    estimator: CovEstimator,
    training: Vec<TrainingFeature>,
    /// Per-class mean covariance; empty until the first successful fit.
    means: BTreeMap<i32, DMatrix<f64>>,
    rng: StdRng,
}

impl MdmClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let estimator = CovEstimator::parse(&config.covariance_estimator)?;
        let rng = StdRng::seed_from_u64(config.random_seed);
        Ok(Self {
            config,
            estimator,
            training: Vec::new(),
            means: BTreeMap::new(),
            rng,
        })
    }

    fn covariance(&self, epoch: &Epoch) -> Result<DMatrix<f64>> {
        let p = epoch.n_channels();
        let n = epoch.n_samples();
        if p == 0 || n < 2 {
            return Err(BciError::Configuration(format!(
                "epoch at {:.4}s is too small for covariance ({} channels x {} samples)",
                epoch.onset, p, n
            )));
        }

        let mut x = DMatrix::from_fn(p, n, |r, c| epoch.data[r][c]);
        for r in 0..p {
            let mean = x.row(r).sum() / n as f64;
            for c in 0..n {
                x[(r, c)] -= mean;
            }
        }
        let cov = (&x * x.transpose()) / (n as f64 - 1.0);

        Ok(match self.estimator {
            CovEstimator::Empirical => cov,
            CovEstimator::Shrunk => shrink(&cov, SHRUNK_ALPHA),
            CovEstimator::Oas => {
                let alpha = oas_shrinkage(&cov, n);
                shrink(&cov, alpha)
            }
        })
    }

    /// Indices into `training` after class re-balancing.
    fn balanced_indices(&mut self) -> Vec<usize> {
        let mut by_class: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (idx, feature) in self.training.iter().enumerate() {
            by_class.entry(feature.label).or_default().push(idx);
        }
        let largest = by_class.values().map(Vec::len).max().unwrap_or(0);
        let smallest = by_class.values().map(Vec::len).min().unwrap_or(0);

        let mut selected = Vec::new();
        for indices in by_class.values() {
            let mut class_indices = indices.clone();
            if self.config.oversample_ratio > 0.0 {
                let target = (self.config.oversample_ratio * largest as f64).ceil() as usize;
                while class_indices.len() < target {
                    let pick = indices[self.rng.random_range(0..indices.len())];
                    class_indices.push(pick);
                }
            } else if self.config.undersample_ratio > 0.0 {
                let target = ((self.config.undersample_ratio * smallest as f64).ceil() as usize)
                    .max(1);
                if class_indices.len() > target {
                    class_indices.shuffle(&mut self.rng);
                    class_indices.truncate(target);
                }
            }
            selected.extend(class_indices);
        }
        selected
    }

    fn fit(&mut self) -> Result<f64> {
        let distinct: BTreeSet<i32> = self.training.iter().map(|f| f.label).collect();
        if distinct.len() < 2 {
            return Err(BciError::InsufficientLabels {
                distinct: distinct.len(),
            });
        }

        let selected = self.balanced_indices();
        let cv_accuracy = self.cross_validate(&selected);
        self.means = class_means(&self.training, &selected);

        log::info!(
            "Fit over {} epochs ({} classes), {}-fold cv accuracy {:.3}",
            selected.len(),
            distinct.len(),
            self.config.n_splits,
            cv_accuracy
        );
        Ok(cv_accuracy)
    }

    /// Seeded k-fold accuracy over the balanced training set. Folds are
    /// evaluated in parallel; this never touches the fitted model.
    fn cross_validate(&mut self, selected: &[usize]) -> f64 {
        let mut shuffled = selected.to_vec();
        shuffled.shuffle(&mut self.rng);

        let k = self.config.n_splits.min(shuffled.len()).max(2);
        let folds: Vec<&[usize]> = chunk_evenly(&shuffled, k);
        let training = &self.training;

        let (correct, total) = folds
            .par_iter()
            .enumerate()
            .map(|(i, fold)| {
                let rest: Vec<usize> = folds
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .flat_map(|(_, f)| f.iter().copied())
                    .collect();
                let means = class_means(training, &rest);
                if means.is_empty() {
                    return (0usize, 0usize);
                }
                let correct = fold
                    .iter()
                    .filter(|&&idx| {
                        let (label, _) = nearest_class(&means, &training[idx].cov);
                        label == training[idx].label
                    })
                    .count();
                (correct, fold.len())
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        }
    }
}

impl Classifier for MdmClassifier {
    fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn is_trained(&self) -> bool {
        !self.means.is_empty()
    }

    fn train(&mut self, epochs: &[Epoch]) -> Result<TrainOutcome> {
        for epoch in epochs {
            let label = match epoch.label {
                Some(label) => label,
                None => {
                    log::warn!(
                        "Skipping unlabeled epoch at {:.4}s in training batch",
                        epoch.onset
                    );
                    continue;
                }
            };
            let cov = self.covariance(epoch)?;
            self.training.push(TrainingFeature { label, cov });
        }

        let total = self.training.len();
        if total < self.config.effective_min_epochs() {
            log::debug!(
                "Accumulated {}/{} training epochs",
                total,
                self.config.effective_min_epochs()
            );
            return Ok(TrainOutcome::Accumulated { total });
        }

        let cv_accuracy = self.fit()?;
        Ok(TrainOutcome::Fitted { cv_accuracy })
    }

    fn predict(&mut self, epochs: &[Epoch]) -> Result<Prediction> {
        if self.means.is_empty() {
            return Err(BciError::NotTrained);
        }

        let class_labels: Vec<i32> = self.means.keys().copied().collect();
        let mut labels = Vec::with_capacity(epochs.len());
        let mut scores = Vec::with_capacity(epochs.len());
        let mut pseudo = Vec::new();

        for epoch in epochs {
            let cov = self.covariance(epoch)?;
            let (label, distances) = nearest_class(&self.means, &cov);
            labels.push(label);
            scores.push(distances_to_scores(&distances));
            if self.config.update_after_predict {
                pseudo.push(TrainingFeature { label, cov });
            }
        }

        if !pseudo.is_empty() {
            self.training.extend(pseudo);
            if let Err(e) = self.fit() {
                log::warn!("Pseudo-label refit failed: {}", e);
            }
        }

        Ok(Prediction::new(labels, Some(scores), class_labels))
    }
}

/// `(1 - alpha) * C + alpha * mu * I` with `mu = trace(C) / p`.
fn shrink(cov: &DMatrix<f64>, alpha: f64) -> DMatrix<f64> {
    let p = cov.nrows();
    let mu = cov.trace() / p as f64;
    let identity = DMatrix::identity(p, p);
    cov * (1.0 - alpha) + identity * (alpha * mu)
}

/// Oracle Approximating Shrinkage coefficient for a sample covariance over
/// `n` observations.
fn oas_shrinkage(cov: &DMatrix<f64>, n: usize) -> f64 {
    let p = cov.nrows() as f64;
    let n = n as f64;
    let tr = cov.trace();
    let tr_sq = (cov * cov).trace();

    let numerator = (1.0 - 2.0 / p) * tr_sq + tr * tr;
    let denominator = (n + 1.0 - 2.0 / p) * (tr_sq - tr * tr / p);
    if denominator <= 0.0 {
        return 1.0;
    }
    (numerator / denominator).clamp(0.0, 1.0)
}

fn class_means(training: &[TrainingFeature], indices: &[usize]) -> BTreeMap<i32, DMatrix<f64>> {
    let mut sums: BTreeMap<i32, (DMatrix<f64>, usize)> = BTreeMap::new();
    for &idx in indices {
        let feature = &training[idx];
        sums.entry(feature.label)
            .and_modify(|(sum, count)| {
                *sum += &feature.cov;
                *count += 1;
            })
            .or_insert_with(|| (feature.cov.clone(), 1));
    }
    sums.into_iter()
        .map(|(label, (sum, count))| (label, sum / count as f64))
        .collect()
}

/// Nearest class mean in Frobenius distance; returns the winning label and
/// the distance to every class, in ascending label order.
fn nearest_class(means: &BTreeMap<i32, DMatrix<f64>>, cov: &DMatrix<f64>) -> (i32, Vec<f64>) {
    let mut best_label = 0;
    let mut best_distance = f64::INFINITY;
    let mut distances = Vec::with_capacity(means.len());
    for (&label, mean) in means {
        let distance = (cov - mean).norm();
        if distance < best_distance {
            best_distance = distance;
            best_label = label;
        }
        distances.push(distance);
    }
    (best_label, distances)
}

/// Softmax over negated distances, so nearer classes score higher.
fn distances_to_scores(distances: &[f64]) -> Vec<f64> {
    let min = distances.iter().copied().fold(f64::INFINITY, f64::min);
    let exps: Vec<f64> = distances.iter().map(|d| (-(d - min)).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum == 0.0 {
        vec![1.0 / distances.len() as f64; distances.len()]
    } else {
        exps.into_iter().map(|e| e / sum).collect()
    }
}

/// Split `items` into `k` contiguous folds whose sizes differ by at most one.
fn chunk_evenly(items: &[usize], k: usize) -> Vec<&[usize]> {
    let n = items.len();
    let base = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let len = base + usize::from(i < extra);
        folds.push(&items[start..start + len]);
        start += len;
    }
    folds
}
