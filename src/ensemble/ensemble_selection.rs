//! Greedy forward ensemble selection
//!
//! Builds a sparse, non-negative weight vector over candidate models by
//! repeatedly adding (with replacement) the model whose inclusion gives the
//! lowest regret for the running equal-weight average. The trajectory is
//! truncated at its best point, so later iterations that only add noise do
//! not end up in the final weights.

use super::weighted::weight_pred_probas;
use crate::error::{KolosalError, Result};
use crate::metrics::{get_pred_from_proba, Scorer};
use crate::training::ProblemType;
use crate::utils::TimeBudget;
use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand::seq::index;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Regrets above this magnitude are rounded from the first iteration on
const ROUND_EPSILON: f64 = 1e-4;
const ROUND_DECIMALS: i32 = 6;
const DECISION_THRESHOLDS: usize = 10;
const SECONDARY_DECISION_THRESHOLDS: usize = 4;

/// How ties between equally good candidates are broken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreaker {
    /// Uniformly at random with the seeded generator
    #[default]
    Random,
    /// Log loss on the candidate ensembles first, then random
    SecondMetric,
}

impl std::str::FromStr for TieBreaker {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(TieBreaker::Random),
            "second_metric" => Ok(TieBreaker::SecondMetric),
            other => Err(KolosalError::ConfigError(format!(
                "unknown tie_breaker '{}', must be one of: random, second_metric",
                other
            ))),
        }
    }
}

/// Whether to tune a binary decision threshold for each candidate ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    Enabled,
    #[default]
    Disabled,
    /// Enabled for binary problems scored by a threshold-sensitive metric
    Auto,
}

/// Ensemble selection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSelectionConfig {
    pub tie_breaker: TieBreaker,
    pub calibrate_decision_threshold: CalibrationMode,
    /// Rows sampled (without replacement) to speed up selection
    pub subsample_size: Option<usize>,
    pub random_seed: u64,
    /// Required for quantile problems
    pub quantile_levels: Option<Vec<f64>>,
    /// Truncate at the best iteration instead of keeping the last one
    pub use_best: bool,
}

impl Default for EnsembleSelectionConfig {
    fn default() -> Self {
        Self {
            tie_breaker: TieBreaker::Random,
            calibrate_decision_threshold: CalibrationMode::Disabled,
            subsample_size: None,
            random_seed: 0,
            quantile_levels: None,
            use_best: true,
        }
    }
}

impl EnsembleSelectionConfig {
    pub fn with_tie_breaker(mut self, tie_breaker: TieBreaker) -> Self {
        self.tie_breaker = tie_breaker;
        self
    }

    pub fn with_calibration(mut self, mode: CalibrationMode) -> Self {
        self.calibrate_decision_threshold = mode;
        self
    }

    pub fn with_subsample_size(mut self, size: usize) -> Self {
        self.subsample_size = Some(size);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_quantile_levels(mut self, levels: Vec<f64>) -> Self {
        self.quantile_levels = Some(levels);
        self
    }
}

/// Greedy ensemble selection over out-of-sample prediction matrices
#[derive(Debug, Clone)]
pub struct EnsembleSelection {
    ensemble_size: usize,
    problem_type: ProblemType,
    metric: Scorer,
    config: EnsembleSelectionConfig,
    calibrate: bool,
    rng: Xoshiro256PlusPlus,

    num_input_models: usize,
    weights: Option<Array1<f64>>,
    indices: Vec<usize>,
    trajectory: Vec<f64>,
    trajectory_decision_threshold: Option<Vec<f64>>,
    train_score: Option<f64>,
    train_decision_threshold: Option<f64>,
    fitted_ensemble_size: usize,
}

impl EnsembleSelection {
    /// Create a selector; rejects `ensemble_size < 1` and calibration on non-binary problems
    pub fn new(
        ensemble_size: usize,
        problem_type: ProblemType,
        metric: Scorer,
        config: EnsembleSelectionConfig,
    ) -> Result<Self> {
        if ensemble_size < 1 {
            return Err(KolosalError::EnsembleSizeInvalid(ensemble_size));
        }
        let calibrate = match config.calibrate_decision_threshold {
            CalibrationMode::Enabled => true,
            CalibrationMode::Disabled => false,
            CalibrationMode::Auto => problem_type == ProblemType::Binary && metric.needs_class(),
        };
        if calibrate && problem_type != ProblemType::Binary {
            return Err(KolosalError::ConfigError(format!(
                "decision threshold calibration requires a binary problem, got {}",
                problem_type
            )));
        }
        if problem_type == ProblemType::Quantile && config.quantile_levels.is_none() {
            return Err(KolosalError::ConfigError(
                "quantile problems require quantile_levels".to_string(),
            ));
        }
        let rng = Xoshiro256PlusPlus::seed_from_u64(config.random_seed);
        Ok(Self {
            ensemble_size,
            problem_type,
            metric,
            config,
            calibrate,
            rng,
            num_input_models: 0,
            weights: None,
            indices: Vec::new(),
            trajectory: Vec::new(),
            trajectory_decision_threshold: None,
            train_score: None,
            train_decision_threshold: None,
            fitted_ensemble_size: 0,
        })
    }

    /// Run greedy selection.
    ///
    /// `predictions[j]` holds model `j`'s out-of-sample predictions, one row
    /// per entry of `labels`. Running out of `time_limit` is not an error:
    /// selection stops early with a warning.
    pub fn fit(
        &mut self,
        predictions: &[Array2<f64>],
        labels: &Array1<f64>,
        time_limit: Option<f64>,
        sample_weight: Option<&Array1<f64>>,
    ) -> Result<()> {
        self.validate_inputs(predictions, labels, sample_weight)?;
        let budget = TimeBudget::new(time_limit);
        let num_models = predictions.len();
        let num_samples_total = labels.len();
        self.num_input_models = num_models;

        let sub_predictions: Vec<Array2<f64>>;
        let sub_labels: Array1<f64>;
        let sub_weights: Option<Array1<f64>>;
        let (predictions, labels, sample_weight) = match self.config.subsample_size {
            Some(size) if size < num_samples_total => {
                debug!(size, "Subsampling rows to speed up ensemble selection");
                let idx = index::sample(&mut self.rng, num_samples_total, size).into_vec();
                sub_predictions = predictions.iter().map(|p| p.select(Axis(0), &idx)).collect();
                sub_labels = labels.select(Axis(0), &idx);
                sub_weights = sample_weight.map(|w| w.select(Axis(0), &idx));
                (&sub_predictions[..], &sub_labels, sub_weights.as_ref())
            }
            _ => (predictions, labels, sample_weight),
        };

        let shape = predictions[0].raw_dim();
        let mut ensemble_sum: Array2<f64> = Array2::zeros(shape);
        let mut trajectory: Vec<f64> = Vec::new();
        let mut trajectory_threshold: Vec<f64> = Vec::new();
        let mut order: Vec<usize> = Vec::new();
        let mut used_models: HashSet<usize> = HashSet::new();
        let mut round_scores = false;

        for i in 0..self.ensemble_size {
            let s = order.len();
            let weighted = if s == 0 {
                Array2::zeros(ensemble_sum.raw_dim())
            } else {
                let s_f = s as f64;
                ensemble_sum.mapv(|v| (v / s_f) * (s_f / (s_f + 1.0)))
            };
            let inv = 1.0 / (s as f64 + 1.0);

            let evaluated: Vec<(f64, Option<f64>)> = predictions
                .par_iter()
                .map(|pred| {
                    let fant = self.fantasy(&weighted, pred, inv);
                    let threshold = if self.calibrate {
                        Some(self.metric.calibrate_decision_threshold(
                            labels,
                            &fant,
                            sample_weight,
                            DECISION_THRESHOLDS,
                            SECONDARY_DECISION_THRESHOLDS,
                        )?)
                    } else {
                        None
                    };
                    let regret = self.calculate_regret(labels, &fant, self.metric, sample_weight, threshold)?;
                    Ok((regret, threshold))
                })
                .collect::<Result<Vec<_>>>()?;

            let scores: Vec<f64> = evaluated
                .iter()
                .map(|(regret, _)| if round_scores { round_to(*regret, ROUND_DECIMALS) } else { *regret })
                .collect();

            let min_score = scores
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .fold(f64::INFINITY, f64::min);
            if !min_score.is_finite() && scores.iter().all(|v| v.is_nan()) {
                return Err(KolosalError::ValidationError(
                    "every candidate ensemble scored NaN".to_string(),
                ));
            }
            let mut all_best: Vec<usize> = (0..num_models).filter(|&j| scores[j] == min_score).collect();

            if all_best.len() > 1 && !used_models.is_empty() {
                let already_used: Vec<usize> = all_best.iter().copied().filter(|j| used_models.contains(j)).collect();
                if !already_used.is_empty() {
                    all_best = already_used;
                }
            }

            if all_best.len() > 1
                && self.config.tie_breaker == TieBreaker::SecondMetric
                && self.problem_type.is_classification()
            {
                all_best = self.tie_break_log_loss(&all_best, predictions, &weighted, inv, labels)?;
            }

            let best = all_best[self.rng.gen_range(0..all_best.len())];
            let mut best_score = scores[best];
            if self.calibrate {
                trajectory_threshold.push(evaluated[best].1.unwrap_or(0.5));
            }

            if i == 0 && best_score.abs() > ROUND_EPSILON {
                round_scores = true;
                best_score = round_to(best_score, ROUND_DECIMALS);
            }

            ensemble_sum += &predictions[best];
            trajectory.push(best_score);
            order.push(best);
            used_models.insert(best);

            if num_models == 1 {
                break;
            }

            if budget.is_exhausted() {
                warn!(
                    iteration = i + 1,
                    "Ensemble selection ran out of time, stopping early. The time limit may be too small for this problem"
                );
                break;
            }
        }

        let min_score = trajectory.iter().copied().fold(f64::INFINITY, f64::min);
        let first_index_of_best = trajectory.iter().position(|&v| v == min_score).unwrap_or(0);
        let keep = if self.config.use_best {
            first_index_of_best + 1
        } else {
            trajectory.len()
        };

        self.indices = order[..keep].to_vec();
        self.trajectory = trajectory[..keep].to_vec();
        self.train_score = self.trajectory.last().copied();
        if self.calibrate {
            let kept = trajectory_threshold[..keep].to_vec();
            self.train_decision_threshold = kept.last().copied();
            self.trajectory_decision_threshold = Some(kept);
        } else {
            self.train_decision_threshold = None;
            self.trajectory_decision_threshold = None;
        }
        self.fitted_ensemble_size = keep;
        self.calculate_weights();
        debug!(
            ensemble_size = keep,
            train_score = ?self.train_score,
            indices = ?self.indices,
            "Ensemble selection finished"
        );
        Ok(())
    }

    fn validate_inputs(
        &self,
        predictions: &[Array2<f64>],
        labels: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
    ) -> Result<()> {
        if self.ensemble_size < 1 {
            return Err(KolosalError::EnsembleSizeInvalid(self.ensemble_size));
        }
        let first = predictions.first().ok_or_else(|| {
            KolosalError::ValidationError("ensemble selection needs at least one prediction matrix".to_string())
        })?;
        if first.nrows() != labels.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} rows", labels.len()),
                actual: format!("{} rows", first.nrows()),
            });
        }
        if let Some(bad) = predictions.iter().find(|p| p.dim() != first.dim()) {
            return Err(KolosalError::ShapeError {
                expected: format!("{:?}", first.dim()),
                actual: format!("{:?}", bad.dim()),
            });
        }
        if let Some(w) = sample_weight {
            if w.len() != labels.len() {
                return Err(KolosalError::ShapeError {
                    expected: format!("{} sample weights", labels.len()),
                    actual: format!("{} sample weights", w.len()),
                });
            }
        }
        Ok(())
    }

    /// Ensemble that would result from adding `pred` as one more member
    fn fantasy(&self, weighted: &Array2<f64>, pred: &Array2<f64>, inv: f64) -> Array2<f64> {
        let mut fant = weighted + &pred.mapv(|v| v * inv);
        if self.problem_type == ProblemType::Multiclass {
            for mut row in fant.rows_mut() {
                let total = row.sum();
                if total != 0.0 {
                    row.mapv_inplace(|v| v / total);
                }
            }
        }
        fant
    }

    fn calculate_regret(
        &self,
        labels: &Array1<f64>,
        proba: &Array2<f64>,
        metric: Scorer,
        sample_weight: Option<&Array1<f64>>,
        decision_threshold: Option<f64>,
    ) -> Result<f64> {
        let score = metric.score_proba(
            labels,
            proba,
            self.problem_type,
            decision_threshold,
            sample_weight,
            self.config.quantile_levels.as_deref(),
        )?;
        Ok(metric.convert_score_to_error(score))
    }

    fn tie_break_log_loss(
        &self,
        all_best: &[usize],
        predictions: &[Array2<f64>],
        weighted: &Array2<f64>,
        inv: f64,
        labels: &Array1<f64>,
    ) -> Result<Vec<usize>> {
        let mut tiebreak = Vec::with_capacity(all_best.len());
        for &j in all_best {
            let fant = weighted + &predictions[j].mapv(|v| v * inv);
            tiebreak.push(self.calculate_regret(labels, &fant, Scorer::LogLoss, None, None)?);
        }
        let min = tiebreak.iter().copied().filter(|v| !v.is_nan()).fold(f64::INFINITY, f64::min);
        let winners: Vec<usize> = all_best
            .iter()
            .zip(&tiebreak)
            .filter(|(_, &v)| v == min)
            .map(|(&j, _)| j)
            .collect();
        Ok(if winners.is_empty() { all_best.to_vec() } else { winners })
    }

    fn calculate_weights(&mut self) {
        let mut weights = Array1::<f64>::zeros(self.num_input_models);
        for &idx in &self.indices {
            weights[idx] += 1.0;
        }
        weights.mapv_inplace(|c| c / self.fitted_ensemble_size as f64);
        let total = weights.sum();
        if total < 1.0 && total > 0.0 {
            weights.mapv_inplace(|w| w / total);
        }
        self.weights = Some(weights);
    }

    /// `sum_i weight_i * predictions[i]`
    pub fn predict_proba(&self, predictions: &[Array2<f64>]) -> Result<Array2<f64>> {
        let weights = self.weights.as_ref().ok_or(KolosalError::ModelNotFitted)?;
        weight_pred_probas(predictions, weights.as_slice().unwrap_or(&[]))
    }

    /// Hard predictions using the calibrated threshold, if any
    pub fn predict(&self, predictions: &[Array2<f64>]) -> Result<Array2<f64>> {
        let proba = self.predict_proba(predictions)?;
        Ok(get_pred_from_proba(&proba, self.problem_type, self.train_decision_threshold))
    }

    /// Per-model weights, one per input prediction matrix
    pub fn weights(&self) -> Option<&Array1<f64>> {
        self.weights.as_ref()
    }

    /// Selected model index per retained iteration
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Regret per retained iteration
    pub fn trajectory(&self) -> &[f64] {
        &self.trajectory
    }

    /// Regret of the final ensemble
    pub fn train_score(&self) -> Option<f64> {
        self.train_score
    }

    pub fn decision_threshold(&self) -> Option<f64> {
        self.train_decision_threshold
    }

    pub fn trajectory_decision_threshold(&self) -> Option<&[f64]> {
        self.trajectory_decision_threshold.as_deref()
    }

    /// Requested maximum number of members
    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    /// Members actually retained after truncation
    pub fn fitted_ensemble_size(&self) -> usize {
        self.fitted_ensemble_size
    }

    pub fn problem_type(&self) -> ProblemType {
        self.problem_type
    }

    pub fn metric(&self) -> Scorer {
        self.metric
    }

    pub fn calibrates_decision_threshold(&self) -> bool {
        self.calibrate
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
