//! Learner: the `fit()` entry point
//!
//! Cleans labels before the [`Trainer`] sees them: resolves the problem
//! type, drops classes too rare to split, encodes class labels to `0..k`
//! and hands the trainer whatever time is left.

use super::split::{adjust_threshold_if_necessary, ThresholdAdjustment};
use super::trainer::{LeaderboardEntry, Trainer};
use super::{FitOptions, ModelRegistry, ProblemType, TrainerConfig};
use crate::ensemble::EnsembleSelectionConfig;
use crate::error::{KolosalError, Result};
use crate::metrics::Scorer;
use crate::utils::{class_counts, label_key, select_labels, select_rows, TimeBudget};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

pub const LEARNER_FILE: &str = "learner.json";
pub const TRAINER_DIR: &str = "trainer";

/// Learner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Inferred from the labels when unset
    pub problem_type: Option<ProblemType>,
    pub eval_metric: Option<Scorer>,
    /// Classes with fewer rows than this are dropped (adjusted downward when needed)
    pub label_count_threshold: usize,
    pub quantile_levels: Option<Vec<f64>>,
    pub path: Option<PathBuf>,
    pub random_seed: u64,
    pub ensemble_size: usize,
    pub ensemble: EnsembleSelectionConfig,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            problem_type: None,
            eval_metric: None,
            label_count_threshold: 10,
            quantile_levels: None,
            path: None,
            random_seed: 0,
            ensemble_size: 100,
            ensemble: EnsembleSelectionConfig::default(),
        }
    }
}

impl LearnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_problem_type(mut self, problem_type: ProblemType) -> Self {
        self.problem_type = Some(problem_type);
        self
    }

    pub fn with_eval_metric(mut self, metric: Scorer) -> Self {
        self.eval_metric = Some(metric);
        self
    }

    pub fn with_label_count_threshold(mut self, threshold: usize) -> Self {
        self.label_count_threshold = threshold;
        self
    }

    pub fn with_quantile_levels(mut self, levels: Vec<f64>) -> Self {
        self.quantile_levels = Some(levels);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_ensemble_size(mut self, size: usize) -> Self {
        self.ensemble_size = size;
        self
    }
}

/// Maps class labels to `0..k` and back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    /// Original labels, ascending; position is the encoded value
    classes: Vec<f64>,
}

impl LabelEncoder {
    pub fn fit(y: &Array1<f64>) -> Self {
        let mut first_seen: BTreeMap<i64, f64> = BTreeMap::new();
        for &label in y.iter() {
            first_seen.entry(label_key(label)).or_insert(label);
        }
        Self {
            classes: first_seen.into_values().collect(),
        }
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn code(&self, label: f64) -> Option<usize> {
        let key = label_key(label);
        self.classes.iter().position(|&c| label_key(c) == key)
    }

    /// Encode labels; an unseen label is an error
    pub fn transform(&self, y: &Array1<f64>) -> Result<Array1<f64>> {
        y.iter()
            .map(|&label| {
                self.code(label)
                    .map(|c| c as f64)
                    .ok_or_else(|| KolosalError::ValidationError(format!("unknown class label {}", label)))
            })
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from_vec)
    }

    pub fn inverse_transform(&self, encoded: f64) -> Result<f64> {
        let idx = encoded.round();
        if idx < 0.0 || idx as usize >= self.classes.len() {
            return Err(KolosalError::ValidationError(format!("class index {} out of range", encoded)));
        }
        Ok(self.classes[idx as usize])
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LearnerState {
    config: LearnerConfig,
    problem_type: ProblemType,
    label_encoder: Option<LabelEncoder>,
    threshold_adjustment: Option<ThresholdAdjustment>,
    fit_time_secs: f64,
}

/// Entry point that prepares labels and drives a [`Trainer`]
pub struct Learner {
    config: LearnerConfig,
    registry: ModelRegistry,
    problem_type: Option<ProblemType>,
    label_encoder: Option<LabelEncoder>,
    threshold_adjustment: Option<ThresholdAdjustment>,
    trainer: Option<Trainer>,
    fit_time_secs: f64,
}

impl Learner {
    pub fn new(config: LearnerConfig) -> Self {
        Self::with_registry(config, ModelRegistry::with_builtin())
    }

    pub fn with_registry(config: LearnerConfig, registry: ModelRegistry) -> Self {
        Self {
            config,
            registry,
            problem_type: None,
            label_encoder: None,
            threshold_adjustment: None,
            trainer: None,
            fit_time_secs: 0.0,
        }
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    /// Resolved problem type, available after `fit` or `load`
    pub fn problem_type(&self) -> Option<ProblemType> {
        self.problem_type
    }

    pub fn classes(&self) -> Option<&[f64]> {
        self.label_encoder.as_ref().map(LabelEncoder::classes)
    }

    pub fn threshold_adjustment(&self) -> Option<&ThresholdAdjustment> {
        self.threshold_adjustment.as_ref()
    }

    pub fn trainer(&self) -> Result<&Trainer> {
        self.trainer.as_ref().ok_or(KolosalError::ModelNotFitted)
    }

    pub fn fit_time_secs(&self) -> f64 {
        self.fit_time_secs
    }

    pub fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        x_val: Option<&Array2<f64>>,
        y_val: Option<&Array1<f64>>,
        options: &FitOptions,
    ) -> Result<()> {
        let start = Instant::now();
        let budget = TimeBudget::new(options.time_limit);
        if x.nrows() != y.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} labels", x.nrows()),
                actual: format!("{} labels", y.len()),
            });
        }
        if x_val.is_some() != y_val.is_some() {
            return Err(KolosalError::ValidationError(
                "validation features and labels must be given together".to_string(),
            ));
        }

        let mut problem_type = match self.config.problem_type {
            Some(problem_type) => problem_type,
            None => {
                let inferred = ProblemType::infer(y)?;
                info!(problem_type = %inferred, "Inferred problem type");
                inferred
            }
        };
        if problem_type == ProblemType::Quantile && self.config.quantile_levels.is_none() {
            return Err(KolosalError::ConfigError("quantile problems require quantile_levels".to_string()));
        }

        let has_validation = y_val.is_some();
        let holdout_frac = if has_validation { 1.0 } else { options.holdout_frac };
        let adjustment = adjust_threshold_if_necessary(
            y,
            problem_type,
            self.config.label_count_threshold,
            holdout_frac,
            options.num_bagging_folds,
        )?;
        let mut trainer_options = options.clone();
        trainer_options.num_bagging_folds = adjustment.num_bagging_folds;
        if !has_validation {
            trainer_options.holdout_frac = adjustment.holdout_frac;
        }

        let mut x_train = x.clone();
        let mut y_train = y.clone();
        let mut x_valid = x_val.cloned();
        let mut y_valid = y_val.cloned();
        let mut label_encoder = None;
        if problem_type.is_classification() {
            let counts = class_counts(y);
            let keep = |label: f64| counts.get(&label_key(label)).copied().unwrap_or(0) >= adjustment.threshold;
            let rows: Vec<usize> = (0..y.len()).filter(|&i| keep(y[i])).collect();
            if rows.len() < y.len() {
                info!(
                    dropped_rows = y.len() - rows.len(),
                    threshold = adjustment.threshold,
                    "Dropped rows of rare classes"
                );
                x_train = select_rows(x, &rows);
                y_train = select_labels(y, &rows);
            }
            if let (Some(xv), Some(yv)) = (x_val, y_val) {
                let rows: Vec<usize> = (0..yv.len()).filter(|&i| keep(yv[i])).collect();
                x_valid = Some(select_rows(xv, &rows));
                y_valid = Some(select_labels(yv, &rows));
            }

            let encoder = LabelEncoder::fit(&y_train);
            if encoder.num_classes() < 2 {
                return Err(KolosalError::InfeasibleSplit(
                    "fewer than 2 classes left after dropping rare classes".to_string(),
                ));
            }
            if problem_type == ProblemType::Multiclass && encoder.num_classes() == 2 {
                info!("Only 2 classes remain, training as a binary problem");
                problem_type = ProblemType::Binary;
            }
            y_train = encoder.transform(&y_train)?;
            y_valid = y_valid.map(|yv| encoder.transform(&yv)).transpose()?;
            label_encoder = Some(encoder);
        }

        let time_limit_trainer = match budget.remaining_secs() {
            Some(remaining) if remaining <= 0.0 => {
                return Err(KolosalError::TimeBudgetExhausted {
                    phase: "trainer".to_string(),
                })
            }
            remaining => remaining,
        };
        trainer_options.time_limit = time_limit_trainer;
        info!(
            preprocessing_secs = budget.elapsed_secs(),
            time_limit_trainer = ?time_limit_trainer,
            "Label preprocessing finished"
        );

        let mut trainer_config = TrainerConfig::new(problem_type)
            .with_seed(self.config.random_seed)
            .with_ensemble_size(self.config.ensemble_size)
            .with_ensemble_config(self.config.ensemble.clone());
        if let Some(metric) = self.config.eval_metric {
            trainer_config = trainer_config.with_eval_metric(metric);
        }
        if let Some(encoder) = &label_encoder {
            trainer_config = trainer_config.with_num_classes(encoder.num_classes());
        }
        if let Some(levels) = &self.config.quantile_levels {
            trainer_config = trainer_config.with_quantile_levels(levels.clone());
        }
        if let Some(path) = &self.config.path {
            trainer_config = trainer_config.with_path(path.join(TRAINER_DIR));
        }

        let mut trainer = Trainer::new(trainer_config, self.registry.clone())?;
        trainer.train(&x_train, &y_train, x_valid.as_ref(), y_valid.as_ref(), &trainer_options)?;

        self.problem_type = Some(problem_type);
        self.label_encoder = label_encoder;
        self.threshold_adjustment = Some(adjustment);
        self.trainer = Some(trainer);
        self.fit_time_secs = start.elapsed().as_secs_f64();
        if let Some(path) = self.config.path.clone() {
            self.save_state(&path)?;
        }
        Ok(())
    }

    /// Predictions in the original label space: class labels, regression
    /// values, or one column per quantile level
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let pred = self.trainer()?.predict(x)?;
        match &self.label_encoder {
            Some(encoder) => {
                let mut decoded = pred;
                for value in decoded.iter_mut() {
                    *value = encoder.inverse_transform(*value)?;
                }
                Ok(decoded)
            }
            None => Ok(pred),
        }
    }

    /// Ensemble probabilities. Columns follow [`Learner::classes`]; binary
    /// problems return the positive (second) class only.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.trainer()?.predict_proba(x)
    }

    pub fn score(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<f64> {
        let trainer = self.trainer()?;
        match &self.label_encoder {
            Some(encoder) => trainer.score(x, &encoder.transform(y)?),
            None => trainer.score(x, y),
        }
    }

    pub fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>> {
        Ok(self.trainer()?.leaderboard())
    }

    /// Write `learner.json` and the trainer under `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.trainer()?.save(dir.join(TRAINER_DIR))?;
        self.save_state(dir)
    }

    fn save_state(&self, dir: &Path) -> Result<()> {
        let problem_type = self.problem_type.ok_or(KolosalError::ModelNotFitted)?;
        fs::create_dir_all(dir)?;
        let state = LearnerState {
            config: self.config.clone(),
            problem_type,
            label_encoder: self.label_encoder.clone(),
            threshold_adjustment: self.threshold_adjustment,
            fit_time_secs: self.fit_time_secs,
        };
        fs::write(dir.join(LEARNER_FILE), serde_json::to_vec_pretty(&state)?)?;
        Ok(())
    }

    pub fn load(dir: impl AsRef<Path>, registry: ModelRegistry) -> Result<Self> {
        let dir = dir.as_ref();
        let state: LearnerState = serde_json::from_slice(&fs::read(dir.join(LEARNER_FILE))?)?;
        let trainer = Trainer::load(dir.join(TRAINER_DIR), registry.clone())?;
        Ok(Self {
            config: state.config,
            registry,
            problem_type: Some(state.problem_type),
            label_encoder: state.label_encoder,
            threshold_adjustment: state.threshold_adjustment,
            trainer: Some(trainer),
            fit_time_secs: state.fit_time_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn three_class_data() -> (Array2<f64>, Array1<f64>) {
        // Classes 10 and 20 are well separated; class 30 has a single row.
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..30 {
            rows.push(i as f64 * 0.1);
            labels.push(10.0);
            rows.push(10.0 + i as f64 * 0.1);
            labels.push(20.0);
        }
        rows.push(50.0);
        labels.push(30.0);
        (
            Array2::from_shape_vec((rows.len(), 1), rows).unwrap(),
            Array1::from_vec(labels),
        )
    }

    #[test]
    fn test_label_encoder() {
        let encoder = LabelEncoder::fit(&array![5.0, -1.0, 5.0, 3.0]);
        assert_eq!(encoder.classes(), &[-1.0, 3.0, 5.0]);
        assert_eq!(encoder.transform(&array![3.0, 5.0]).unwrap(), array![1.0, 2.0]);
        assert_eq!(encoder.inverse_transform(0.0).unwrap(), -1.0);
        assert!(encoder.transform(&array![4.0]).is_err());
        assert!(encoder.inverse_transform(3.0).is_err());
    }

    #[test]
    fn test_fit_drops_rare_class_and_decodes() {
        let (x, y) = three_class_data();
        let mut learner = Learner::new(LearnerConfig::new().with_seed(3));
        learner.fit(&x, &y, None, None, &FitOptions::default()).unwrap();

        // Dropping class 30 leaves a binary problem.
        assert_eq!(learner.problem_type(), Some(ProblemType::Binary));
        assert_eq!(learner.classes().unwrap(), &[10.0, 20.0]);
        let pred = learner.predict(&array![[0.5], [11.0]]).unwrap();
        assert_eq!(pred, array![[10.0], [20.0]]);
        assert!(learner.score(&array![[0.5], [11.0]], &array![10.0, 20.0]).unwrap() > 0.99);
    }

    #[test]
    fn test_validation_data_sets_holdout_to_one() {
        let (x, y) = three_class_data();
        let mut learner = Learner::new(LearnerConfig::new().with_label_count_threshold(1));
        let x_val = array![[0.2], [10.2]];
        let y_val = array![10.0, 20.0];
        learner.fit(&x, &y, Some(&x_val), Some(&y_val), &FitOptions::default()).unwrap();
        assert_eq!(learner.threshold_adjustment().unwrap().threshold, 1);
        assert_eq!(learner.problem_type(), Some(ProblemType::Multiclass));
    }

    #[test]
    fn test_exhausted_budget_before_trainer() {
        let (x, y) = three_class_data();
        let mut learner = Learner::new(LearnerConfig::new());
        let err = learner
            .fit(&x, &y, None, None, &FitOptions::default().with_time_limit(0.0))
            .unwrap_err();
        assert!(matches!(err, KolosalError::TimeBudgetExhausted { .. }));
    }

    #[test]
    fn test_unfitted_learner() {
        let learner = Learner::new(LearnerConfig::new());
        assert!(matches!(learner.predict(&array![[1.0]]), Err(KolosalError::ModelNotFitted)));
    }
}
