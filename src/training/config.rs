//! Problem types and trainer configuration

use crate::ensemble::EnsembleSelectionConfig;
use crate::error::{KolosalError, Result};
use crate::metrics::Scorer;
use crate::optimizer::{Configuration, SchedulerConfig, SearcherType};
use crate::utils::class_counts;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Integer-valued labels with at most this many distinct values are treated as classes
const MAX_INFERRED_CLASSES: usize = 20;

/// Kind of supervised learning problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    Binary,
    Multiclass,
    Regression,
    Quantile,
}

impl ProblemType {
    pub fn is_classification(&self) -> bool {
        matches!(self, ProblemType::Binary | ProblemType::Multiclass)
    }

    /// Guess the problem type from raw labels
    pub fn infer(y: &Array1<f64>) -> Result<Self> {
        if y.iter().any(|v| !v.is_finite()) {
            return Err(KolosalError::ValidationError("labels contain non-finite values".to_string()));
        }
        let counts = class_counts(y);
        if counts.len() < 2 {
            return Err(KolosalError::InfeasibleSplit(format!(
                "label has {} unique value(s), at least 2 are required",
                counts.len()
            )));
        }
        let integral = y.iter().all(|v| v.fract() == 0.0);
        Ok(match (counts.len(), integral) {
            (2, _) => ProblemType::Binary,
            (n, true) if n <= MAX_INFERRED_CLASSES => ProblemType::Multiclass,
            _ => ProblemType::Regression,
        })
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProblemType::Binary => "binary",
            ProblemType::Multiclass => "multiclass",
            ProblemType::Regression => "regression",
            ProblemType::Quantile => "quantile",
        };
        write!(f, "{}", name)
    }
}

/// Trainer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub problem_type: ProblemType,
    /// Defaults to [`Scorer::default_for`] the problem type
    pub eval_metric: Option<Scorer>,
    /// Number of classes for classification problems
    pub num_classes: Option<usize>,
    pub quantile_levels: Option<Vec<f64>>,
    /// Directory that fitted models are written to as they finish
    pub path: Option<PathBuf>,
    pub random_seed: u64,
    /// Maximum greedy ensemble selection iterations
    pub ensemble_size: usize,
    /// Share of the time limit reserved for ensemble selection
    pub ensemble_time_fraction: f64,
    pub ensemble: EnsembleSelectionConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            problem_type: ProblemType::Binary,
            eval_metric: None,
            num_classes: None,
            quantile_levels: None,
            path: None,
            random_seed: 0,
            ensemble_size: 100,
            ensemble_time_fraction: 0.1,
            ensemble: EnsembleSelectionConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn new(problem_type: ProblemType) -> Self {
        Self {
            problem_type,
            ..Default::default()
        }
    }

    pub fn with_eval_metric(mut self, metric: Scorer) -> Self {
        self.eval_metric = Some(metric);
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    pub fn with_quantile_levels(mut self, levels: Vec<f64>) -> Self {
        self.ensemble.quantile_levels = Some(levels.clone());
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

    pub fn with_ensemble_config(mut self, config: EnsembleSelectionConfig) -> Self {
        self.ensemble = config;
        self
    }

    pub fn metric(&self) -> Scorer {
        self.eval_metric.unwrap_or_else(|| Scorer::default_for(self.problem_type))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ensemble_size < 1 {
            return Err(KolosalError::EnsembleSizeInvalid(self.ensemble_size));
        }
        if !(0.0..1.0).contains(&self.ensemble_time_fraction) {
            return Err(KolosalError::InvalidParameter {
                name: "ensemble_time_fraction".to_string(),
                value: self.ensemble_time_fraction.to_string(),
                reason: "must be in [0, 1)".to_string(),
            });
        }
        match self.problem_type {
            ProblemType::Binary | ProblemType::Multiclass => {
                let k = self.num_classes.ok_or_else(|| {
                    KolosalError::ConfigError("classification requires num_classes".to_string())
                })?;
                if k < 2 {
                    return Err(KolosalError::ConfigError(format!("num_classes must be >= 2, got {}", k)));
                }
            }
            ProblemType::Quantile => {
                let levels = self.quantile_levels.as_ref().ok_or_else(|| {
                    KolosalError::ConfigError("quantile problems require quantile_levels".to_string())
                })?;
                if levels.is_empty() || levels.iter().any(|q| !(*q > 0.0 && *q < 1.0)) {
                    return Err(KolosalError::ConfigError(
                        "quantile levels must be non-empty and inside (0, 1)".to_string(),
                    ));
                }
            }
            ProblemType::Regression => {}
        }
        Ok(())
    }
}

/// Options for one call to `Trainer::train`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    pub hyperparameter_tune: bool,
    pub searcher: SearcherType,
    pub scheduler: SchedulerConfig,
    pub feature_prune: bool,
    /// Fraction of rows held out for validation when not bagging
    pub holdout_frac: f64,
    /// `0` disables bagging
    pub num_bagging_folds: usize,
    pub num_bagging_sets: usize,
    /// Extra stacking layers on top of the base layer (requires bagging)
    pub stack_levels: usize,
    /// Per family, the configurations to train; an empty list means the family defaults
    pub hyperparameters: BTreeMap<String, Vec<Configuration>>,
    pub time_limit: Option<f64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            hyperparameter_tune: false,
            searcher: SearcherType::Random,
            scheduler: SchedulerConfig::default().with_num_trials(5),
            feature_prune: false,
            holdout_frac: 0.1,
            num_bagging_folds: 0,
            num_bagging_sets: 1,
            stack_levels: 0,
            hyperparameters: BTreeMap::new(),
            time_limit: None,
        }
    }
}

impl FitOptions {
    pub fn with_hyperparameter_tune(mut self, searcher: SearcherType, num_trials: usize) -> Self {
        self.hyperparameter_tune = true;
        self.searcher = searcher;
        self.scheduler = self.scheduler.with_num_trials(num_trials);
        self
    }

    pub fn with_feature_prune(mut self, enabled: bool) -> Self {
        self.feature_prune = enabled;
        self
    }

    pub fn with_holdout_frac(mut self, holdout_frac: f64) -> Self {
        self.holdout_frac = holdout_frac;
        self
    }

    pub fn with_bagging(mut self, num_folds: usize, num_sets: usize) -> Self {
        self.num_bagging_folds = num_folds;
        self.num_bagging_sets = num_sets.max(1);
        self
    }

    pub fn with_stack_levels(mut self, levels: usize) -> Self {
        self.stack_levels = levels;
        self
    }

    pub fn with_family(mut self, family: &str, configs: Vec<Configuration>) -> Self {
        self.hyperparameters.insert(family.to_string(), configs);
        self
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn is_bagging(&self) -> bool {
        self.num_bagging_folds >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_infer_problem_type() {
        assert_eq!(ProblemType::infer(&array![0.0, 1.0, 1.0]).unwrap(), ProblemType::Binary);
        assert_eq!(ProblemType::infer(&array![0.0, 1.0, 2.0, 2.0]).unwrap(), ProblemType::Multiclass);
        assert_eq!(ProblemType::infer(&array![0.5, 1.2, 2.7]).unwrap(), ProblemType::Regression);
        assert!(ProblemType::infer(&array![1.0, 1.0]).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainerConfig::new(ProblemType::Binary).validate().is_err());
        assert!(TrainerConfig::new(ProblemType::Binary).with_num_classes(2).validate().is_ok());
        assert!(TrainerConfig::new(ProblemType::Quantile).validate().is_err());
        let quantile = TrainerConfig::new(ProblemType::Quantile).with_quantile_levels(vec![0.1, 0.5, 0.9]);
        assert!(quantile.validate().is_ok());
        assert_eq!(quantile.ensemble.quantile_levels, Some(vec![0.1, 0.5, 0.9]));
        assert!(TrainerConfig::new(ProblemType::Regression).with_ensemble_size(0).validate().is_err());
    }

    #[test]
    fn test_default_metric() {
        let config = TrainerConfig::new(ProblemType::Regression);
        assert_eq!(config.metric(), Scorer::default_for(ProblemType::Regression));
        assert_eq!(config.with_eval_metric(Scorer::R2).metric(), Scorer::R2);
    }

    #[test]
    fn test_fit_options_serde() {
        let options = FitOptions::default().with_bagging(5, 2).with_time_limit(30.0);
        let json = serde_json::to_string(&options).unwrap();
        let back: FitOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_bagging_folds, 5);
        assert!(back.is_bagging());
        assert_eq!(back.time_limit, Some(30.0));
    }
}
