//! Trainable model abstraction, factories and model handles

use super::ProblemType;
use crate::error::{KolosalError, Result};
use crate::metrics::Scorer;
use crate::optimizer::{Configuration, SearchSpace};
use crate::utils::neg_inf_as_null;
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a model family needs to know about the task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemInfo {
    pub problem_type: ProblemType,
    /// Number of classes, 0 for regression and quantile problems
    pub num_classes: usize,
    pub quantile_levels: Option<Vec<f64>>,
    pub eval_metric: Scorer,
    pub random_seed: u64,
}

impl ProblemInfo {
    /// Columns produced by `predict_proba`
    pub fn output_width(&self) -> usize {
        match self.problem_type {
            ProblemType::Binary | ProblemType::Regression => 1,
            ProblemType::Multiclass => self.num_classes,
            ProblemType::Quantile => self.quantile_levels.as_ref().map(Vec::len).unwrap_or(1),
        }
    }

    /// Score predictions with the evaluation metric, higher is better
    pub fn score(&self, y: &Array1<f64>, proba: &Array2<f64>) -> Result<f64> {
        self.eval_metric
            .score_proba(y, proba, self.problem_type, None, None, self.quantile_levels.as_deref())
    }
}

/// Training data for one fit call
#[derive(Debug, Clone, Copy)]
pub struct FitData<'a> {
    pub x: &'a Array2<f64>,
    pub y: &'a Array1<f64>,
    pub x_val: Option<&'a Array2<f64>>,
    pub y_val: Option<&'a Array1<f64>>,
    /// Seconds the fit may take
    pub time_limit: Option<f64>,
}

impl<'a> FitData<'a> {
    pub fn new(x: &'a Array2<f64>, y: &'a Array1<f64>) -> Self {
        Self {
            x,
            y,
            x_val: None,
            y_val: None,
            time_limit: None,
        }
    }

    pub fn with_validation(mut self, x_val: &'a Array2<f64>, y_val: &'a Array1<f64>) -> Self {
        self.x_val = Some(x_val);
        self.y_val = Some(y_val);
        self
    }

    pub fn with_time_limit(mut self, time_limit: Option<f64>) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.x.nrows() != self.y.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} labels", self.x.nrows()),
                actual: format!("{} labels", self.y.len()),
            });
        }
        if self.x.nrows() == 0 {
            return Err(KolosalError::ValidationError("cannot fit on zero rows".to_string()));
        }
        Ok(())
    }
}

/// A model the trainer can fit, predict with and persist.
///
/// `predict_proba` returns `n x 1` positive-class probabilities for binary
/// problems, `n x k` for multiclass, `n x 1` values for regression and
/// `n x q` quantiles.
pub trait TrainableModel: Send + Sync + fmt::Debug {
    fn family(&self) -> &'static str;

    fn fit(&mut self, data: &FitData<'_>) -> Result<()>;

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>>;

    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Builds and restores models of one family
pub trait ModelFactory: Send + Sync {
    fn family(&self) -> &'static str;

    fn default_search_space(&self, problem: &ProblemInfo) -> SearchSpace;

    fn build(&self, config: &Configuration, problem: &ProblemInfo) -> Result<Box<dyn TrainableModel>>;

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn TrainableModel>>;
}

/// Model factories keyed by family name
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, Arc<dyn ModelFactory>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `linear` and `knn` families
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::linear_models::LinearFactory));
        registry.register(Arc::new(super::knn::KnnFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ModelFactory>) {
        self.factories.insert(factory.family().to_string(), factory);
    }

    pub fn get(&self, family: &str) -> Result<Arc<dyn ModelFactory>> {
        self.factories
            .get(family)
            .cloned()
            .ok_or_else(|| KolosalError::ModelNotFound(format!("no model family named '{}'", family)))
    }

    pub fn families(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// One template per configuration; families without any get their defaults
    pub fn templates(
        &self,
        hyperparameters: &BTreeMap<String, Vec<Configuration>>,
        problem: &ProblemInfo,
    ) -> Result<Vec<ModelTemplate>> {
        let mut templates = Vec::new();
        if hyperparameters.is_empty() {
            for factory in self.factories.values() {
                templates.push(ModelTemplate::new(factory.family(), factory.clone(), problem));
            }
            return Ok(templates);
        }
        for (family, configs) in hyperparameters {
            let factory = self.get(family)?;
            if configs.is_empty() {
                templates.push(ModelTemplate::new(family, factory.clone(), problem));
                continue;
            }
            for (i, config) in configs.iter().enumerate() {
                let name = if configs.len() == 1 {
                    family.clone()
                } else {
                    format!("{}_{}", family, i + 1)
                };
                templates.push(ModelTemplate::new(&name, factory.clone(), problem).with_overrides(config));
            }
        }
        Ok(templates)
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("families", &self.families())
            .finish()
    }
}

/// A model family plus the hyperparameters (or search space) to train it with
#[derive(Clone)]
pub struct ModelTemplate {
    pub name: String,
    pub factory: Arc<dyn ModelFactory>,
    pub search_space: SearchSpace,
}

impl ModelTemplate {
    pub fn new(name: &str, factory: Arc<dyn ModelFactory>, problem: &ProblemInfo) -> Self {
        let search_space = factory.default_search_space(problem);
        Self {
            name: name.to_string(),
            factory,
            search_space,
        }
    }

    /// Pin the given hyperparameters to fixed values
    pub fn with_overrides(mut self, config: &Configuration) -> Self {
        for (name, value) in config.iter() {
            self.search_space = self.search_space.fixed(name, value.clone());
        }
        self
    }

    pub fn with_search_space(mut self, space: SearchSpace) -> Self {
        self.search_space = space;
        self
    }

    pub fn family(&self) -> &'static str {
        self.factory.family()
    }

    /// Hyperparameters used when not tuning
    pub fn default_config(&self) -> Configuration {
        self.search_space.default_configuration()
    }
}

impl fmt::Debug for ModelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelTemplate")
            .field("name", &self.name)
            .field("family", &self.family())
            .field("search_space", &self.search_space)
            .finish()
    }
}

/// Bagging layout of a fitted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaggingInfo {
    pub num_folds: usize,
    pub num_sets: usize,
    pub children: Vec<String>,
}

/// Identity of a fitted model artifact. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub name: String,
    pub family: String,
    pub hyperparameters: Configuration,
    /// Directory holding the persisted model, if written
    pub path: Option<PathBuf>,
    #[serde(with = "neg_inf_as_null")]
    pub val_score: f64,
    pub fit_time_secs: f64,
    pub stack_level: usize,
    /// Models whose predictions are appended to the inputs, in column order
    #[serde(default)]
    pub stack_inputs: Vec<String>,
    /// Indices of the input columns the model was trained on
    pub features: Option<Vec<usize>>,
    pub bagging: Option<BaggingInfo>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a candidate model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    Pending,
    Training,
    Trained,
    Failed { reason: String },
}

impl ModelStatus {
    pub fn is_trained(&self) -> bool {
        matches!(self, ModelStatus::Trained)
    }
}

/// A fitted model, either a single fit or the fold children of a bagged fit
#[derive(Debug)]
pub enum FittedModel {
    Single(Box<dyn TrainableModel>),
    Bagged(Vec<(String, Box<dyn TrainableModel>)>),
}

impl FittedModel {
    /// Prediction of the single model, or the mean over bagged children
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        match self {
            FittedModel::Single(model) => model.predict_proba(x),
            FittedModel::Bagged(children) => {
                let mut sum: Option<Array2<f64>> = None;
                for (_, child) in children {
                    let pred = child.predict_proba(x)?;
                    match sum.as_mut() {
                        None => sum = Some(pred),
                        Some(acc) => *acc += &pred,
                    }
                }
                let sum = sum.ok_or(KolosalError::ModelNotFitted)?;
                Ok(sum / children.len() as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::ParameterValue;

    fn problem() -> ProblemInfo {
        ProblemInfo {
            problem_type: ProblemType::Multiclass,
            num_classes: 3,
            quantile_levels: None,
            eval_metric: Scorer::Accuracy,
            random_seed: 0,
        }
    }

    #[test]
    fn test_output_width() {
        let mut p = problem();
        assert_eq!(p.output_width(), 3);
        p.problem_type = ProblemType::Quantile;
        p.quantile_levels = Some(vec![0.1, 0.9]);
        assert_eq!(p.output_width(), 2);
        p.problem_type = ProblemType::Binary;
        assert_eq!(p.output_width(), 1);
    }

    #[test]
    fn test_registry_templates() {
        let registry = ModelRegistry::with_builtin();
        assert_eq!(registry.families(), vec!["knn".to_string(), "linear".to_string()]);
        assert!(registry.get("gbm").is_err());

        let defaults = registry.templates(&BTreeMap::new(), &problem()).unwrap();
        assert_eq!(defaults.len(), 2);

        let mut hp = BTreeMap::new();
        hp.insert(
            "knn".to_string(),
            vec![
                Configuration::new().with("n_neighbors", ParameterValue::Int(3)),
                Configuration::new().with("n_neighbors", ParameterValue::Int(9)),
            ],
        );
        let templates = registry.templates(&hp, &problem()).unwrap();
        let names: Vec<_> = templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["knn_1", "knn_2"]);
        assert_eq!(templates[1].default_config().get_int("n_neighbors", 0), 9);
    }

    #[test]
    fn test_model_status_serde() {
        let failed = ModelStatus::Failed {
            reason: "boom".to_string(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("failed"));
        let back: ModelStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failed);
        assert!(!back.is_trained());
    }
}
