//! Multi-model trainer
//!
//! Fits every model template (optionally tuned through a scheduler and
//! searcher, optionally bagged and stacked), isolates failures per model,
//! and combines the survivors with greedy ensemble selection.

use super::bagging::fit_bagged;
use super::feature_prune::permutation_importance;
use super::models::{
    BaggingInfo, FitData, FittedModel, ModelFactory, ModelHandle, ModelRegistry, ModelStatus, ModelTemplate,
    ProblemInfo, TrainableModel,
};
use super::split::generate_train_test_split;
use super::{FitOptions, TrainerConfig};
use crate::ensemble::{EnsembleSelection, WeightedEnsemble};
use crate::error::{KolosalError, Result};
use crate::optimizer::{
    create_searcher, Configuration, Scheduler, Searcher, SearcherConfig, TrainingHistory, TrialStatus,
};
use crate::utils::{
    concat_columns, concat_rows, nan_to_neg_inf, neg_inf_as_null, neg_inf_history_as_null, neg_inf_map_as_null,
    select_columns, TimeBudget,
};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const TRAINER_FILE: &str = "trainer.json";
pub const MODEL_FILE: &str = "model.json";
pub const MODELS_DIR: &str = "models";

/// Labels that model scores and ensemble weights are computed against
pub const EQUAL_WEIGHTS_KEY: &str = "ensemble.equal_weights";
pub const OPTIMIZED_KEY: &str = "ensemble.optimized";

const FEATURE_PRUNE_HOLDOUT: f64 = 0.2;
const FEATURE_PRUNE_REPEATS: usize = 3;

/// Rows the trainer fits on. Without bagging `x_val`/`y_val` must be set.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub x_val: Option<Array2<f64>>,
    pub y_val: Option<Array1<f64>>,
    /// Models whose out-of-fold predictions follow the original columns of `x`
    pub stack_inputs: Vec<String>,
}

impl TrainingData {
    pub fn new(x: Array2<f64>, y: Array1<f64>) -> Self {
        Self {
            x,
            y,
            x_val: None,
            y_val: None,
            stack_inputs: Vec::new(),
        }
    }

    pub fn with_validation(mut self, x_val: Array2<f64>, y_val: Array1<f64>) -> Self {
        self.x_val = Some(x_val);
        self.y_val = Some(y_val);
        self
    }

    /// Labels matching the validation predictions: holdout labels, or the
    /// training labels when validation comes from out-of-fold predictions
    pub fn validation_labels(&self, bagged: bool) -> Result<&Array1<f64>> {
        if bagged {
            return Ok(&self.y);
        }
        self.y_val
            .as_ref()
            .ok_or_else(|| KolosalError::ValidationError("training without bagging needs validation data".to_string()))
    }
}

/// Outcome of one tuning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpoSummary {
    pub best_config: Configuration,
    #[serde(with = "neg_inf_as_null")]
    pub best_reward: f64,
    /// Reward per trial model name
    #[serde(with = "neg_inf_map_as_null")]
    pub trial_rewards: BTreeMap<String, f64>,
    #[serde(with = "neg_inf_history_as_null")]
    pub training_history: TrainingHistory,
    pub num_trials: usize,
    pub num_failed: usize,
    pub total_time_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// One row of [`Trainer::leaderboard`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub name: String,
    pub family: String,
    #[serde(with = "neg_inf_as_null")]
    pub val_score: f64,
    pub fit_time_secs: f64,
    pub stack_level: usize,
    pub ensemble_weight: f64,
}

/// A fitted model before it is registered with the trainer
#[derive(Debug)]
struct Candidate {
    handle: ModelHandle,
    model: FittedModel,
    val_pred: Array2<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrainerState {
    config: TrainerConfig,
    problem: ProblemInfo,
    model_names: Vec<String>,
    handles: Vec<ModelHandle>,
    levels: Vec<Vec<String>>,
    status: BTreeMap<String, ModelStatus>,
    #[serde(with = "neg_inf_map_as_null")]
    model_performance: BTreeMap<String, f64>,
    hpo_results: BTreeMap<String, HpoSummary>,
    ensemble: Option<WeightedEnsemble>,
    fit_time_secs: f64,
}

/// Name of a template's model at a stack level
fn level_name(name: &str, level: usize) -> String {
    if level == 0 {
        name.to_string()
    } else {
        format!("{}_L{}", name, level + 1)
    }
}

/// `name` when it is free, else the first free `name_2`, `name_3`, ...
fn free_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let mut k = 2;
    loop {
        let candidate = format!("{}_{}", name, k);
        if !taken(&candidate) {
            return candidate;
        }
        k += 1;
    }
}

fn dedup_preserving_order(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names.iter().filter(|n| seen.insert(n.as_str())).cloned().collect()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "model panicked".to_string()
    }
}

/// Trains, scores, ensembles and persists candidate models
pub struct Trainer {
    config: TrainerConfig,
    registry: ModelRegistry,
    problem: ProblemInfo,
    model_names: Vec<String>,
    handles: HashMap<String, ModelHandle>,
    models: HashMap<String, FittedModel>,
    /// Validation predictions (holdout or out-of-fold), not persisted
    val_predictions: HashMap<String, Array2<f64>>,
    /// Models trained at each stack level
    levels: Vec<Vec<String>>,
    status: BTreeMap<String, ModelStatus>,
    model_performance: BTreeMap<String, f64>,
    hpo_results: BTreeMap<String, HpoSummary>,
    ensemble: Option<WeightedEnsemble>,
    fit_time_secs: f64,
}

impl Trainer {
    pub fn new(config: TrainerConfig, registry: ModelRegistry) -> Result<Self> {
        config.validate()?;
        let problem = ProblemInfo {
            problem_type: config.problem_type,
            num_classes: if config.problem_type.is_classification() {
                config.num_classes.unwrap_or(2)
            } else {
                0
            },
            quantile_levels: config.quantile_levels.clone(),
            eval_metric: config.metric(),
            random_seed: config.random_seed,
        };
        Ok(Self {
            config,
            registry,
            problem,
            model_names: Vec::new(),
            handles: HashMap::new(),
            models: HashMap::new(),
            val_predictions: HashMap::new(),
            levels: Vec::new(),
            status: BTreeMap::new(),
            model_performance: BTreeMap::new(),
            hpo_results: BTreeMap::new(),
            ensemble: None,
            fit_time_secs: 0.0,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn problem(&self) -> &ProblemInfo {
        &self.problem
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Fit every template from `options.hyperparameters` (or every registered
    /// family) and build the ensemble.
    pub fn train(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        x_val: Option<&Array2<f64>>,
        y_val: Option<&Array1<f64>>,
        options: &FitOptions,
    ) -> Result<()> {
        let start = Instant::now();
        let budget = TimeBudget::new(options.time_limit);
        if budget.is_exhausted() {
            return Err(KolosalError::TimeBudgetExhausted {
                phase: "training".to_string(),
            });
        }
        if x.nrows() != y.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} labels", x.nrows()),
                actual: format!("{} labels", y.len()),
            });
        }

        let mut options = options.clone();
        if options.stack_levels > 0 && !options.is_bagging() {
            warn!(
                stack_levels = options.stack_levels,
                "Stacking requires bagging, disabling stack levels"
            );
            options.stack_levels = 0;
        }

        let data = match (x_val, y_val, options.is_bagging()) {
            (Some(xv), Some(yv), true) => {
                info!("Bagging is enabled, merging validation data into the training data");
                let x_all = concat_rows(&[x.view(), xv.view()])?;
                let mut y_all = y.to_vec();
                y_all.extend(yv.iter().copied());
                TrainingData::new(x_all, Array1::from_vec(y_all))
            }
            (_, _, true) => TrainingData::new(x.clone(), y.clone()),
            (Some(xv), Some(yv), false) => TrainingData::new(x.clone(), y.clone()).with_validation(xv.clone(), yv.clone()),
            (_, _, false) => {
                let (x_train, x_holdout, y_train, y_holdout) = generate_train_test_split(
                    x,
                    y,
                    self.problem.problem_type,
                    options.holdout_frac,
                    self.config.random_seed,
                )?;
                TrainingData::new(x_train, y_train).with_validation(x_holdout, y_holdout)
            }
        };

        let templates = self.registry.templates(&options.hyperparameters, &self.problem)?;
        info!(
            num_templates = templates.len(),
            rows = data.x.nrows(),
            features = data.x.ncols(),
            problem_type = %self.problem.problem_type,
            metric = %self.problem.eval_metric,
            "Beginning training"
        );
        self.train_multi_and_ensemble_with_budget(&templates, &data, &options, budget)?;
        self.fit_time_secs = start.elapsed().as_secs_f64();
        info!(elapsed_secs = self.fit_time_secs, "Training complete");
        Ok(())
    }

    /// Fit `templates`, then score the equal-weight and optimized ensembles.
    /// A failing model is logged and dropped; only zero survivors is an error.
    pub fn train_multi_and_ensemble(
        &mut self,
        templates: &[ModelTemplate],
        data: &TrainingData,
        options: &FitOptions,
    ) -> Result<&WeightedEnsemble> {
        let budget = TimeBudget::new(options.time_limit);
        self.train_multi_and_ensemble_with_budget(templates, data, options, budget)
    }

    fn train_multi_and_ensemble_with_budget(
        &mut self,
        templates: &[ModelTemplate],
        data: &TrainingData,
        options: &FitOptions,
        budget: TimeBudget,
    ) -> Result<&WeightedEnsemble> {
        let names = self.train_multi_with_budget(templates, data, options, budget)?;
        if names.is_empty() {
            return Err(KolosalError::NoModelsTrained);
        }
        let y_val = data.validation_labels(options.is_bagging())?.clone();

        for name in &names {
            if let Some(handle) = self.handles.get(name) {
                info!(model = %name, val_score = handle.val_score, "Validation score");
            }
        }

        let voting = WeightedEnsemble::equal_weights(names.clone(), self.problem.problem_type)?;
        let voting_score = self.score_validation(&voting, &y_val)?;
        info!(score = voting_score, "Score of equal-weight ensemble");
        self.model_performance.insert(EQUAL_WEIGHTS_KEY.to_string(), voting_score);

        let ensemble_time = budget.remaining_secs();
        let ensemble = match ensemble_time {
            Some(t) if t <= 0.0 => {
                let err = KolosalError::TimeBudgetExhausted {
                    phase: "ensemble selection".to_string(),
                };
                warn!(error = %err, "Using the best single model as the ensemble");
                self.best_single_ensemble(&names)?
            }
            _ => self.compute_optimal_ensemble_weights(&names, &y_val, ensemble_time)?,
        };
        let optimized_score = self.score_validation(&ensemble, &y_val)?;
        info!(
            score = optimized_score,
            members = ?ensemble.members().collect::<Vec<_>>(),
            "Score of optimized ensemble"
        );
        self.model_performance.insert(OPTIMIZED_KEY.to_string(), optimized_score);
        self.ensemble = Some(ensemble);

        if let Some(path) = self.config.path.clone() {
            self.save_state(&path)?;
        }
        self.ensemble.as_ref().ok_or(KolosalError::ModelNotFitted)
    }

    /// Fit all templates at every stack level. Returns the trained model
    /// names, deduplicated with first-seen order preserved.
    pub fn train_multi(
        &mut self,
        templates: &[ModelTemplate],
        data: &TrainingData,
        options: &FitOptions,
    ) -> Result<Vec<String>> {
        let budget = TimeBudget::new(options.time_limit);
        self.train_multi_with_budget(templates, data, options, budget)
    }

    fn train_multi_with_budget(
        &mut self,
        templates: &[ModelTemplate],
        data: &TrainingData,
        options: &FitOptions,
        budget: TimeBudget,
    ) -> Result<Vec<String>> {
        let num_levels = if options.is_bagging() { options.stack_levels + 1 } else { 1 };
        let total_phases = templates.len() * num_levels;
        let reserved = budget
            .limit_secs()
            .map(|limit| limit * self.config.ensemble_time_fraction)
            .unwrap_or(0.0);

        let mut phase = 0;
        let mut trained_names = Vec::new();
        let mut run_levels: Vec<Vec<String>> = Vec::with_capacity(num_levels);
        let mut level_data = data.clone();
        for level in 0..num_levels {
            if level > 0 {
                let previous = run_levels.get(level - 1).cloned().unwrap_or_default();
                if previous.is_empty() {
                    warn!(level, "No models at the previous level, stopping stacking");
                    break;
                }
                level_data = self.stack_training_data(data, &previous)?;
            }
            let mut level_names = Vec::new();
            for template in templates {
                let name = self.unique_name(&level_name(&template.name, level));
                let time_limit = budget
                    .remaining_secs()
                    .map(|remaining| (remaining - reserved) / (total_phases - phase) as f64);
                phase += 1;
                if let Some(t) = time_limit {
                    if t <= 0.0 {
                        let err = KolosalError::TimeBudgetExhausted {
                            phase: format!("model {}", name),
                        };
                        warn!(model = %name, error = %err, "Skipping model, no time left");
                        self.status.insert(
                            name,
                            ModelStatus::Failed {
                                reason: err.to_string(),
                            },
                        );
                        continue;
                    }
                }
                level_names.extend(self.train_single_full(template, &level_data, options, level, time_limit));
            }
            let level_names = dedup_preserving_order(&level_names);
            trained_names.extend(level_names.iter().cloned());
            run_levels.push(level_names.clone());
            if self.levels.len() <= level {
                self.levels.resize(level + 1, Vec::new());
            }
            self.levels[level].extend(level_names);
            self.levels[level] = dedup_preserving_order(&self.levels[level]);
        }

        self.model_names.extend(trained_names.iter().cloned());
        self.model_names = dedup_preserving_order(&self.model_names);
        Ok(dedup_preserving_order(&trained_names))
    }

    /// Original features plus the previous level's out-of-fold predictions
    fn stack_training_data(&self, data: &TrainingData, previous: &[String]) -> Result<TrainingData> {
        let mut parts = vec![data.x.view()];
        for name in previous {
            let pred = self
                .val_predictions
                .get(name)
                .ok_or_else(|| KolosalError::ModelNotFound(name.clone()))?;
            parts.push(pred.view());
        }
        let mut stacked = TrainingData::new(concat_columns(&parts)?, data.y.clone());
        stacked.stack_inputs = previous.to_vec();
        Ok(stacked)
    }

    /// Fit one template, with optional feature pruning and tuning. Returns
    /// the names of the models it produced; failures are logged, not raised.
    pub fn train_single_full(
        &mut self,
        template: &ModelTemplate,
        data: &TrainingData,
        options: &FitOptions,
        level: usize,
        time_limit: Option<f64>,
    ) -> Vec<String> {
        let name = self.unique_name(&level_name(&template.name, level));
        let phase_budget = TimeBudget::new(time_limit);

        let features = if options.feature_prune {
            match self.prune_features(template, data) {
                Ok(features) => features,
                Err(e) => {
                    warn!(model = %name, error = %e, "Feature pruning failed, keeping all features");
                    None
                }
            }
        } else {
            None
        };

        if options.hyperparameter_tune && !template.search_space.is_fixed() {
            match self.hyperparameter_tune(template, data, features.as_deref(), options, level, phase_budget.remaining_secs()) {
                Ok(names) => {
                    self.status.insert(name, ModelStatus::Trained);
                    names
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "Hyperparameter tuning failed, skipping model");
                    self.status.insert(name, ModelStatus::Failed { reason: e.to_string() });
                    Vec::new()
                }
            }
        } else {
            let config = template.default_config();
            self.train_and_save(
                &name,
                &template.factory,
                &config,
                data,
                features.as_deref(),
                options,
                level,
                phase_budget.remaining_secs(),
            )
            .into_iter()
            .collect()
        }
    }

    /// Fit and register one model. Returns its name, or `None` if it failed.
    #[allow(clippy::too_many_arguments)]
    pub fn train_and_save(
        &mut self,
        name: &str,
        factory: &Arc<dyn ModelFactory>,
        config: &Configuration,
        data: &TrainingData,
        features: Option<&[usize]>,
        options: &FitOptions,
        level: usize,
        time_limit: Option<f64>,
    ) -> Option<String> {
        let name = self.unique_name(name);
        let name = name.as_str();
        info!(model = %name, "Fitting model");
        self.status.insert(name.to_string(), ModelStatus::Training);
        let result = self
            .fit_candidate(name, factory, config, data, features, options, level, time_limit)
            .and_then(|candidate| self.register_candidate(candidate, level));
        match result {
            Ok(registered) => Some(registered),
            Err(e) => {
                warn!(model = %name, error = %e, "Model failed during training, skipping");
                self.status.insert(name.to_string(), ModelStatus::Failed { reason: e.to_string() });
                None
            }
        }
    }

    /// Fit without touching trainer state. Panics inside a model are
    /// converted to [`KolosalError::ModelTrainingFailure`].
    #[allow(clippy::too_many_arguments)]
    fn fit_candidate(
        &self,
        name: &str,
        factory: &Arc<dyn ModelFactory>,
        config: &Configuration,
        data: &TrainingData,
        features: Option<&[usize]>,
        options: &FitOptions,
        level: usize,
        time_limit: Option<f64>,
    ) -> Result<Candidate> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.fit_candidate_inner(name, factory, config, data, features, options, level, time_limit)
        }));
        match outcome {
            Ok(result) => result.map_err(|e| match e {
                KolosalError::ModelTrainingFailure { .. } => e,
                other => KolosalError::ModelTrainingFailure {
                    model: name.to_string(),
                    reason: other.to_string(),
                },
            }),
            Err(payload) => Err(KolosalError::ModelTrainingFailure {
                model: name.to_string(),
                reason: panic_message(payload),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_candidate_inner(
        &self,
        name: &str,
        factory: &Arc<dyn ModelFactory>,
        config: &Configuration,
        data: &TrainingData,
        features: Option<&[usize]>,
        options: &FitOptions,
        level: usize,
        time_limit: Option<f64>,
    ) -> Result<Candidate> {
        let start = Instant::now();
        let x = match features {
            Some(cols) => select_columns(&data.x, cols)?,
            None => data.x.clone(),
        };

        let (model, val_pred, y_val, bagging) = if options.is_bagging() {
            let fit = fit_bagged(
                factory.as_ref(),
                config,
                &self.problem,
                &x,
                &data.y,
                options.num_bagging_folds,
                options.num_bagging_sets,
                TimeBudget::new(time_limit),
            )?;
            let bagging = BaggingInfo {
                num_folds: fit.num_folds,
                num_sets: fit.num_sets_completed,
                children: fit.child_names(),
            };
            (FittedModel::Bagged(fit.children), fit.oof, &data.y, Some(bagging))
        } else {
            let (x_val, y_val) = match (&data.x_val, &data.y_val) {
                (Some(xv), Some(yv)) => (xv, yv),
                _ => {
                    return Err(KolosalError::ValidationError(
                        "training without bagging needs validation data".to_string(),
                    ))
                }
            };
            let x_val = match features {
                Some(cols) => select_columns(x_val, cols)?,
                None => x_val.clone(),
            };
            let mut model = factory.build(config, &self.problem)?;
            let fit_data = FitData::new(&x, &data.y)
                .with_validation(&x_val, y_val)
                .with_time_limit(time_limit);
            model.fit(&fit_data)?;
            let val_pred = model.predict_proba(&x_val)?;
            (FittedModel::Single(model), val_pred, y_val, None)
        };

        let val_score = nan_to_neg_inf(self.problem.score(y_val, &val_pred)?);
        let fit_time_secs = start.elapsed().as_secs_f64();
        debug!(model = %name, val_score, fit_time_secs, "Fitted candidate");
        let handle = ModelHandle {
            name: name.to_string(),
            family: factory.family().to_string(),
            hyperparameters: config.clone(),
            path: self.config.path.as_ref().map(|p| p.join(MODELS_DIR).join(name)),
            val_score,
            fit_time_secs,
            stack_level: level,
            stack_inputs: data.stack_inputs.clone(),
            features: features.map(<[usize]>::to_vec),
            bagging,
            created_at: Utc::now(),
        };
        Ok(Candidate {
            handle,
            model,
            val_pred,
        })
    }

    /// `name`, suffixed when a model or a status entry from an earlier run
    /// already uses it
    fn unique_name(&self, name: &str) -> String {
        free_name(name, |n| self.handles.contains_key(n) || self.status.contains_key(n))
    }

    /// Register a fitted model. A name already held by a registered model is
    /// never reused; the newcomer gets the next free `_{k}` suffix instead.
    fn register_candidate(&mut self, candidate: Candidate, level: usize) -> Result<String> {
        let Candidate {
            mut handle,
            model,
            val_pred,
        } = candidate;
        if self.handles.contains_key(&handle.name) {
            let renamed = free_name(&handle.name, |n| self.handles.contains_key(n));
            debug!(model = %handle.name, renamed = %renamed, "Model name already registered");
            handle.path = self.config.path.as_ref().map(|p| p.join(MODELS_DIR).join(&renamed));
            handle.name = renamed;
        }
        if let Some(dir) = &handle.path {
            write_model(dir, &model)?;
        }
        let name = handle.name.clone();
        info!(model = %name, val_score = handle.val_score, level, "Model trained");
        self.model_performance.insert(name.clone(), handle.val_score);
        self.status.insert(name.clone(), ModelStatus::Trained);
        self.val_predictions.insert(name.clone(), val_pred);
        self.models.insert(name.clone(), model);
        self.handles.insert(name.clone(), handle);
        Ok(name)
    }

    fn prune_features(&self, template: &ModelTemplate, data: &TrainingData) -> Result<Option<Vec<usize>>> {
        let (x_train, x_test, y_train, y_test) = generate_train_test_split(
            &data.x,
            &data.y,
            self.problem.problem_type,
            FEATURE_PRUNE_HOLDOUT,
            self.config.random_seed,
        )?;
        let mut model = template.factory.build(&template.default_config(), &self.problem)?;
        model.fit(&FitData::new(&x_train, &y_train).with_validation(&x_test, &y_test))?;
        let importance = permutation_importance(
            model.as_ref(),
            &self.problem,
            &x_test,
            &y_test,
            FEATURE_PRUNE_REPEATS,
            self.config.random_seed,
        )?;
        let selected = importance.selected_indices();
        if selected.len() == data.x.ncols() {
            return Ok(None);
        }
        info!(
            model = %template.name,
            kept = selected.len(),
            total = data.x.ncols(),
            "Pruned features"
        );
        Ok(Some(selected))
    }

    /// Tune a template with a scheduler driving a fresh searcher. Every
    /// trial model becomes a candidate named `{name}_trial_{id}`.
    pub fn hyperparameter_tune(
        &mut self,
        template: &ModelTemplate,
        data: &TrainingData,
        features: Option<&[usize]>,
        options: &FitOptions,
        level: usize,
        time_limit: Option<f64>,
    ) -> Result<Vec<String>> {
        let base_name = self.unique_name(&level_name(&template.name, level));
        let searcher: Arc<dyn Searcher> = Arc::from(create_searcher(
            options.searcher,
            template.search_space.clone(),
            SearcherConfig::default().with_seed(self.config.random_seed),
        ));
        let mut scheduler_config = options.scheduler.clone();
        if let Some(t) = time_limit {
            let limit = scheduler_config.time_limit.map_or(t, |own| own.min(t));
            scheduler_config = scheduler_config.with_time_limit(limit);
        }
        let scheduler = Scheduler::new(searcher, scheduler_config);
        info!(model = %base_name, num_trials = scheduler.config().num_trials, "Beginning hyperparameter tuning");

        let trained: Mutex<Vec<(usize, Candidate)>> = Mutex::new(Vec::new());
        let summary = {
            let this = &*self;
            scheduler.run(|request, reporter| {
                let name = format!("{}_trial_{}", base_name, request.trial_id);
                let candidate = this.fit_candidate(
                    &name,
                    &template.factory,
                    &request.config,
                    data,
                    features,
                    options,
                    level,
                    request.time_limit,
                )?;
                let reward = candidate.handle.val_score;
                trained.lock().push((request.trial_id, candidate));
                reporter.report_reward(reward, Some(1.0))?;
                Ok(())
            })?
        };

        let mut trained = trained.into_inner();
        trained.sort_by_key(|(trial_id, _)| *trial_id);
        let mut names = Vec::with_capacity(trained.len());
        let mut trial_rewards = BTreeMap::new();
        for (_, candidate) in trained {
            let name = candidate.handle.name.clone();
            let reward = candidate.handle.val_score;
            match self.register_candidate(candidate, level) {
                Ok(registered) => {
                    trial_rewards.insert(registered.clone(), reward);
                    names.push(registered);
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "Could not save trial model, skipping");
                    self.status.insert(name, ModelStatus::Failed { reason: e.to_string() });
                }
            }
        }
        for outcome in &summary.trials {
            if let TrialStatus::Failed(reason) = &outcome.status {
                let name = format!("{}_trial_{}", base_name, outcome.trial_id);
                self.status.insert(name, ModelStatus::Failed { reason: reason.clone() });
            }
        }

        info!(
            model = %base_name,
            best_reward = summary.best_reward,
            best_config = %summary.best_config,
            trials = summary.num_trials,
            failed = summary.num_failed,
            "Hyperparameter tuning finished"
        );
        self.hpo_results.insert(
            base_name.clone(),
            HpoSummary {
                best_config: summary.best_config,
                best_reward: summary.best_reward,
                trial_rewards,
                training_history: summary.training_history,
                num_trials: summary.num_trials,
                num_failed: summary.num_failed,
                total_time_secs: summary.total_time_secs,
                created_at: Utc::now(),
            },
        );

        if names.is_empty() {
            return Err(KolosalError::ModelTrainingFailure {
                model: base_name,
                reason: "no tuning trial produced a model".to_string(),
            });
        }
        Ok(names)
    }

    /// Greedy ensemble selection over the stored validation predictions of `names`
    pub fn compute_optimal_ensemble_weights(
        &self,
        names: &[String],
        y_val: &Array1<f64>,
        time_limit: Option<f64>,
    ) -> Result<WeightedEnsemble> {
        let predictions = self.validation_predictions(names)?;
        let mut selection = EnsembleSelection::new(
            self.config.ensemble_size,
            self.problem.problem_type,
            self.problem.eval_metric,
            self.config.ensemble.clone(),
        )?;
        selection.fit(&predictions, y_val, time_limit, None)?;
        WeightedEnsemble::from_selection(names.to_vec(), &selection)
    }

    fn best_single_ensemble(&self, names: &[String]) -> Result<WeightedEnsemble> {
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, name) in names.iter().enumerate() {
            let score = self.handles.get(name).map(|h| h.val_score).unwrap_or(f64::NEG_INFINITY);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        WeightedEnsemble::best_single(names.to_vec(), best, self.problem.problem_type)
    }

    fn validation_predictions(&self, names: &[String]) -> Result<Vec<Array2<f64>>> {
        names
            .iter()
            .map(|name| {
                self.val_predictions.get(name).cloned().ok_or_else(|| {
                    KolosalError::ModelNotFound(format!("no validation predictions for '{}'", name))
                })
            })
            .collect()
    }

    fn score_validation(&self, ensemble: &WeightedEnsemble, y_val: &Array1<f64>) -> Result<f64> {
        let predictions = self.validation_predictions(&ensemble.model_names)?;
        let proba = ensemble.combine(&predictions)?;
        let score = self.problem.eval_metric.score_proba(
            y_val,
            &proba,
            self.problem.problem_type,
            ensemble.decision_threshold,
            None,
            self.problem.quantile_levels.as_deref(),
        )?;
        Ok(nan_to_neg_inf(score))
    }

    /// Predictions of one model, computing lower stack levels as needed
    pub fn predict_proba_model(&self, name: &str, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut cache = HashMap::new();
        self.predict_cached(name, x, &mut cache)
    }

    fn predict_cached(
        &self,
        name: &str,
        x: &Array2<f64>,
        cache: &mut HashMap<String, Array2<f64>>,
    ) -> Result<Array2<f64>> {
        if let Some(pred) = cache.get(name) {
            return Ok(pred.clone());
        }
        let handle = self
            .handles
            .get(name)
            .ok_or_else(|| KolosalError::ModelNotFound(name.to_string()))?;
        let model = self
            .models
            .get(name)
            .ok_or_else(|| KolosalError::ModelNotFound(name.to_string()))?;

        let mut input = if handle.stack_level == 0 {
            x.clone()
        } else {
            let mut parts = Vec::with_capacity(handle.stack_inputs.len());
            for input_name in &handle.stack_inputs {
                parts.push(self.predict_cached(input_name, x, cache)?);
            }
            let mut views = vec![x.view()];
            views.extend(parts.iter().map(|p| p.view()));
            concat_columns(&views)?
        };
        if let Some(cols) = &handle.features {
            input = select_columns(&input, cols)?;
        }
        let pred = model.predict_proba(&input)?;
        cache.insert(name.to_string(), pred.clone());
        Ok(pred)
    }

    /// Weighted ensemble probabilities (values for regression, quantiles for quantile problems)
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let ensemble = self.ensemble.as_ref().ok_or(KolosalError::ModelNotFitted)?;
        let mut cache = HashMap::new();
        let mut member_preds = Vec::new();
        for (name, _) in ensemble.members() {
            member_preds.push(self.predict_cached(name, x, &mut cache)?);
        }
        ensemble.combine_members(&member_preds)
    }

    /// Hard predictions: class index, regression value or quantiles
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let ensemble = self.ensemble.as_ref().ok_or(KolosalError::ModelNotFitted)?;
        let proba = self.predict_proba(x)?;
        Ok(ensemble.predict_from_proba(&proba))
    }

    /// Evaluation metric of the ensemble on labelled data
    pub fn score(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<f64> {
        let ensemble = self.ensemble.as_ref().ok_or(KolosalError::ModelNotFitted)?;
        let proba = self.predict_proba(x)?;
        self.problem.eval_metric.score_proba(
            y,
            &proba,
            self.problem.problem_type,
            ensemble.decision_threshold,
            None,
            self.problem.quantile_levels.as_deref(),
        )
    }

    /// Trained models by validation score, best first
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = self
            .model_names
            .iter()
            .filter_map(|name| self.handles.get(name))
            .map(|handle| LeaderboardEntry {
                name: handle.name.clone(),
                family: handle.family.clone(),
                val_score: handle.val_score,
                fit_time_secs: handle.fit_time_secs,
                stack_level: handle.stack_level,
                ensemble_weight: self.ensemble.as_ref().map(|e| e.weight_of(&handle.name)).unwrap_or(0.0),
            })
            .collect();
        entries.sort_by(|a, b| b.val_score.total_cmp(&a.val_score));
        entries
    }

    pub fn model_status(&self, name: &str) -> Option<&ModelStatus> {
        self.status.get(name)
    }

    pub fn model_names(&self) -> &[String] {
        &self.model_names
    }

    pub fn model_handle(&self, name: &str) -> Option<&ModelHandle> {
        self.handles.get(name)
    }

    pub fn model_performance(&self) -> &BTreeMap<String, f64> {
        &self.model_performance
    }

    pub fn hpo_results(&self) -> &BTreeMap<String, HpoSummary> {
        &self.hpo_results
    }

    pub fn ensemble(&self) -> Option<&WeightedEnsemble> {
        self.ensemble.as_ref()
    }

    pub fn fit_time_secs(&self) -> f64 {
        self.fit_time_secs
    }

    /// Write `trainer.json` and every model under `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        for name in &self.model_names {
            let model = self
                .models
                .get(name)
                .ok_or_else(|| KolosalError::ModelNotFound(name.clone()))?;
            write_model(&dir.join(MODELS_DIR).join(name), model)?;
        }
        self.save_state(dir)
    }

    fn save_state(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut handles: Vec<ModelHandle> = self
            .model_names
            .iter()
            .filter_map(|name| self.handles.get(name).cloned())
            .collect();
        for handle in &mut handles {
            handle.path = Some(dir.join(MODELS_DIR).join(&handle.name));
        }
        let state = TrainerState {
            config: self.config.clone(),
            problem: self.problem.clone(),
            model_names: self.model_names.clone(),
            handles,
            levels: self.levels.clone(),
            status: self.status.clone(),
            model_performance: self.model_performance.clone(),
            hpo_results: self.hpo_results.clone(),
            ensemble: self.ensemble.clone(),
            fit_time_secs: self.fit_time_secs,
        };
        fs::write(dir.join(TRAINER_FILE), serde_json::to_vec_pretty(&state)?)?;
        debug!(path = %dir.display(), "Saved trainer");
        Ok(())
    }

    /// Restore a trainer saved with [`Trainer::save`], ready for prediction
    pub fn load(dir: impl AsRef<Path>, registry: ModelRegistry) -> Result<Self> {
        let dir = dir.as_ref();
        let bytes = fs::read(dir.join(TRAINER_FILE))?;
        let state: TrainerState = serde_json::from_slice(&bytes)?;

        let mut models = HashMap::new();
        let mut handles = HashMap::new();
        for handle in state.handles {
            let factory = registry.get(&handle.family)?;
            let model_dir = dir.join(MODELS_DIR).join(&handle.name);
            let model = read_model(&model_dir, factory.as_ref(), handle.bagging.as_ref())?;
            models.insert(handle.name.clone(), model);
            handles.insert(handle.name.clone(), handle);
        }
        info!(path = %dir.display(), models = models.len(), "Loaded trainer");
        Ok(Self {
            config: state.config,
            registry,
            problem: state.problem,
            model_names: state.model_names,
            handles,
            models,
            val_predictions: HashMap::new(),
            levels: state.levels,
            status: state.status,
            model_performance: state.model_performance,
            hpo_results: state.hpo_results,
            ensemble: state.ensemble,
            fit_time_secs: state.fit_time_secs,
        })
    }
}

fn write_model(dir: &Path, model: &FittedModel) -> Result<()> {
    match model {
        FittedModel::Single(m) => write_model_file(dir, m.as_ref()),
        FittedModel::Bagged(children) => {
            for (child, m) in children {
                write_model_file(&dir.join(child), m.as_ref())?;
            }
            Ok(())
        }
    }
}

fn write_model_file(dir: &Path, model: &dyn TrainableModel) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(MODEL_FILE), model.to_bytes()?)?;
    Ok(())
}

fn read_model(dir: &Path, factory: &dyn ModelFactory, bagging: Option<&BaggingInfo>) -> Result<FittedModel> {
    match bagging {
        None => Ok(FittedModel::Single(factory.load(&fs::read(dir.join(MODEL_FILE))?)?)),
        Some(info) => {
            let mut children = Vec::with_capacity(info.children.len());
            for child in &info.children {
                let path: PathBuf = dir.join(child).join(MODEL_FILE);
                children.push((child.clone(), factory.load(&fs::read(path)?)?));
            }
            Ok(FittedModel::Bagged(children))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Scorer;
    use crate::optimizer::SearchSpace;
    use crate::training::ProblemType;
    use ndarray::Array1;

    /// Always fails to fit
    #[derive(Debug)]
    struct BrokenModel;

    impl TrainableModel for BrokenModel {
        fn family(&self) -> &'static str {
            "broken"
        }
        fn fit(&mut self, _data: &FitData<'_>) -> Result<()> {
            Err(KolosalError::TrainingError("diverged".to_string()))
        }
        fn predict_proba(&self, _x: &Array2<f64>) -> Result<Array2<f64>> {
            Err(KolosalError::ModelNotFitted)
        }
        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct BrokenFactory;

    impl ModelFactory for BrokenFactory {
        fn family(&self) -> &'static str {
            "broken"
        }
        fn default_search_space(&self, _problem: &ProblemInfo) -> SearchSpace {
            SearchSpace::new()
        }
        fn build(&self, _config: &Configuration, _problem: &ProblemInfo) -> Result<Box<dyn TrainableModel>> {
            Ok(Box::new(BrokenModel))
        }
        fn load(&self, _bytes: &[u8]) -> Result<Box<dyn TrainableModel>> {
            Ok(Box::new(BrokenModel))
        }
    }

    fn regression_data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| (i as f64) * if j == 0 { 1.0 } else { 0.5 });
        let y = Array1::from_shape_fn(40, |i| 2.0 * i as f64 + 1.0);
        (x, y)
    }

    #[test]
    fn test_level_name_and_dedup() {
        assert_eq!(level_name("knn", 0), "knn");
        assert_eq!(level_name("knn", 1), "knn_L2");
        let names = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedup_preserving_order(&names), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_train_regression_builds_ensemble() {
        let (x, y) = regression_data();
        let config = TrainerConfig::new(ProblemType::Regression).with_eval_metric(Scorer::RootMeanSquaredError);
        let mut trainer = Trainer::new(config, ModelRegistry::with_builtin()).unwrap();
        trainer.train(&x, &y, None, None, &FitOptions::default()).unwrap();

        assert_eq!(trainer.model_names().len(), 2);
        let ensemble = trainer.ensemble().unwrap();
        assert!((ensemble.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(trainer.model_performance().contains_key(EQUAL_WEIGHTS_KEY));
        assert!(trainer.model_performance().contains_key(OPTIMIZED_KEY));
        assert_eq!(trainer.predict(&x).unwrap().nrows(), 40);
        assert_eq!(trainer.leaderboard().len(), 2);
    }

    #[test]
    fn test_failed_model_is_dropped() {
        let (x, y) = regression_data();
        let mut registry = ModelRegistry::with_builtin();
        registry.register(Arc::new(BrokenFactory));
        let config = TrainerConfig::new(ProblemType::Regression);
        let mut trainer = Trainer::new(config, registry).unwrap();
        trainer.train(&x, &y, None, None, &FitOptions::default()).unwrap();

        assert!(!trainer.model_names().contains(&"broken".to_string()));
        assert!(matches!(trainer.model_status("broken"), Some(ModelStatus::Failed { .. })));
        assert_eq!(trainer.ensemble().unwrap().weight_of("broken"), 0.0);
    }

    #[test]
    fn test_all_models_failing_is_fatal() {
        let (x, y) = regression_data();
        let mut registry = ModelRegistry::new();
        registry.register(Arc::new(BrokenFactory));
        let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), registry).unwrap();
        let err = trainer.train(&x, &y, None, None, &FitOptions::default()).unwrap_err();
        assert!(matches!(err, KolosalError::NoModelsTrained));
    }

    #[test]
    fn test_stacking_without_bagging_is_disabled() {
        let (x, y) = regression_data();
        let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
        let options = FitOptions::default().with_stack_levels(2);
        trainer.train(&x, &y, None, None, &options).unwrap();
        assert!(trainer.model_names().iter().all(|n| !n.ends_with("_L2")));
    }

    #[test]
    fn test_zero_time_limit_fails_fast() {
        let (x, y) = regression_data();
        let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
        let options = FitOptions::default().with_time_limit(0.0);
        let err = trainer.train(&x, &y, None, None, &options).unwrap_err();
        assert!(matches!(err, KolosalError::TimeBudgetExhausted { .. }));
    }

    #[test]
    fn test_infinite_time_limit_is_unlimited() {
        let (x, y) = regression_data();
        let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
        let options = FitOptions::default().with_time_limit(f64::INFINITY);
        trainer.train(&x, &y, None, None, &options).unwrap();
        assert_eq!(trainer.model_names().len(), 2);
        assert!(trainer.model_names().iter().all(|n| trainer.model_status(n) == Some(&ModelStatus::Trained)));
    }

    #[test]
    fn test_free_name_skips_taken_suffixes() {
        let taken = |n: &str| n == "knn" || n == "knn_2";
        assert_eq!(free_name("linear", taken), "linear");
        assert_eq!(free_name("knn", taken), "knn_3");
    }

    #[test]
    fn test_retrain_never_replaces_a_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (x, y) = regression_data();
        let config = TrainerConfig::new(ProblemType::Regression).with_path(dir.path());
        let mut trainer = Trainer::new(config, ModelRegistry::with_builtin()).unwrap();
        trainer.train(&x, &y, None, None, &FitOptions::default()).unwrap();
        let first = trainer.model_handle("knn").unwrap().clone();

        let options = FitOptions::default().with_bagging(3, 1).with_stack_levels(1);
        trainer.train(&x, &y, None, None, &options).unwrap();

        assert_eq!(
            trainer.model_names(),
            &["knn", "linear", "knn_2", "linear_2", "knn_L2", "linear_L2"]
        );
        assert_eq!(trainer.model_handle("knn"), Some(&first));
        assert!(first.bagging.is_none());
        let retrained = trainer.model_handle("knn_2").unwrap();
        assert!(retrained.bagging.is_some());
        assert_eq!(retrained.path, Some(dir.path().join(MODELS_DIR).join("knn_2")));
        assert_eq!(trainer.model_handle("linear_L2").unwrap().stack_inputs, vec!["knn_2", "linear_2"]);
        assert!(dir.path().join(MODELS_DIR).join("knn").join(MODEL_FILE).exists());
        assert!(dir.path().join(MODELS_DIR).join("knn_2").join("S1F1").join(MODEL_FILE).exists());

        // Only the latest run's models are ensembled
        let ensemble = trainer.ensemble().unwrap();
        assert!(ensemble.model_names.iter().all(|n| n != "knn" && n != "linear"));
        assert_eq!(trainer.predict(&x).unwrap().nrows(), 40);

        let loaded = Trainer::load(dir.path(), ModelRegistry::with_builtin()).unwrap();
        assert_eq!(loaded.model_handle("knn"), Some(&first));
        assert_eq!(loaded.predict(&x).unwrap(), trainer.predict(&x).unwrap());
    }

    #[test]
    fn test_predict_before_training() {
        let trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
        assert!(matches!(trainer.predict(&Array2::zeros((1, 2))), Err(KolosalError::ModelNotFitted)));
    }
}
