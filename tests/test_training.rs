//! Integration tests for the learner and trainer: tuning, bagging, stacking,
//! failure isolation, ensembling and persistence

use kolosal_tabular::ensemble::{CalibrationMode, EnsembleSelectionConfig};
use kolosal_tabular::error::{KolosalError, Result};
use kolosal_tabular::metrics::Scorer;
use kolosal_tabular::optimizer::{Configuration, ParameterValue, SearchSpace, SearcherType};
use kolosal_tabular::training::{
    adjust_threshold_if_necessary, FitData, FitOptions, Learner, LearnerConfig, ModelFactory, ModelRegistry,
    ModelStatus, ProblemInfo, ProblemType, TrainableModel, Trainer, TrainerConfig, EQUAL_WEIGHTS_KEY, OPTIMIZED_KEY,
};
use ndarray::{Array1, Array2};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Fixtures
// ============================================================================

/// Route trainer logs to the test output; set `RUST_LOG=debug` to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn regression_data(n: usize) -> (Array2<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((n, 3), |(i, j)| match j {
        0 => i as f64 / n as f64,
        1 => ((i * 37) % 11) as f64 / 11.0,
        _ => ((i * 13) % 7) as f64,
    });
    let y = Array1::from_shape_fn(n, |i| 4.0 * x[[i, 0]] - 2.0 * x[[i, 1]] + 1.0);
    (x, y)
}

/// Three well-separated blobs along a diagonal, labels 0, 1, 2
fn blob_data(per_class: usize) -> (Array2<f64>, Array1<f64>) {
    let n = per_class * 3;
    let x = Array2::from_shape_fn((n, 2), |(i, j)| {
        let class = (i % 3) as f64;
        let jitter = ((i * 7 + j * 3) % 10) as f64 * 0.05;
        class * 3.0 + jitter
    });
    let y = Array1::from_shape_fn(n, |i| (i % 3) as f64);
    (x, y)
}

/// Panics while fitting, standing in for a crashing third-party model
#[derive(Debug)]
struct PanickingModel;

impl TrainableModel for PanickingModel {
    fn family(&self) -> &'static str {
        "panicking"
    }
    fn fit(&mut self, _data: &FitData<'_>) -> Result<()> {
        panic!("native library crashed")
    }
    fn predict_proba(&self, _x: &Array2<f64>) -> Result<Array2<f64>> {
        Err(KolosalError::ModelNotFitted)
    }
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

struct PanickingFactory;

impl ModelFactory for PanickingFactory {
    fn family(&self) -> &'static str {
        "panicking"
    }
    fn default_search_space(&self, _problem: &ProblemInfo) -> SearchSpace {
        SearchSpace::new()
    }
    fn build(&self, _config: &Configuration, _problem: &ProblemInfo) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(PanickingModel))
    }
    fn load(&self, _bytes: &[u8]) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(PanickingModel))
    }
}

/// Fits fine but predicts NaN everywhere, so its validation score is undefined
#[derive(Debug)]
struct NanModel;

impl TrainableModel for NanModel {
    fn family(&self) -> &'static str {
        "nan"
    }
    fn fit(&mut self, _data: &FitData<'_>) -> Result<()> {
        Ok(())
    }
    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(Array2::from_elem((x.nrows(), 1), f64::NAN))
    }
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(b"{}".to_vec())
    }
}

struct NanFactory;

impl ModelFactory for NanFactory {
    fn family(&self) -> &'static str {
        "nan"
    }
    fn default_search_space(&self, _problem: &ProblemInfo) -> SearchSpace {
        SearchSpace::new()
    }
    fn build(&self, _config: &Configuration, _problem: &ProblemInfo) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(NanModel))
    }
    fn load(&self, _bytes: &[u8]) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(NanModel))
    }
}

// ============================================================================
// Trainer
// ============================================================================

#[test]
fn test_bagged_stack_trains_two_levels() {
    init_tracing();
    let (x, y) = regression_data(60);
    let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
    let options = FitOptions::default().with_bagging(3, 2).with_stack_levels(1);
    trainer.train(&x, &y, None, None, &options).unwrap();

    let names = trainer.model_names().to_vec();
    assert_eq!(names, vec!["knn", "linear", "knn_L2", "linear_L2"]);
    let stacked = trainer.model_handle("linear_L2").unwrap();
    assert_eq!(stacked.stack_level, 1);
    assert_eq!(stacked.stack_inputs, vec!["knn", "linear"]);
    let bagging = stacked.bagging.as_ref().unwrap();
    assert_eq!(bagging.children.len(), 6);

    let pred = trainer.predict(&x).unwrap();
    assert_eq!(pred.dim(), (60, 1));
    assert_eq!(trainer.predict_proba_model("knn_L2", &x).unwrap().dim(), (60, 1));
    assert!(trainer.model_performance().contains_key(EQUAL_WEIGHTS_KEY));
    assert!(trainer.model_performance().contains_key(OPTIMIZED_KEY));
}

#[test]
fn test_hyperparameter_tuning_adds_trial_models() {
    init_tracing();
    let (x, y) = regression_data(50);
    let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
    let options = FitOptions::default()
        .with_family("knn", vec![])
        .with_hyperparameter_tune(SearcherType::Random, 3);
    trainer.train(&x, &y, None, None, &options).unwrap();

    assert_eq!(trainer.model_names(), &["knn_trial_0", "knn_trial_1", "knn_trial_2"]);
    let summary = &trainer.hpo_results()["knn"];
    assert_eq!(summary.num_trials, 3);
    assert_eq!(summary.trial_rewards.len(), 3);
    let best = summary.trial_rewards.values().copied().fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(summary.best_reward, best);
    assert_eq!(trainer.model_status("knn"), Some(&ModelStatus::Trained));
}

#[test]
fn test_overrides_pin_hyperparameters_during_tuning() {
    let (x, y) = regression_data(40);
    let config = Configuration::new().with("n_neighbors", ParameterValue::Int(3));
    let mut trainer = Trainer::new(TrainerConfig::new(ProblemType::Regression), ModelRegistry::with_builtin()).unwrap();
    let options = FitOptions::default()
        .with_family("knn", vec![config, Configuration::new().with("n_neighbors", ParameterValue::Int(7))])
        .with_hyperparameter_tune(SearcherType::Tpe, 4);
    trainer.train(&x, &y, None, None, &options).unwrap();

    // Both templates still tune the unpinned hyperparameters.
    assert!(trainer.model_names().iter().all(|n| n.starts_with("knn_1_trial_") || n.starts_with("knn_2_trial_")));
    for name in trainer.model_names() {
        let expected = if name.starts_with("knn_1") { 3 } else { 7 };
        let handle = trainer.model_handle(name).unwrap();
        assert_eq!(handle.hyperparameters.get_int("n_neighbors", 0), expected);
    }
}

#[test]
fn test_panicking_model_is_isolated() {
    init_tracing();
    let (x, y) = blob_data(20);
    let mut registry = ModelRegistry::with_builtin();
    registry.register(Arc::new(PanickingFactory));
    let mut learner = Learner::with_registry(LearnerConfig::new(), registry);
    learner.fit(&x, &y, None, None, &FitOptions::default()).unwrap();

    let trainer = learner.trainer().unwrap();
    match trainer.model_status("panicking") {
        Some(ModelStatus::Failed { reason }) => assert!(reason.contains("native library crashed")),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(trainer.model_names().len(), 2);
    assert!(trainer.leaderboard().iter().all(|entry| entry.name != "panicking"));
}

#[test]
fn test_binary_calibrated_threshold() {
    let n = 60;
    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
    let y = Array1::from_shape_fn(n, |i| if i >= 40 { 1.0 } else { 0.0 });
    let config = TrainerConfig::new(ProblemType::Binary)
        .with_eval_metric(Scorer::Accuracy)
        .with_num_classes(2)
        .with_ensemble_config(EnsembleSelectionConfig::default().with_calibration(CalibrationMode::Auto));
    let mut trainer = Trainer::new(config, ModelRegistry::with_builtin()).unwrap();
    trainer.train(&x, &y, None, None, &FitOptions::default().with_holdout_frac(0.25)).unwrap();

    let threshold = trainer.ensemble().unwrap().decision_threshold.unwrap();
    assert!(threshold > 0.0 && threshold < 1.0);
    assert!(trainer.score(&x, &y).unwrap() > 0.9);
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (x, y) = regression_data(45);
    let config = TrainerConfig::new(ProblemType::Regression).with_path(dir.path());
    let mut trainer = Trainer::new(config, ModelRegistry::with_builtin()).unwrap();
    trainer.train(&x, &y, None, None, &FitOptions::default().with_bagging(3, 1)).unwrap();

    assert!(dir.path().join("trainer.json").exists());
    assert!(dir.path().join("models").join("knn").join("S1F1").join("model.json").exists());

    let loaded = Trainer::load(dir.path(), ModelRegistry::with_builtin()).unwrap();
    assert_eq!(loaded.model_names(), trainer.model_names());
    assert_eq!(loaded.ensemble(), trainer.ensemble());
    assert_eq!(loaded.predict(&x).unwrap(), trainer.predict(&x).unwrap());
    assert_eq!(loaded.leaderboard(), trainer.leaderboard());
}

#[test]
fn test_undefined_scores_survive_save_and_load() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (x, y) = regression_data(45);
    let mut registry = ModelRegistry::with_builtin();
    registry.register(Arc::new(NanFactory));
    let config = TrainerConfig::new(ProblemType::Regression).with_path(dir.path());
    let mut trainer = Trainer::new(config, registry).unwrap();
    trainer.train(&x, &y, None, None, &FitOptions::default()).unwrap();

    // An undefined score ranks last instead of poisoning comparisons
    assert_eq!(trainer.model_handle("nan").unwrap().val_score, f64::NEG_INFINITY);
    assert_eq!(trainer.model_performance()["nan"], f64::NEG_INFINITY);
    assert_eq!(trainer.model_performance()[EQUAL_WEIGHTS_KEY], f64::NEG_INFINITY);
    assert_eq!(trainer.ensemble().unwrap().weight_of("nan"), 0.0);
    assert_eq!(trainer.leaderboard().last().unwrap().name, "nan");

    let mut registry = ModelRegistry::with_builtin();
    registry.register(Arc::new(NanFactory));
    let loaded = Trainer::load(dir.path(), registry).unwrap();
    assert_eq!(loaded.model_handle("nan").unwrap().val_score, f64::NEG_INFINITY);
    assert_eq!(loaded.model_performance(), trainer.model_performance());
    assert_eq!(loaded.leaderboard(), trainer.leaderboard());
    assert_eq!(loaded.predict(&x).unwrap(), trainer.predict(&x).unwrap());
}

#[test]
fn test_tuning_summary_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let (x, y) = regression_data(40);
    let config = TrainerConfig::new(ProblemType::Regression).with_path(dir.path());
    let mut trainer = Trainer::new(config, ModelRegistry::with_builtin()).unwrap();
    let options = FitOptions::default()
        .with_family("knn", vec![])
        .with_hyperparameter_tune(SearcherType::Random, 2);
    trainer.train(&x, &y, None, None, &options).unwrap();

    let loaded = Trainer::load(dir.path(), ModelRegistry::with_builtin()).unwrap();
    let summary = &loaded.hpo_results()["knn"];
    assert_eq!(summary.trial_rewards, trainer.hpo_results()["knn"].trial_rewards);
    assert_eq!(summary.training_history.len(), 2);
}

// ============================================================================
// Learner
// ============================================================================

#[test]
fn test_learner_multiclass_end_to_end() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (x, y) = blob_data(25);
    let config = LearnerConfig::new().with_seed(1).with_path(dir.path());
    let mut learner = Learner::new(config);
    learner.fit(&x, &y, None, None, &FitOptions::default().with_bagging(3, 1)).unwrap();

    assert_eq!(learner.problem_type(), Some(ProblemType::Multiclass));
    assert_eq!(learner.predict_proba(&x).unwrap().ncols(), 3);
    assert!(learner.score(&x, &y).unwrap() > 0.95);

    let loaded = Learner::load(dir.path(), ModelRegistry::with_builtin()).unwrap();
    assert_eq!(loaded.classes(), learner.classes());
    assert_eq!(loaded.predict(&x).unwrap(), learner.predict(&x).unwrap());
}

#[test]
fn test_learner_quantile_predictions_are_ordered() {
    let (x, y) = regression_data(80);
    let config = LearnerConfig::new()
        .with_problem_type(ProblemType::Quantile)
        .with_quantile_levels(vec![0.1, 0.5, 0.9]);
    let mut learner = Learner::new(config);
    learner.fit(&x, &y, None, None, &FitOptions::default()).unwrap();

    let pred = learner.predict(&x).unwrap();
    assert_eq!(pred.ncols(), 3);
    for row in pred.rows() {
        assert!(row[0] <= row[1] + 1e-9 && row[1] <= row[2] + 1e-9);
    }
}

#[test]
fn test_rare_class_threshold_example() {
    let mut labels = vec![0.0; 1000];
    labels.extend(vec![1.0; 50]);
    labels.extend(vec![2.0; 3]);
    let y = Array1::from_vec(labels);
    let adjusted = adjust_threshold_if_necessary(&y, ProblemType::Multiclass, 10, 0.1, 5).unwrap();
    assert_eq!(adjusted.threshold, 10);
    assert_eq!(adjusted.num_bagging_folds, 5);

    let adjusted = adjust_threshold_if_necessary(&y, ProblemType::Multiclass, 60, 0.1, 0).unwrap();
    assert_eq!(adjusted.threshold, 50);
    assert_eq!(adjusted.holdout_frac, 0.1);
}

#[test]
fn test_learner_rejects_single_class() {
    let x = Array2::zeros((10, 1));
    let y = Array1::from_elem(10, 1.0);
    let mut learner = Learner::new(LearnerConfig::new());
    let err = learner.fit(&x, &y, None, None, &FitOptions::default()).unwrap_err();
    assert!(matches!(err, KolosalError::InfeasibleSplit(_)));
}
