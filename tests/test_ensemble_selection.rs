//! Integration tests for greedy ensemble selection

use approx::assert_relative_eq;
use kolosal_tabular::ensemble::{EnsembleSelection, EnsembleSelectionConfig, TieBreaker, WeightedEnsemble};
use kolosal_tabular::metrics::Scorer;
use kolosal_tabular::training::ProblemType;
use ndarray::{array, Array1, Array2};
use proptest::prelude::*;

fn column(values: &[f64]) -> Array2<f64> {
    Array2::from_shape_vec((values.len(), 1), values.to_vec()).unwrap()
}

fn regret(metric: Scorer, y: &Array1<f64>, pred: &Array2<f64>, problem_type: ProblemType) -> f64 {
    let score = metric.score_proba(y, pred, problem_type, None, None, None).unwrap();
    metric.convert_score_to_error(score)
}

fn regression_case() -> impl Strategy<Value = (Vec<f64>, Vec<Vec<f64>>)> {
    (2usize..12).prop_flat_map(|n| {
        (
            prop::collection::vec(-5.0f64..5.0, n),
            prop::collection::vec(prop::collection::vec(-5.0f64..5.0, n), 1..5),
        )
    })
}

// ============================================================================
// Weight invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_weights_form_a_distribution((labels, models) in regression_case()) {
        let y = Array1::from_vec(labels);
        let predictions: Vec<Array2<f64>> = models.iter().map(|m| column(m)).collect();
        let mut selection = EnsembleSelection::new(
            20,
            ProblemType::Regression,
            Scorer::RootMeanSquaredError,
            EnsembleSelectionConfig::default(),
        ).unwrap();
        selection.fit(&predictions, &y, None, None).unwrap();

        let weights = selection.weights().unwrap();
        prop_assert_eq!(weights.len(), predictions.len());
        prop_assert!(weights.iter().all(|&w| (0.0..=1.0).contains(&w)));
        prop_assert!((weights.sum() - 1.0).abs() < 1e-9);
        prop_assert!(selection.fitted_ensemble_size() <= 20);
        prop_assert_eq!(selection.indices().len(), selection.fitted_ensemble_size());
    }

    #[test]
    fn test_ensemble_never_worse_than_best_member((labels, models) in regression_case()) {
        let y = Array1::from_vec(labels);
        let predictions: Vec<Array2<f64>> = models.iter().map(|m| column(m)).collect();
        let metric = Scorer::RootMeanSquaredError;
        let mut selection = EnsembleSelection::new(
            15,
            ProblemType::Regression,
            metric,
            EnsembleSelectionConfig::default(),
        ).unwrap();
        selection.fit(&predictions, &y, None, None).unwrap();

        let best_single = predictions
            .iter()
            .map(|p| regret(metric, &y, p, ProblemType::Regression))
            .fold(f64::INFINITY, f64::min);
        let train_score = selection.train_score().unwrap();
        prop_assert!(train_score <= best_single + 1e-6);
    }
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn test_binary_selection_prefers_accurate_model() {
    let y = array![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
    let good = column(&[0.1, 0.9, 0.8, 0.2, 0.7, 0.3, 0.9, 0.1]);
    let noisy = column(&[0.6, 0.4, 0.5, 0.5, 0.6, 0.4, 0.3, 0.7]);
    let mut selection = EnsembleSelection::new(
        10,
        ProblemType::Binary,
        Scorer::LogLoss,
        EnsembleSelectionConfig::default().with_tie_breaker(TieBreaker::SecondMetric),
    )
    .unwrap();
    selection.fit(&[good.clone(), noisy.clone()], &y, None, None).unwrap();

    let weights = selection.weights().unwrap();
    assert!(weights[0] > weights[1]);
    let combined = selection.predict_proba(&[good, noisy]).unwrap();
    assert_eq!(combined.dim(), (8, 1));
    let hard = selection.predict(&[column(&[0.9; 8]), column(&[0.9; 8])]).unwrap();
    assert!(hard.iter().all(|&v| v == 1.0));
}

#[test]
fn test_multiclass_weights_feed_weighted_ensemble() {
    let y = array![0.0, 1.0, 2.0, 1.0];
    let a = array![[0.8, 0.1, 0.1], [0.1, 0.8, 0.1], [0.1, 0.1, 0.8], [0.2, 0.7, 0.1]];
    let b = array![[0.3, 0.4, 0.3], [0.3, 0.4, 0.3], [0.3, 0.4, 0.3], [0.3, 0.4, 0.3]];
    let mut selection = EnsembleSelection::new(
        8,
        ProblemType::Multiclass,
        Scorer::LogLoss,
        EnsembleSelectionConfig::default().with_seed(9),
    )
    .unwrap();
    selection.fit(&[a.clone(), b.clone()], &y, None, None).unwrap();

    let ensemble = WeightedEnsemble::from_selection(vec!["a".to_string(), "b".to_string()], &selection).unwrap();
    assert_relative_eq!(ensemble.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    let proba = ensemble.combine(&[a, b]).unwrap();
    for row in proba.rows() {
        assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
    }
    assert_eq!(ensemble.predict_from_proba(&proba).column(0).to_vec(), vec![0.0, 1.0, 2.0, 1.0]);
}

#[test]
fn test_time_limit_stops_early_without_error() {
    let y = Array1::from_shape_fn(50, |i| (i % 2) as f64);
    let predictions: Vec<Array2<f64>> = (0..4)
        .map(|k| Array2::from_shape_fn((50, 1), |(i, _)| if i % 2 == 0 { 0.1 * k as f64 } else { 0.9 }))
        .collect();
    let mut selection =
        EnsembleSelection::new(100, ProblemType::Binary, Scorer::LogLoss, EnsembleSelectionConfig::default()).unwrap();
    selection.fit(&predictions, &y, Some(0.0), None).unwrap();

    assert!(selection.fitted_ensemble_size() >= 1);
    assert!(selection.fitted_ensemble_size() < 100);
    assert_relative_eq!(selection.weights().unwrap().sum(), 1.0, epsilon = 1e-9);
}
