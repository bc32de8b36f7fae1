//! K-fold bagging
//!
//! A bagged model is `num_folds x num_sets` children, each fitted on all
//! but one fold. The children's predictions on their held-out fold form
//! the out-of-fold (OOF) matrix that stands in for a validation set.

use super::cross_validation::{CVStrategy, CrossValidator};
use super::models::{FitData, ModelFactory, ProblemInfo, TrainableModel};
use crate::error::{KolosalError, Result};
use crate::optimizer::Configuration;
use crate::utils::{class_counts, select_labels, select_rows, TimeBudget};
use ndarray::{Array1, Array2, Axis};
use tracing::{debug, warn};

/// Output of [`fit_bagged`]
#[derive(Debug)]
pub struct BaggedFit {
    /// Children named `S{set}F{fold}`, both 1-based
    pub children: Vec<(String, Box<dyn TrainableModel>)>,
    /// Out-of-fold predictions averaged over completed sets
    pub oof: Array2<f64>,
    pub num_folds: usize,
    pub num_sets_completed: usize,
}

impl BaggedFit {
    pub fn child_names(&self) -> Vec<String> {
        self.children.iter().map(|(name, _)| name.clone()).collect()
    }
}

pub fn child_name(set: usize, fold: usize) -> String {
    format!("S{}F{}", set + 1, fold + 1)
}

/// Stratified folds for classification unless a class is smaller than the fold count
pub fn bagging_strategy(problem: &ProblemInfo, y: &Array1<f64>, num_folds: usize) -> CVStrategy {
    if problem.problem_type.is_classification() {
        let smallest = class_counts(y).values().copied().min().unwrap_or(0);
        if smallest >= num_folds {
            return CVStrategy::StratifiedKFold {
                n_splits: num_folds,
                shuffle: true,
            };
        }
        warn!(
            smallest_class = smallest,
            num_folds, "A class has fewer rows than folds, falling back to plain k-fold"
        );
    }
    CVStrategy::KFold {
        n_splits: num_folds,
        shuffle: true,
    }
}

/// Fit a bagged model. The first set always runs; later sets are skipped
/// once `budget` is exhausted.
#[allow(clippy::too_many_arguments)]
pub fn fit_bagged(
    factory: &dyn ModelFactory,
    config: &Configuration,
    problem: &ProblemInfo,
    x: &Array2<f64>,
    y: &Array1<f64>,
    num_folds: usize,
    num_sets: usize,
    budget: TimeBudget,
) -> Result<BaggedFit> {
    if num_folds < 2 {
        return Err(KolosalError::InvalidParameter {
            name: "num_bagging_folds".to_string(),
            value: num_folds.to_string(),
            reason: "bagging needs at least 2 folds".to_string(),
        });
    }
    let strategy = bagging_strategy(problem, y, num_folds);
    let mut oof_sum = Array2::<f64>::zeros((x.nrows(), problem.output_width()));
    let mut children = Vec::with_capacity(num_folds * num_sets.max(1));
    let mut num_sets_completed = 0;

    for set in 0..num_sets.max(1) {
        if set > 0 && budget.is_exhausted() {
            warn!(
                completed = num_sets_completed,
                requested = num_sets,
                "Time limit reached, skipping remaining bagging sets"
            );
            break;
        }
        let splits = CrossValidator::new(strategy)
            .with_random_state(problem.random_seed.wrapping_add(set as u64))
            .split(x.nrows(), Some(y))?;

        for split in &splits {
            let name = child_name(set, split.fold_idx);
            let x_train = select_rows(x, &split.train_indices);
            let y_train = select_labels(y, &split.train_indices);
            let x_test = select_rows(x, &split.test_indices);
            let y_test = select_labels(y, &split.test_indices);

            let mut model = factory.build(config, problem)?;
            let data = FitData::new(&x_train, &y_train)
                .with_validation(&x_test, &y_test)
                .with_time_limit(budget.remaining_secs());
            model.fit(&data)?;
            let pred = model.predict_proba(&x_test)?;
            if pred.ncols() != oof_sum.ncols() {
                return Err(KolosalError::ShapeError {
                    expected: format!("{} prediction columns", oof_sum.ncols()),
                    actual: format!("{} prediction columns", pred.ncols()),
                });
            }
            for (row, &idx) in pred.axis_iter(Axis(0)).zip(&split.test_indices) {
                let mut target = oof_sum.row_mut(idx);
                target += &row;
            }
            debug!(child = %name, "Fitted bagged child");
            children.push((name, model));
        }
        num_sets_completed += 1;
    }

    // Set 0 ignores the budget, so at least one set filled `oof_sum`
    debug_assert!(num_sets_completed > 0);
    let oof = oof_sum / num_sets_completed as f64;
    Ok(BaggedFit {
        children,
        oof,
        num_folds,
        num_sets_completed,
    })
}
