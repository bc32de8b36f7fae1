//! Holdout splits and rare-class threshold adjustment

use super::ProblemType;
use crate::error::{KolosalError, Result};
use crate::utils::{class_counts, label_key, select_labels, select_rows};
use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Share of rows that must survive rare-class removal
const MINIMUM_PERCENT_TO_KEEP: f64 = 0.975;
const MINIMUM_CLASSES_TO_KEEP: usize = 2;

/// Result of [`adjust_threshold_if_necessary`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdAdjustment {
    /// Classes with fewer rows than this are dropped
    pub threshold: usize,
    pub holdout_frac: f64,
    pub num_bagging_folds: usize,
}

/// Class counts ordered from most to least frequent, ties by label
pub fn class_counts_descending(y: &Array1<f64>) -> Vec<(i64, usize)> {
    let mut counts: Vec<(i64, usize)> = class_counts(y).into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    counts
}

/// Raise or lower the rare-class `threshold` so that every kept class can be
/// split, and relax `holdout_frac` / `num_bagging_folds` when the threshold
/// ends up below what they need. Purely arithmetic and deterministic.
pub fn adjust_threshold_if_necessary(
    y: &Array1<f64>,
    problem_type: ProblemType,
    threshold: usize,
    holdout_frac: f64,
    num_bagging_folds: usize,
) -> Result<ThresholdAdjustment> {
    let adjusted = compute_adjustment(y, problem_type, threshold, holdout_frac, num_bagging_folds)?;
    if adjusted.threshold < threshold {
        warn!(
            from = threshold,
            to = adjusted.threshold,
            "Updated label count threshold to avoid cutting too many classes"
        );
    }
    if adjusted.holdout_frac > holdout_frac {
        warn!(
            from = holdout_frac,
            to = adjusted.holdout_frac,
            "Updated holdout_frac to avoid cutting too many classes"
        );
    }
    if adjusted.num_bagging_folds != num_bagging_folds {
        warn!(
            from = num_bagging_folds,
            to = adjusted.num_bagging_folds,
            "Updated num_bagging_folds to avoid cutting too many classes"
        );
    }
    Ok(adjusted)
}

fn compute_adjustment(
    y: &Array1<f64>,
    problem_type: ProblemType,
    threshold: usize,
    holdout_frac: f64,
    num_bagging_folds: usize,
) -> Result<ThresholdAdjustment> {
    if !(holdout_frac > 0.0 && holdout_frac <= 1.0) {
        return Err(KolosalError::InvalidParameter {
            name: "holdout_frac".to_string(),
            value: holdout_frac.to_string(),
            reason: "must be in (0, 1]".to_string(),
        });
    }
    let num_rows = y.len();
    if num_rows == 0 {
        return Err(KolosalError::InfeasibleSplit("no labelled rows".to_string()));
    }

    if !problem_type.is_classification() {
        return Ok(ThresholdAdjustment {
            threshold,
            holdout_frac: holdout_frac.max(1.0 / num_rows as f64 + 0.001),
            num_bagging_folds: num_bagging_folds.min(num_rows),
        });
    }

    let minimum_safe_threshold = if num_bagging_folds < 2 {
        (1.0 / holdout_frac).ceil() as usize
    } else {
        num_bagging_folds
    };
    let mut new_threshold = threshold.max(minimum_safe_threshold);

    let counts = class_counts_descending(y);
    if counts.len() < MINIMUM_CLASSES_TO_KEEP {
        return Err(KolosalError::InfeasibleSplit(format!(
            "classification needs at least {} classes, found {}",
            MINIMUM_CLASSES_TO_KEEP,
            counts.len()
        )));
    }
    let minimum_rows_to_keep = (num_rows as f64 * MINIMUM_PERCENT_TO_KEEP).ceil() as usize;

    let (rows_valid, classes_valid) = counts
        .iter()
        .filter(|(_, c)| *c >= new_threshold)
        .fold((0, 0), |(rows, classes), (_, c)| (rows + c, classes + 1));
    if rows_valid >= minimum_rows_to_keep && classes_valid >= MINIMUM_CLASSES_TO_KEEP {
        return Ok(ThresholdAdjustment {
            threshold: new_threshold,
            holdout_frac,
            num_bagging_folds,
        });
    }

    let mut rows_kept = 0;
    for (classes_kept, (_, count)) in counts.iter().enumerate() {
        rows_kept += count;
        new_threshold = *count;
        if rows_kept >= minimum_rows_to_keep && classes_kept + 1 >= MINIMUM_CLASSES_TO_KEEP {
            break;
        }
    }
    // A class with a single row cannot be split
    if new_threshold == 1 {
        new_threshold = 2;
    }

    let mut holdout_frac = holdout_frac;
    let mut num_bagging_folds = num_bagging_folds;
    if new_threshold < minimum_safe_threshold {
        if num_bagging_folds >= 2 {
            if num_bagging_folds > new_threshold {
                num_bagging_folds = new_threshold;
            }
        } else if (1.0 / holdout_frac).ceil() as usize > new_threshold {
            holdout_frac = 1.0 / new_threshold as f64 + 0.001;
        }
    }

    Ok(ThresholdAdjustment {
        threshold: new_threshold,
        holdout_frac,
        num_bagging_folds,
    })
}

/// Indices of `(train, test)` rows; stratified for classification
pub fn train_test_indices(
    y: &Array1<f64>,
    problem_type: ProblemType,
    test_size: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let n = y.len();
    let n_test = (test_size * n as f64).ceil() as usize;
    if n_test == 0 || n_test >= n {
        return Err(KolosalError::InfeasibleSplit(format!(
            "holdout of {} rows out of {} leaves an empty side",
            n_test, n
        )));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let order: Vec<usize> = if problem_type.is_classification() {
        let mut per_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, &v) in y.iter().enumerate() {
            per_class.entry(label_key(v)).or_default().push(i);
        }
        // Rank rows by their relative position inside their class so that
        // any prefix holds every class in proportion.
        let mut ranked: Vec<(f64, i64, usize)> = Vec::with_capacity(n);
        for (class, mut indices) in per_class {
            indices.shuffle(&mut rng);
            let len = indices.len() as f64;
            for (pos, idx) in indices.into_iter().enumerate() {
                ranked.push(((pos as f64 + 0.5) / len, class, idx));
            }
        }
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, _, idx)| idx).collect()
    } else {
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rng);
        indices
    };

    let mut test: Vec<usize> = order[..n_test].to_vec();
    let mut train: Vec<usize> = order[n_test..].to_vec();
    test.sort_unstable();
    train.sort_unstable();
    Ok((train, test))
}

/// Split rows into `(x_train, x_test, y_train, y_test)`
pub fn generate_train_test_split(
    x: &Array2<f64>,
    y: &Array1<f64>,
    problem_type: ProblemType,
    test_size: f64,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>, Array1<f64>, Array1<f64>)> {
    if x.nrows() != y.len() {
        return Err(KolosalError::ShapeError {
            expected: format!("{} labels", x.nrows()),
            actual: format!("{} labels", y.len()),
        });
    }
    let (train, test) = train_test_indices(y, problem_type, test_size, seed)?;
    Ok((
        select_rows(x, &train),
        select_rows(x, &test),
        select_labels(y, &train),
        select_labels(y, &test),
    ))
}
