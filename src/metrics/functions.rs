//! Raw metric functions
//!
//! All functions accept optional per-row sample weights. Classification
//! labels are class indices stored as `f64`.

use crate::error::{KolosalError, Result};
use crate::utils::label_key;
use ndarray::{Array1, Array2, ArrayView1};
use std::collections::BTreeMap;

const LOG_LOSS_EPS: f64 = 1e-15;

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(KolosalError::ShapeError {
            expected: format!("{} rows", expected),
            actual: format!("{} rows", actual),
        });
    }
    if expected == 0 {
        return Err(KolosalError::ValidationError("cannot score zero rows".to_string()));
    }
    Ok(())
}

fn weight(sample_weight: Option<&Array1<f64>>, i: usize) -> f64 {
    sample_weight.map(|w| w[i]).unwrap_or(1.0)
}

fn total_weight(n: usize, sample_weight: Option<&Array1<f64>>) -> f64 {
    sample_weight.map(|w| w.sum()).unwrap_or(n as f64)
}

/// Fraction of correct predictions
pub fn accuracy(y_true: &Array1<f64>, y_pred: ArrayView1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), y_pred.len())?;
    let correct: f64 = (0..y_true.len())
        .filter(|&i| label_key(y_true[i]) == label_key(y_pred[i]))
        .map(|i| weight(sample_weight, i))
        .sum();
    Ok(correct / total_weight(y_true.len(), sample_weight))
}

/// Mean per-class recall
pub fn balanced_accuracy(
    y_true: &Array1<f64>,
    y_pred: ArrayView1<f64>,
    sample_weight: Option<&Array1<f64>>,
) -> Result<f64> {
    check_len(y_true.len(), y_pred.len())?;
    let mut per_class: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for i in 0..y_true.len() {
        let w = weight(sample_weight, i);
        let entry = per_class.entry(label_key(y_true[i])).or_insert((0.0, 0.0));
        entry.1 += w;
        if label_key(y_true[i]) == label_key(y_pred[i]) {
            entry.0 += w;
        }
    }
    let recalls: Vec<f64> = per_class
        .values()
        .filter(|(_, total)| *total > 0.0)
        .map(|(hit, total)| hit / total)
        .collect();
    Ok(recalls.iter().sum::<f64>() / recalls.len().max(1) as f64)
}

/// F1 score of the positive class (label 1)
pub fn f1(y_true: &Array1<f64>, y_pred: ArrayView1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), y_pred.len())?;
    let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
    for i in 0..y_true.len() {
        let w = weight(sample_weight, i);
        match (label_key(y_true[i]) == 1, label_key(y_pred[i]) == 1) {
            (true, true) => tp += w,
            (false, true) => fp += w,
            (true, false) => fn_ += w,
            (false, false) => {}
        }
    }
    let denom = 2.0 * tp + fp + fn_;
    Ok(if denom > 0.0 { 2.0 * tp / denom } else { 0.0 })
}

/// Area under the ROC curve for binary labels and positive-class scores
pub fn roc_auc(y_true: &Array1<f64>, scores: ArrayView1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), scores.len())?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(std::cmp::Ordering::Equal));

    let (mut pos_total, mut neg_total) = (0.0, 0.0);
    for i in 0..y_true.len() {
        if label_key(y_true[i]) == 1 {
            pos_total += weight(sample_weight, i);
        } else {
            neg_total += weight(sample_weight, i);
        }
    }
    if pos_total == 0.0 || neg_total == 0.0 {
        return Err(KolosalError::ValidationError(
            "roc_auc needs both classes present".to_string(),
        ));
    }

    // Walk groups of tied scores in ascending order.
    let mut area = 0.0;
    let mut neg_below = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        let (mut pos_group, mut neg_group) = (0.0, 0.0);
        for &i in &order[start..end] {
            if label_key(y_true[i]) == 1 {
                pos_group += weight(sample_weight, i);
            } else {
                neg_group += weight(sample_weight, i);
            }
        }
        area += pos_group * (neg_below + 0.5 * neg_group);
        neg_below += neg_group;
        start = end;
    }
    Ok(area / (pos_total * neg_total))
}

/// Cross-entropy. `proba` is `n x 1` (positive class) or `n x k`.
pub fn log_loss(y_true: &Array1<f64>, proba: &Array2<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), proba.nrows())?;
    let mut loss = 0.0;
    for i in 0..y_true.len() {
        let class = label_key(y_true[i]);
        let p = if proba.ncols() == 1 {
            let p1 = proba[[i, 0]];
            if class == 1 {
                p1
            } else {
                1.0 - p1
            }
        } else {
            let c = usize::try_from(class).ok().filter(|&c| c < proba.ncols()).ok_or_else(|| {
                KolosalError::ValidationError(format!("label {} outside of {} classes", class, proba.ncols()))
            })?;
            proba[[i, c]]
        };
        loss -= weight(sample_weight, i) * p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS).ln();
    }
    Ok(loss / total_weight(y_true.len(), sample_weight))
}

/// Root mean squared error
pub fn rmse(y_true: &Array1<f64>, y_pred: ArrayView1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), y_pred.len())?;
    let sse: f64 = (0..y_true.len())
        .map(|i| weight(sample_weight, i) * (y_true[i] - y_pred[i]).powi(2))
        .sum();
    Ok((sse / total_weight(y_true.len(), sample_weight)).sqrt())
}

/// Mean absolute error
pub fn mae(y_true: &Array1<f64>, y_pred: ArrayView1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), y_pred.len())?;
    let sae: f64 = (0..y_true.len())
        .map(|i| weight(sample_weight, i) * (y_true[i] - y_pred[i]).abs())
        .sum();
    Ok(sae / total_weight(y_true.len(), sample_weight))
}

/// Coefficient of determination
pub fn r2(y_true: &Array1<f64>, y_pred: ArrayView1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<f64> {
    check_len(y_true.len(), y_pred.len())?;
    let total = total_weight(y_true.len(), sample_weight);
    let mean = (0..y_true.len())
        .map(|i| weight(sample_weight, i) * y_true[i])
        .sum::<f64>()
        / total;
    let ss_res: f64 = (0..y_true.len())
        .map(|i| weight(sample_weight, i) * (y_true[i] - y_pred[i]).powi(2))
        .sum();
    let ss_tot: f64 = (0..y_true.len())
        .map(|i| weight(sample_weight, i) * (y_true[i] - mean).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return Ok(if ss_res == 0.0 { 1.0 } else { 0.0 });
    }
    Ok(1.0 - ss_res / ss_tot)
}

/// Mean pinball loss over quantile columns
pub fn pinball_loss(
    y_true: &Array1<f64>,
    y_pred: &Array2<f64>,
    quantile_levels: &[f64],
    sample_weight: Option<&Array1<f64>>,
) -> Result<f64> {
    check_len(y_true.len(), y_pred.nrows())?;
    if y_pred.ncols() != quantile_levels.len() {
        return Err(KolosalError::ShapeError {
            expected: format!("{} quantile columns", quantile_levels.len()),
            actual: format!("{} columns", y_pred.ncols()),
        });
    }
    let mut loss = 0.0;
    for i in 0..y_true.len() {
        let w = weight(sample_weight, i);
        for (j, &q) in quantile_levels.iter().enumerate() {
            let diff = y_true[i] - y_pred[[i, j]];
            loss += w * (q * diff).max((q - 1.0) * diff);
        }
    }
    Ok(loss / (total_weight(y_true.len(), sample_weight) * quantile_levels.len() as f64))
}
