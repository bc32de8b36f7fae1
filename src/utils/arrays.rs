//! Small ndarray helpers shared by the training code

use crate::error::{KolosalError, Result};
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use std::collections::BTreeMap;

/// Class labels are stored as `f64`; this is the integer key used to count them.
pub fn label_key(label: f64) -> i64 {
    label.round() as i64
}

/// Count rows per class label, ordered by label
pub fn class_counts(y: &Array1<f64>) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for &label in y.iter() {
        *counts.entry(label_key(label)).or_insert(0) += 1;
    }
    counts
}

/// Gather rows by index
pub fn select_rows(x: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    x.select(Axis(0), indices)
}

/// Gather labels by index
pub fn select_labels(y: &Array1<f64>, indices: &[usize]) -> Array1<f64> {
    y.select(Axis(0), indices)
}

/// Gather columns by index, rejecting out-of-range indices
pub fn select_columns(x: &Array2<f64>, indices: &[usize]) -> Result<Array2<f64>> {
    if let Some(&bad) = indices.iter().find(|&&i| i >= x.ncols()) {
        return Err(KolosalError::ShapeError {
            expected: format!("column index below {}", x.ncols()),
            actual: bad.to_string(),
        });
    }
    Ok(x.select(Axis(1), indices))
}

/// Horizontally stack matrices with the same number of rows
pub fn concat_columns(parts: &[ArrayView2<'_, f64>]) -> Result<Array2<f64>> {
    if parts.is_empty() {
        return Err(KolosalError::ValidationError("nothing to concatenate".to_string()));
    }
    let rows = parts[0].nrows();
    if let Some(bad) = parts.iter().find(|p| p.nrows() != rows) {
        return Err(KolosalError::ShapeError {
            expected: format!("{} rows", rows),
            actual: format!("{} rows", bad.nrows()),
        });
    }
    Ok(concatenate(Axis(1), parts)?)
}

/// Vertically stack matrices with the same number of columns
pub fn concat_rows(parts: &[ArrayView2<'_, f64>]) -> Result<Array2<f64>> {
    if parts.is_empty() {
        return Err(KolosalError::ValidationError("nothing to concatenate".to_string()));
    }
    Ok(concatenate(Axis(0), parts)?)
}
