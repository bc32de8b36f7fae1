//! Feature pruning by permutation importance

use super::models::{ProblemInfo, TrainableModel};
use crate::error::{KolosalError, Result};
use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Importance of each input column on validation data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    /// Validation score with no column permuted
    pub baseline: f64,
    /// `baseline - permuted score` per column, higher means more useful
    pub importances: Vec<f64>,
}

impl FeatureImportance {
    /// Columns whose permutation worsened the score; all columns if none did
    pub fn selected_indices(&self) -> Vec<usize> {
        let kept: Vec<usize> = self
            .importances
            .iter()
            .enumerate()
            .filter(|(_, &imp)| imp > 0.0)
            .map(|(i, _)| i)
            .collect();
        if kept.is_empty() {
            (0..self.importances.len()).collect()
        } else {
            kept
        }
    }

    pub fn ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.importances.len()).collect();
        order.sort_by(|&a, &b| self.importances[b].total_cmp(&self.importances[a]));
        order
    }
}

/// Average score drop over `n_repeats` shuffles of each column
pub fn permutation_importance(
    model: &dyn TrainableModel,
    problem: &ProblemInfo,
    x_val: &Array2<f64>,
    y_val: &Array1<f64>,
    n_repeats: usize,
    seed: u64,
) -> Result<FeatureImportance> {
    if x_val.nrows() != y_val.len() {
        return Err(KolosalError::ShapeError {
            expected: format!("{} labels", x_val.nrows()),
            actual: format!("{} labels", y_val.len()),
        });
    }
    let baseline = problem.score(y_val, &model.predict_proba(x_val)?)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let repeats = n_repeats.max(1);

    let mut importances = Vec::with_capacity(x_val.ncols());
    let mut permuted = x_val.clone();
    for col in 0..x_val.ncols() {
        let original = x_val.column(col).to_vec();
        let mut drop = 0.0;
        for _ in 0..repeats {
            let mut shuffled = original.clone();
            shuffled.shuffle(&mut rng);
            permuted.column_mut(col).assign(&Array1::from_vec(shuffled));
            let score = problem.score(y_val, &model.predict_proba(&permuted)?)?;
            drop += baseline - score;
        }
        permuted.column_mut(col).assign(&Array1::from_vec(original));
        importances.push(drop / repeats as f64);
    }
    Ok(FeatureImportance { baseline, importances })
}
