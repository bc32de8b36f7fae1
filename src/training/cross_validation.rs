//! Cross-validation splitters

use crate::error::{KolosalError, Result};
use crate::utils::label_key;
use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cross-validation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CVStrategy {
    /// K-Fold cross-validation
    KFold { n_splits: usize, shuffle: bool },
    /// Stratified K-Fold (maintains class distribution)
    StratifiedKFold { n_splits: usize, shuffle: bool },
}

impl Default for CVStrategy {
    fn default() -> Self {
        CVStrategy::KFold {
            n_splits: 5,
            shuffle: true,
        }
    }
}

impl CVStrategy {
    pub fn n_splits(&self) -> usize {
        match self {
            CVStrategy::KFold { n_splits, .. } | CVStrategy::StratifiedKFold { n_splits, .. } => *n_splits,
        }
    }
}

/// A single train/test split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CVSplit {
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
    pub fold_idx: usize,
}

/// Cross-validation splitter
#[derive(Debug, Clone)]
pub struct CrossValidator {
    strategy: CVStrategy,
    random_state: u64,
}

impl CrossValidator {
    pub fn new(strategy: CVStrategy) -> Self {
        Self {
            strategy,
            random_state: 0,
        }
    }

    /// Set random state for reproducibility
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    /// Generate disjoint test folds covering every row exactly once
    pub fn split(&self, n_samples: usize, y: Option<&Array1<f64>>) -> Result<Vec<CVSplit>> {
        let n_splits = self.strategy.n_splits();
        if n_splits < 2 {
            return Err(KolosalError::ValidationError("n_splits must be at least 2".to_string()));
        }
        if n_samples < n_splits {
            return Err(KolosalError::InfeasibleSplit(format!(
                "n_samples ({}) must be >= n_splits ({})",
                n_samples, n_splits
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.random_state);

        let folds = match self.strategy {
            CVStrategy::KFold { shuffle, .. } => {
                let mut indices: Vec<usize> = (0..n_samples).collect();
                if shuffle {
                    indices.shuffle(&mut rng);
                }
                let base = n_samples / n_splits;
                let remainder = n_samples % n_splits;
                let mut folds = Vec::with_capacity(n_splits);
                let mut current = 0;
                for i in 0..n_splits {
                    let size = if i < remainder { base + 1 } else { base };
                    folds.push(indices[current..current + size].to_vec());
                    current += size;
                }
                folds
            }
            CVStrategy::StratifiedKFold { shuffle, .. } => {
                let y = y.ok_or_else(|| {
                    KolosalError::ValidationError("StratifiedKFold requires target array".to_string())
                })?;
                if y.len() != n_samples {
                    return Err(KolosalError::ShapeError {
                        expected: format!("{} labels", n_samples),
                        actual: format!("{} labels", y.len()),
                    });
                }
                let mut class_indices: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
                for (idx, &val) in y.iter().enumerate() {
                    class_indices.entry(label_key(val)).or_default().push(idx);
                }
                if shuffle {
                    for indices in class_indices.values_mut() {
                        indices.shuffle(&mut rng);
                    }
                }
                // Round robin that carries over between classes keeps fold sizes balanced
                let mut folds: Vec<Vec<usize>> = vec![Vec::new(); n_splits];
                let mut position = 0;
                for indices in class_indices.values() {
                    for &idx in indices {
                        folds[position % n_splits].push(idx);
                        position += 1;
                    }
                }
                folds
            }
        };

        let splits = (0..n_splits)
            .map(|fold_idx| {
                let mut test_indices = folds[fold_idx].clone();
                test_indices.sort_unstable();
                let mut train_indices: Vec<usize> = folds
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != fold_idx)
                    .flat_map(|(_, f)| f.iter().copied())
                    .collect();
                train_indices.sort_unstable();
                CVSplit {
                    train_indices,
                    test_indices,
                    fold_idx,
                }
            })
            .collect();
        Ok(splits)
    }
}
