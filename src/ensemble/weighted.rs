//! Weighted averaging of member predictions

use super::ensemble_selection::EnsembleSelection;
use crate::error::{KolosalError, Result};
use crate::metrics::get_pred_from_proba;
use crate::training::ProblemType;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// `sum_i weights[i] * predictions[i]`, skipping zero-weight members
pub fn weight_pred_probas(predictions: &[Array2<f64>], weights: &[f64]) -> Result<Array2<f64>> {
    if predictions.len() != weights.len() {
        return Err(KolosalError::ShapeError {
            expected: format!("{} prediction matrices", weights.len()),
            actual: format!("{} prediction matrices", predictions.len()),
        });
    }
    let mut combined: Option<Array2<f64>> = None;
    for (pred, &w) in predictions.iter().zip(weights) {
        if w == 0.0 {
            continue;
        }
        match combined.as_mut() {
            None => combined = Some(pred.mapv(|v| v * w)),
            Some(acc) => {
                if acc.dim() != pred.dim() {
                    return Err(KolosalError::ShapeError {
                        expected: format!("{:?}", acc.dim()),
                        actual: format!("{:?}", pred.dim()),
                    });
                }
                acc.scaled_add(w, pred);
            }
        }
    }
    combined.ok_or_else(|| KolosalError::ValidationError("ensemble has no members with non-zero weight".to_string()))
}

/// A fitted weighted ensemble over named base models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedEnsemble {
    /// Candidate model names, aligned with `weights`
    pub model_names: Vec<String>,
    pub weights: Vec<f64>,
    pub problem_type: ProblemType,
    pub decision_threshold: Option<f64>,
    /// Regret on the data the weights were fitted on
    pub train_score: Option<f64>,
    pub trajectory: Vec<f64>,
    pub indices: Vec<usize>,
}

impl WeightedEnsemble {
    /// Uniform weights over every candidate
    pub fn equal_weights(model_names: Vec<String>, problem_type: ProblemType) -> Result<Self> {
        if model_names.is_empty() {
            return Err(KolosalError::NoModelsTrained);
        }
        let n = model_names.len();
        Ok(Self {
            weights: vec![1.0 / n as f64; n],
            indices: (0..n).collect(),
            model_names,
            problem_type,
            decision_threshold: None,
            train_score: None,
            trajectory: Vec::new(),
        })
    }

    /// Weights chosen by greedy ensemble selection
    pub fn from_selection(model_names: Vec<String>, selection: &EnsembleSelection) -> Result<Self> {
        let weights = selection.weights().ok_or(KolosalError::ModelNotFitted)?;
        if weights.len() != model_names.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} model names", weights.len()),
                actual: format!("{} model names", model_names.len()),
            });
        }
        Ok(Self {
            model_names,
            weights: weights.to_vec(),
            problem_type: selection.problem_type(),
            decision_threshold: selection.decision_threshold(),
            train_score: selection.train_score(),
            trajectory: selection.trajectory().to_vec(),
            indices: selection.indices().to_vec(),
        })
    }

    /// All weight on one candidate
    pub fn best_single(model_names: Vec<String>, best: usize, problem_type: ProblemType) -> Result<Self> {
        if best >= model_names.len() {
            return Err(KolosalError::ValidationError(format!(
                "best model index {} out of range for {} models",
                best,
                model_names.len()
            )));
        }
        let mut weights = vec![0.0; model_names.len()];
        weights[best] = 1.0;
        Ok(Self {
            model_names,
            weights,
            problem_type,
            decision_threshold: None,
            train_score: None,
            trajectory: Vec::new(),
            indices: vec![best],
        })
    }

    /// Members with non-zero weight, in candidate order
    pub fn members(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.model_names
            .iter()
            .zip(&self.weights)
            .filter(|(_, &w)| w > 0.0)
            .map(|(name, &w)| (name.as_str(), w))
    }

    pub fn weight_of(&self, name: &str) -> f64 {
        self.model_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.weights[i])
            .unwrap_or(0.0)
    }

    /// Combine predictions aligned with `model_names`
    pub fn combine(&self, predictions: &[Array2<f64>]) -> Result<Array2<f64>> {
        weight_pred_probas(predictions, &self.weights)
    }

    /// Combine `(weight, prediction)` pairs for the non-zero members only
    pub fn combine_members(&self, member_predictions: &[Array2<f64>]) -> Result<Array2<f64>> {
        let weights: Vec<f64> = self.members().map(|(_, w)| w).collect();
        weight_pred_probas(member_predictions, &weights)
    }

    pub fn predict_from_proba(&self, proba: &Array2<f64>) -> Array2<f64> {
        get_pred_from_proba(proba, self.problem_type, self.decision_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("m{}", i)).collect()
    }

    #[test]
    fn test_weight_pred_probas_skips_zero_weights() {
        let a = array![[0.2], [0.4]];
        let b = array![[1.0, 2.0]];
        let combined = weight_pred_probas(&[a.clone(), b], &[1.0, 0.0]).unwrap();
        assert_eq!(combined, a);
    }

    #[test]
    fn test_weight_pred_probas_errors() {
        let a = array![[0.2], [0.4]];
        assert!(weight_pred_probas(&[a.clone()], &[0.0]).is_err());
        assert!(weight_pred_probas(&[a], &[0.5, 0.5]).is_err());
    }

    #[test]
    fn test_equal_weights() {
        let ens = WeightedEnsemble::equal_weights(names(4), ProblemType::Regression).unwrap();
        assert!(ens.weights.iter().all(|&w| (w - 0.25).abs() < 1e-12));
        assert!(WeightedEnsemble::equal_weights(vec![], ProblemType::Regression).is_err());

        let preds = vec![array![[1.0]], array![[2.0]], array![[3.0]], array![[4.0]]];
        assert_relative_eq!(ens.combine(&preds).unwrap()[[0, 0]], 2.5);
    }

    #[test]
    fn test_best_single() {
        let ens = WeightedEnsemble::best_single(names(3), 2, ProblemType::Binary).unwrap();
        let members: Vec<_> = ens.members().collect();
        assert_eq!(members, vec![("m2", 1.0)]);
        assert_eq!(ens.weight_of("m0"), 0.0);
        assert!(WeightedEnsemble::best_single(names(3), 3, ProblemType::Binary).is_err());
    }

    #[test]
    fn test_predict_from_proba_uses_threshold() {
        let mut ens = WeightedEnsemble::best_single(names(1), 0, ProblemType::Binary).unwrap();
        ens.decision_threshold = Some(0.3);
        let pred = ens.predict_from_proba(&array![[0.35], [0.25]]);
        assert_eq!(pred, array![[1.0], [0.0]]);
    }
}
