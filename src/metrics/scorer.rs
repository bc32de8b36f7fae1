//! Evaluation metrics as scorers
//!
//! A [`Scorer`] returns sign-adjusted scores, so higher is always better.
//! [`Scorer::convert_score_to_error`] turns a score into a regret where
//! lower is always better and the optimum maps to zero.

use super::functions;
use crate::error::{KolosalError, Result};
use crate::training::ProblemType;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported evaluation metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scorer {
    Accuracy,
    BalancedAccuracy,
    F1,
    RocAuc,
    LogLoss,
    RootMeanSquaredError,
    MeanAbsoluteError,
    R2,
    PinballLoss,
}

impl Scorer {
    pub fn name(&self) -> &'static str {
        match self {
            Scorer::Accuracy => "accuracy",
            Scorer::BalancedAccuracy => "balanced_accuracy",
            Scorer::F1 => "f1",
            Scorer::RocAuc => "roc_auc",
            Scorer::LogLoss => "log_loss",
            Scorer::RootMeanSquaredError => "root_mean_squared_error",
            Scorer::MeanAbsoluteError => "mean_absolute_error",
            Scorer::R2 => "r2",
            Scorer::PinballLoss => "pinball_loss",
        }
    }

    /// Parse a metric name, accepting common aliases
    pub fn from_name(name: &str) -> Result<Self> {
        let scorer = match name.to_ascii_lowercase().as_str() {
            "accuracy" | "acc" => Scorer::Accuracy,
            "balanced_accuracy" => Scorer::BalancedAccuracy,
            "f1" => Scorer::F1,
            "roc_auc" | "auc" => Scorer::RocAuc,
            "log_loss" | "logloss" => Scorer::LogLoss,
            "root_mean_squared_error" | "rmse" => Scorer::RootMeanSquaredError,
            "mean_absolute_error" | "mae" => Scorer::MeanAbsoluteError,
            "r2" => Scorer::R2,
            "pinball_loss" | "pinball" => Scorer::PinballLoss,
            other => {
                return Err(KolosalError::ConfigError(format!("unknown metric '{}'", other)));
            }
        };
        Ok(scorer)
    }

    /// Default evaluation metric for a problem type
    pub fn default_for(problem_type: ProblemType) -> Self {
        match problem_type {
            ProblemType::Binary | ProblemType::Multiclass => Scorer::Accuracy,
            ProblemType::Regression => Scorer::RootMeanSquaredError,
            ProblemType::Quantile => Scorer::PinballLoss,
        }
    }

    pub fn greater_is_better(&self) -> bool {
        matches!(
            self,
            Scorer::Accuracy | Scorer::BalancedAccuracy | Scorer::F1 | Scorer::RocAuc | Scorer::R2
        )
    }

    /// Best achievable value of the raw metric
    pub fn optimum(&self) -> f64 {
        if self.greater_is_better() {
            1.0
        } else {
            0.0
        }
    }

    fn sign(&self) -> f64 {
        if self.greater_is_better() {
            1.0
        } else {
            -1.0
        }
    }

    /// Scores hard predictions (class labels or regression values)
    pub fn needs_pred(&self) -> bool {
        matches!(
            self,
            Scorer::Accuracy
                | Scorer::BalancedAccuracy
                | Scorer::F1
                | Scorer::RootMeanSquaredError
                | Scorer::MeanAbsoluteError
                | Scorer::R2
        )
    }

    /// Scores probabilities
    pub fn needs_proba(&self) -> bool {
        matches!(self, Scorer::LogLoss | Scorer::RocAuc)
    }

    /// Scores quantile predictions
    pub fn needs_quantile(&self) -> bool {
        matches!(self, Scorer::PinballLoss)
    }

    /// Classification metric on hard labels, so sensitive to the decision threshold
    pub fn needs_class(&self) -> bool {
        matches!(self, Scorer::Accuracy | Scorer::BalancedAccuracy | Scorer::F1)
    }

    /// Sign-adjusted score of `y_pred`, higher is better.
    ///
    /// `y_pred` is `n x 1` hard predictions for [`Scorer::needs_pred`]
    /// metrics, probabilities for [`Scorer::needs_proba`] metrics and
    /// `n x q` quantile predictions for pinball loss.
    pub fn score(
        &self,
        y_true: &Array1<f64>,
        y_pred: &Array2<f64>,
        sample_weight: Option<&Array1<f64>>,
        quantile_levels: Option<&[f64]>,
    ) -> Result<f64> {
        if y_pred.ncols() == 0 {
            return Err(KolosalError::ValidationError("prediction matrix has no columns".to_string()));
        }
        let first = y_pred.index_axis(Axis(1), 0);
        let raw = match self {
            Scorer::Accuracy => functions::accuracy(y_true, first, sample_weight)?,
            Scorer::BalancedAccuracy => functions::balanced_accuracy(y_true, first, sample_weight)?,
            Scorer::F1 => functions::f1(y_true, first, sample_weight)?,
            Scorer::RocAuc => {
                let positive = y_pred.index_axis(Axis(1), y_pred.ncols() - 1);
                if y_pred.ncols() > 2 {
                    return Err(KolosalError::ValidationError(
                        "roc_auc is only defined for binary problems".to_string(),
                    ));
                }
                functions::roc_auc(y_true, positive, sample_weight)?
            }
            Scorer::LogLoss => functions::log_loss(y_true, y_pred, sample_weight)?,
            Scorer::RootMeanSquaredError => functions::rmse(y_true, first, sample_weight)?,
            Scorer::MeanAbsoluteError => functions::mae(y_true, first, sample_weight)?,
            Scorer::R2 => functions::r2(y_true, first, sample_weight)?,
            Scorer::PinballLoss => {
                let levels = quantile_levels.ok_or_else(|| {
                    KolosalError::ConfigError("pinball_loss requires quantile levels".to_string())
                })?;
                functions::pinball_loss(y_true, y_pred, levels, sample_weight)?
            }
        };
        Ok(self.sign() * raw)
    }

    /// Score a probability matrix, converting it to hard predictions first when needed
    pub fn score_proba(
        &self,
        y_true: &Array1<f64>,
        proba: &Array2<f64>,
        problem_type: ProblemType,
        decision_threshold: Option<f64>,
        sample_weight: Option<&Array1<f64>>,
        quantile_levels: Option<&[f64]>,
    ) -> Result<f64> {
        if self.needs_pred() {
            let pred = get_pred_from_proba(proba, problem_type, decision_threshold);
            self.score(y_true, &pred, sample_weight, quantile_levels)
        } else {
            self.score(y_true, proba, sample_weight, quantile_levels)
        }
    }

    /// Regret of a score: zero at the optimum, positive otherwise
    pub fn convert_score_to_error(&self, score: f64) -> f64 {
        self.sign() * self.optimum() - score
    }

    /// Pick the binary decision threshold that maximises this metric.
    ///
    /// A coarse grid of `2 * decision_thresholds + 1` points ordered by
    /// distance from 0.5 is searched first, then `secondary` points on each
    /// side of the winner. Ties keep the earlier (closer to 0.5) threshold.
    pub fn calibrate_decision_threshold(
        &self,
        y_true: &Array1<f64>,
        proba: &Array2<f64>,
        sample_weight: Option<&Array1<f64>>,
        decision_thresholds: usize,
        secondary: usize,
    ) -> Result<f64> {
        if !self.needs_class() {
            return Ok(0.5);
        }
        let n = decision_thresholds.max(1);
        let step = 0.5 / n as f64;

        let mut coarse = vec![0.5];
        for i in 1..=n {
            coarse.push(0.5 + step * i as f64);
            coarse.push(0.5 - step * i as f64);
        }

        let (mut best_threshold, best_score) = self.best_threshold(y_true, proba, sample_weight, &coarse)?;

        if secondary > 0 {
            let fine_step = step / (secondary + 1) as f64;
            let mut fine = Vec::with_capacity(2 * secondary);
            for j in 1..=secondary {
                fine.push(best_threshold + fine_step * j as f64);
                fine.push(best_threshold - fine_step * j as f64);
            }
            fine.retain(|t| (0.0..=1.0).contains(t));
            if !fine.is_empty() {
                let (t, s) = self.best_threshold(y_true, proba, sample_weight, &fine)?;
                if s > best_score {
                    best_threshold = t;
                }
            }
        }
        Ok(best_threshold.clamp(0.0, 1.0))
    }

    fn best_threshold(
        &self,
        y_true: &Array1<f64>,
        proba: &Array2<f64>,
        sample_weight: Option<&Array1<f64>>,
        thresholds: &[f64],
    ) -> Result<(f64, f64)> {
        let mut best = (0.5, f64::NEG_INFINITY);
        for &t in thresholds {
            let pred = get_pred_from_proba(proba, ProblemType::Binary, Some(t));
            let s = self.score(y_true, &pred, sample_weight, None)?;
            if s > best.1 {
                best = (t, s);
            }
        }
        Ok(best)
    }
}

impl fmt::Display for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Convert probabilities to hard predictions (`n x 1`), or pass values through.
///
/// Binary: positive-class probability compared against the threshold
/// (default 0.5). Multiclass: arg-max, earliest class on ties. Regression
/// and quantile predictions are returned unchanged.
pub fn get_pred_from_proba(proba: &Array2<f64>, problem_type: ProblemType, decision_threshold: Option<f64>) -> Array2<f64> {
    match problem_type {
        ProblemType::Binary => {
            let threshold = decision_threshold.unwrap_or(0.5);
            let positive = proba.index_axis(Axis(1), proba.ncols().saturating_sub(1));
            positive
                .mapv(|p| if p >= threshold { 1.0 } else { 0.0 })
                .insert_axis(Axis(1))
        }
        ProblemType::Multiclass => proba
            .outer_iter()
            .map(|row| {
                let mut best = 0;
                for (j, &p) in row.iter().enumerate() {
                    if p > row[best] {
                        best = j;
                    }
                }
                best as f64
            })
            .collect::<Array1<f64>>()
            .insert_axis(Axis(1)),
        ProblemType::Regression | ProblemType::Quantile => proba.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_regret_is_zero_at_optimum() {
        assert_relative_eq!(Scorer::Accuracy.convert_score_to_error(1.0), 0.0);
        assert_relative_eq!(Scorer::Accuracy.convert_score_to_error(0.75), 0.25);
        // rmse of 2 scores as -2
        assert_relative_eq!(Scorer::RootMeanSquaredError.convert_score_to_error(-2.0), 2.0);
        assert_relative_eq!(Scorer::LogLoss.convert_score_to_error(-0.3), 0.3);
    }

    #[test]
    fn test_score_is_sign_adjusted() {
        let y = array![1.0, 2.0];
        let p = array![[1.0], [4.0]];
        let s = Scorer::MeanAbsoluteError.score(&y, &p, None, None).unwrap();
        assert_relative_eq!(s, -1.0);
    }

    #[test]
    fn test_pred_from_proba() {
        let binary = array![[0.2], [0.7], [0.5]];
        let pred = get_pred_from_proba(&binary, ProblemType::Binary, None);
        assert_eq!(pred, array![[0.0], [1.0], [1.0]]);
        let pred = get_pred_from_proba(&binary, ProblemType::Binary, Some(0.75));
        assert_eq!(pred, array![[0.0], [0.0], [0.0]]);

        let multi = array![[0.2, 0.5, 0.3], [0.4, 0.4, 0.2]];
        let pred = get_pred_from_proba(&multi, ProblemType::Multiclass, None);
        assert_eq!(pred, array![[1.0], [0.0]]);
    }

    #[test]
    fn test_calibrate_decision_threshold() {
        // Positives all score 0.3-0.4, negatives below 0.25.
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let proba = array![[0.05], [0.1], [0.2], [0.3], [0.35], [0.4]];
        let t = Scorer::Accuracy
            .calibrate_decision_threshold(&y, &proba, None, 10, 4)
            .unwrap();
        assert!(t > 0.2 && t < 0.31, "threshold {}", t);

        let perfect = array![[0.0], [0.0], [0.0], [1.0], [1.0], [1.0]];
        let t = Scorer::Accuracy
            .calibrate_decision_threshold(&y, &perfect, None, 10, 4)
            .unwrap();
        assert_relative_eq!(t, 0.5);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Scorer::from_name("rmse").unwrap(), Scorer::RootMeanSquaredError);
        assert_eq!(Scorer::from_name("ACCURACY").unwrap(), Scorer::Accuracy);
        assert!(Scorer::from_name("nope").is_err());
    }

    #[test]
    fn test_flags() {
        assert!(Scorer::Accuracy.needs_pred() && Scorer::Accuracy.needs_class());
        assert!(Scorer::LogLoss.needs_proba() && !Scorer::LogLoss.needs_class());
        assert!(Scorer::PinballLoss.needs_quantile());
        assert_eq!(Scorer::default_for(ProblemType::Regression), Scorer::RootMeanSquaredError);
    }
}
