//! Linear models
//!
//! Ridge regression for regression and quantile problems, logistic and
//! softmax regression (L2-regularized, full-batch gradient descent) for
//! classification. Features are standardized before fitting.

use super::models::{FitData, ModelFactory, ProblemInfo, TrainableModel};
use super::ProblemType;
use crate::error::{KolosalError, Result};
use crate::optimizer::{Configuration, ParameterValue, SearchSpace};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const FAMILY: &str = "linear";

/// Per-column mean and scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl Standardizer {
    pub fn fit(x: &Array2<f64>) -> Self {
        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scales = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 && s.is_finite() { s } else { 1.0 });
        Self { means, scales }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.means.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} features", self.means.len()),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok((x - &self.means.view().insert_axis(Axis(0))) / &self.scales.view().insert_axis(Axis(0)))
    }
}

/// Solve the symmetric positive-definite system `a x = b` via Cholesky
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Backward substitution: L^T x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / l[[i, i]];
    }
    Some(x)
}

/// Empirical quantile with linear interpolation
fn quantile_of(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn softmax_rows(z: &mut Array2<f64>) {
    for mut row in z.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
}

/// Ridge / logistic / softmax regression depending on the problem type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub problem_type: ProblemType,
    pub num_classes: usize,
    pub quantile_levels: Option<Vec<f64>>,
    /// L2 regularization strength
    pub alpha: f64,
    /// Gradient descent iterations (classification only)
    pub max_iter: usize,
    pub learning_rate: f64,
    /// Convergence tolerance on the gradient norm
    pub tol: f64,
    scaler: Option<Standardizer>,
    /// `n_features x n_outputs`
    coefficients: Option<Array2<f64>>,
    intercepts: Option<Array1<f64>>,
    /// Residual quantiles added to the ridge prediction
    quantile_offsets: Option<Array1<f64>>,
}

impl LinearModel {
    pub fn new(problem: &ProblemInfo) -> Self {
        Self {
            problem_type: problem.problem_type,
            num_classes: problem.num_classes,
            quantile_levels: problem.quantile_levels.clone(),
            alpha: 1.0,
            max_iter: 200,
            learning_rate: 0.5,
            tol: 1e-6,
            scaler: None,
            coefficients: None,
            intercepts: None,
            quantile_offsets: None,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.coefficients.is_some()
    }

    fn fit_ridge(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        let n_features = x.ncols();
        let y_mean = y.mean().unwrap_or(0.0);
        let y_c = y - y_mean;

        let mut xtx = x.t().dot(x);
        for i in 0..n_features {
            xtx[[i, i]] += self.alpha;
        }
        let xty = x.t().dot(&y_c);
        let w = cholesky_solve(&xtx, &xty)
            .ok_or_else(|| KolosalError::TrainingError("ridge system is not positive definite".to_string()))?;

        if self.problem_type == ProblemType::Quantile {
            let levels = self.quantile_levels.as_ref().ok_or_else(|| {
                KolosalError::ConfigError("quantile problems require quantile_levels".to_string())
            })?;
            let fitted = x.dot(&w) + y_mean;
            let mut residuals: Vec<f64> = (y - &fitted).to_vec();
            residuals.sort_by(|a, b| a.total_cmp(b));
            let mut offsets: Vec<f64> = levels.iter().map(|&q| quantile_of(&residuals, q)).collect();
            // Keep quantile columns monotone in the level
            for i in 1..offsets.len() {
                if offsets[i] < offsets[i - 1] {
                    offsets[i] = offsets[i - 1];
                }
            }
            self.quantile_offsets = Some(Array1::from_vec(offsets));
        }

        self.coefficients = Some(w.insert_axis(Axis(1)));
        self.intercepts = Some(Array1::from_elem(1, y_mean));
        Ok(())
    }

    fn fit_gradient_descent(&mut self, x: &Array2<f64>, y: &Array1<f64>, time_limit: Option<f64>) -> Result<()> {
        let n_samples = x.nrows() as f64;
        let binary = self.problem_type == ProblemType::Binary;
        let n_outputs = if binary { 1 } else { self.num_classes };
        if n_outputs == 0 {
            return Err(KolosalError::ConfigError("classification requires num_classes".to_string()));
        }

        let mut targets = Array2::<f64>::zeros((x.nrows(), n_outputs));
        for (i, &label) in y.iter().enumerate() {
            let class = label.round();
            if class < 0.0 || class as usize >= self.num_classes.max(2) {
                return Err(KolosalError::ValidationError(format!(
                    "label {} outside of {} classes",
                    label, self.num_classes
                )));
            }
            if binary {
                targets[[i, 0]] = class;
            } else {
                targets[[i, class as usize]] = 1.0;
            }
        }

        let start = Instant::now();
        let mut weights = Array2::<f64>::zeros((x.ncols(), n_outputs));
        let mut bias = Array1::<f64>::zeros(n_outputs);
        for iter in 0..self.max_iter {
            let mut probs = x.dot(&weights) + &bias.view().insert_axis(Axis(0));
            if binary {
                probs.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
            } else {
                softmax_rows(&mut probs);
            }

            let errors = probs - &targets;
            let dw = x.t().dot(&errors) / n_samples + &(&weights * self.alpha);
            let db = errors.sum_axis(Axis(0)) / n_samples;

            let grad_norm = (dw.mapv(|v| v * v).sum() + db.mapv(|v| v * v).sum()).sqrt();
            if grad_norm < self.tol {
                break;
            }
            weights.scaled_add(-self.learning_rate, &dw);
            bias.scaled_add(-self.learning_rate, &db);

            if iter % 10 == 9 {
                if let Some(limit) = time_limit {
                    if start.elapsed().as_secs_f64() > limit {
                        break;
                    }
                }
            }
        }

        self.coefficients = Some(weights);
        self.intercepts = Some(bias);
        Ok(())
    }
}

impl TrainableModel for LinearModel {
    fn family(&self) -> &'static str {
        FAMILY
    }

    fn fit(&mut self, data: &FitData<'_>) -> Result<()> {
        data.validate()?;
        if self.alpha.is_nan() || self.alpha <= 0.0 {
            return Err(KolosalError::InvalidParameter {
                name: "alpha".to_string(),
                value: self.alpha.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let scaler = Standardizer::fit(data.x);
        let x = scaler.transform(data.x)?;
        self.scaler = Some(scaler);
        if self.problem_type.is_classification() {
            self.fit_gradient_descent(&x, data.y, data.time_limit)
        } else {
            self.fit_ridge(&x, data.y)
        }
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (scaler, coefficients, intercepts) = match (&self.scaler, &self.coefficients, &self.intercepts) {
            (Some(s), Some(c), Some(b)) => (s, c, b),
            _ => return Err(KolosalError::ModelNotFitted),
        };
        let x = scaler.transform(x)?;
        let mut out = x.dot(coefficients) + &intercepts.view().insert_axis(Axis(0));
        match self.problem_type {
            ProblemType::Binary => out.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            ProblemType::Multiclass => softmax_rows(&mut out),
            ProblemType::Regression => {}
            ProblemType::Quantile => {
                let offsets = self.quantile_offsets.as_ref().ok_or(KolosalError::ModelNotFitted)?;
                let base = out.column(0).to_owned().insert_axis(Axis(1));
                out = &base + &offsets.view().insert_axis(Axis(0));
            }
        }
        Ok(out)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Factory for [`LinearModel`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearFactory;

impl ModelFactory for LinearFactory {
    fn family(&self) -> &'static str {
        FAMILY
    }

    fn default_search_space(&self, problem: &ProblemInfo) -> SearchSpace {
        let space = SearchSpace::new()
            .log_float("alpha", 1e-4, 10.0)
            .with_default("alpha", ParameterValue::Float(1.0));
        if problem.problem_type.is_classification() {
            space
                .int("max_iter", 50, 500)
                .with_default("max_iter", ParameterValue::Int(200))
                .log_float("learning_rate", 0.01, 1.0)
                .with_default("learning_rate", ParameterValue::Float(0.5))
        } else {
            space
        }
    }

    fn build(&self, config: &Configuration, problem: &ProblemInfo) -> Result<Box<dyn TrainableModel>> {
        let max_iter = config.get_int("max_iter", 200);
        if max_iter < 1 {
            return Err(KolosalError::InvalidParameter {
                name: "max_iter".to_string(),
                value: max_iter.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let model = LinearModel::new(problem)
            .with_alpha(config.get_float("alpha", 1.0))
            .with_max_iter(max_iter as usize)
            .with_learning_rate(config.get_float("learning_rate", 0.5));
        Ok(Box::new(model))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn TrainableModel>> {
        let model: LinearModel = serde_json::from_slice(bytes)?;
        Ok(Box::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Scorer;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn problem(problem_type: ProblemType, num_classes: usize) -> ProblemInfo {
        ProblemInfo {
            problem_type,
            num_classes,
            quantile_levels: None,
            eval_metric: Scorer::default_for(problem_type),
            random_seed: 0,
        }
    }

    #[test]
    fn test_ridge_recovers_line() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let y = array![1.0, 3.0, 5.0, 7.0, 9.0];
        let mut model = LinearModel::new(&problem(ProblemType::Regression, 0)).with_alpha(1e-6);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let pred = model.predict_proba(&array![[5.0]]).unwrap();
        assert_relative_eq!(pred[[0, 0]], 11.0, epsilon = 1e-3);
    }

    #[test]
    fn test_logistic_separates() {
        let x = array![[-2.0], [-1.5], [-1.0], [1.0], [1.5], [2.0]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut model = LinearModel::new(&problem(ProblemType::Binary, 2)).with_alpha(1e-3);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let proba = model.predict_proba(&x).unwrap();
        assert_eq!(proba.ncols(), 1);
        assert!(proba[[0, 0]] < 0.5);
        assert!(proba[[5, 0]] > 0.5);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = array![[0.0, 0.0], [0.1, 0.0], [5.0, 0.0], [5.1, 0.1], [0.0, 5.0], [0.1, 5.1]];
        let y = array![0.0, 0.0, 1.0, 1.0, 2.0, 2.0];
        let mut model = LinearModel::new(&problem(ProblemType::Multiclass, 3)).with_alpha(1e-3);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let proba = model.predict_proba(&x).unwrap();
        assert_eq!(proba.dim(), (6, 3));
        for row in proba.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
        assert!(proba[[4, 2]] > proba[[4, 0]]);
    }

    #[test]
    fn test_quantile_columns_are_ordered() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = array![0.5, 1.5, 1.8, 3.4, 3.9, 5.2];
        let mut info = problem(ProblemType::Quantile, 0);
        info.quantile_levels = Some(vec![0.1, 0.5, 0.9]);
        let mut model = LinearModel::new(&info);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let pred = model.predict_proba(&x).unwrap();
        assert_eq!(pred.ncols(), 3);
        for row in pred.rows() {
            assert!(row[0] <= row[1] && row[1] <= row[2]);
        }
    }

    #[test]
    fn test_unfitted_and_bad_labels() {
        let model = LinearModel::new(&problem(ProblemType::Binary, 2));
        assert!(matches!(model.predict_proba(&array![[1.0]]), Err(KolosalError::ModelNotFitted)));

        let mut model = LinearModel::new(&problem(ProblemType::Multiclass, 3));
        let x = array![[0.0], [1.0]];
        assert!(model.fit(&FitData::new(&x, &array![0.0, 7.0])).is_err());
    }

    #[test]
    fn test_factory_roundtrip() {
        let factory = LinearFactory;
        let info = problem(ProblemType::Regression, 0);
        let config = factory.default_search_space(&info).default_configuration();
        let mut model = factory.build(&config, &info).unwrap();
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![0.0, 1.0, 2.0];
        model.fit(&FitData::new(&x, &y)).unwrap();
        let restored = factory.load(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(model.predict_proba(&x).unwrap(), restored.predict_proba(&x).unwrap());
    }
}
