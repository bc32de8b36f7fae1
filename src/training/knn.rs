//! K-Nearest Neighbors implementation
//!
//! One model type for every problem: class frequencies for classification,
//! (weighted) neighbor mean for regression and neighbor quantiles for
//! quantile problems. Prediction is parallelized over query rows.

use super::linear_models::Standardizer;
use super::models::{FitData, ModelFactory, ProblemInfo, TrainableModel};
use super::ProblemType;
use crate::error::{KolosalError, Result};
use crate::optimizer::{Configuration, ParameterValue, SearchSpace};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub const FAMILY: &str = "knn";

/// Distance metric for KNN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Euclidean distance (L2)
    #[default]
    Euclidean,
    /// Manhattan distance (L1)
    Manhattan,
}

/// Weighting scheme for neighbors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightScheme {
    /// All neighbors have equal weight
    #[default]
    Uniform,
    /// Closer neighbors have more weight (inverse distance)
    Distance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnModel {
    pub problem_type: ProblemType,
    pub num_classes: usize,
    pub quantile_levels: Option<Vec<f64>>,
    pub n_neighbors: usize,
    pub weights: WeightScheme,
    pub metric: DistanceMetric,
    scaler: Option<Standardizer>,
    x_train: Option<Array2<f64>>,
    y_train: Option<Array1<f64>>,
}

impl KnnModel {
    pub fn new(problem: &ProblemInfo) -> Self {
        Self {
            problem_type: problem.problem_type,
            num_classes: problem.num_classes,
            quantile_levels: problem.quantile_levels.clone(),
            n_neighbors: 5,
            weights: WeightScheme::Uniform,
            metric: DistanceMetric::Euclidean,
            scaler: None,
            x_train: None,
            y_train: None,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.n_neighbors = k;
        self
    }

    pub fn with_weights(mut self, weights: WeightScheme) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    fn neighbor_weight(&self, dist: f64) -> f64 {
        match self.weights {
            WeightScheme::Uniform => 1.0,
            WeightScheme::Distance => 1.0 / (dist + 1e-10),
        }
    }

    fn output_row(&self, neighbors: &[(f64, f64)]) -> Vec<f64> {
        match self.problem_type {
            ProblemType::Binary | ProblemType::Multiclass => {
                let mut counts = vec![0.0; self.num_classes.max(2)];
                let mut total = 0.0;
                for &(dist, label) in neighbors {
                    let w = self.neighbor_weight(dist);
                    let class = (label.round().max(0.0) as usize).min(counts.len() - 1);
                    counts[class] += w;
                    total += w;
                }
                if total > 0.0 {
                    counts.iter_mut().for_each(|c| *c /= total);
                }
                if self.problem_type == ProblemType::Binary {
                    vec![counts[1]]
                } else {
                    counts
                }
            }
            ProblemType::Regression => {
                let (sum, total) = neighbors.iter().fold((0.0, 0.0), |(s, t), &(dist, label)| {
                    let w = self.neighbor_weight(dist);
                    (s + w * label, t + w)
                });
                vec![if total > 0.0 { sum / total } else { 0.0 }]
            }
            ProblemType::Quantile => {
                let mut sorted: Vec<(f64, f64)> = neighbors
                    .iter()
                    .map(|&(dist, label)| (label, self.neighbor_weight(dist)))
                    .collect();
                sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
                let total: f64 = sorted.iter().map(|(_, w)| w).sum();
                self.quantile_levels
                    .as_deref()
                    .unwrap_or(&[0.5])
                    .iter()
                    .map(|&q| {
                        let target = q * total;
                        let mut acc = 0.0;
                        for &(label, w) in &sorted {
                            acc += w;
                            if acc >= target {
                                return label;
                            }
                        }
                        sorted.last().map(|(label, _)| *label).unwrap_or(0.0)
                    })
                    .collect()
            }
        }
    }
}

impl TrainableModel for KnnModel {
    fn family(&self) -> &'static str {
        FAMILY
    }

    /// Stores the standardized training data
    fn fit(&mut self, data: &FitData<'_>) -> Result<()> {
        data.validate()?;
        if self.n_neighbors == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "n_neighbors".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let scaler = Standardizer::fit(data.x);
        self.x_train = Some(scaler.transform(data.x)?);
        self.y_train = Some(data.y.clone());
        self.scaler = Some(scaler);
        Ok(())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (scaler, x_train, y_train) = match (&self.scaler, &self.x_train, &self.y_train) {
            (Some(s), Some(xt), Some(yt)) => (s, xt, yt),
            _ => return Err(KolosalError::ModelNotFitted),
        };
        let x = scaler.transform(x)?;
        let k = self.n_neighbors.min(x_train.nrows());

        let rows: Vec<Vec<f64>> = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let neighbors = find_k_nearest(x.row(i), x_train, y_train, k, self.metric);
                self.output_row(&neighbors)
            })
            .collect();

        let width = rows.first().map(Vec::len).unwrap_or(1);
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Ok(Array2::from_shape_vec((x.nrows(), width), flat)?)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Max-heap entry for partial sort (keeps k smallest distances)
#[derive(PartialEq)]
struct DistLabel(f64, f64);

impl Eq for DistLabel {}
impl PartialOrd for DistLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DistLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Find k nearest neighbors using a max-heap, O(n log k)
fn find_k_nearest(
    point: ArrayView1<'_, f64>,
    x_train: &Array2<f64>,
    y_train: &Array1<f64>,
    k: usize,
    metric: DistanceMetric,
) -> Vec<(f64, f64)> {
    let mut heap = BinaryHeap::with_capacity(k + 1);

    for (i, row) in x_train.rows().into_iter().enumerate() {
        let dist = compute_distance(point, row, metric);
        if heap.len() < k {
            heap.push(DistLabel(dist, y_train[i]));
        } else if let Some(top) = heap.peek() {
            if dist < top.0 {
                heap.pop();
                heap.push(DistLabel(dist, y_train[i]));
            }
        }
    }

    heap.into_sorted_vec().into_iter().map(|dl| (dl.0, dl.1)).collect()
}

fn compute_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>, metric: DistanceMetric) -> f64 {
    match metric {
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b.iter())
            .map(|(ai, bi)| {
                let d = ai - bi;
                d * d
            })
            .sum::<f64>()
            .sqrt(),
        DistanceMetric::Manhattan => a.iter().zip(b.iter()).map(|(ai, bi)| (ai - bi).abs()).sum(),
    }
}

/// Factory for [`KnnModel`]
#[derive(Debug, Clone, Copy, Default)]
pub struct KnnFactory;

impl ModelFactory for KnnFactory {
    fn family(&self) -> &'static str {
        FAMILY
    }

    fn default_search_space(&self, _problem: &ProblemInfo) -> SearchSpace {
        SearchSpace::new()
            .log_int("n_neighbors", 1, 50)
            .with_default("n_neighbors", ParameterValue::Int(5))
            .categorical("weights", vec!["uniform", "distance"])
            .categorical("metric", vec!["euclidean", "manhattan"])
    }

    fn build(&self, config: &Configuration, problem: &ProblemInfo) -> Result<Box<dyn TrainableModel>> {
        let k = config.get_int("n_neighbors", 5);
        if k < 1 {
            return Err(KolosalError::InvalidParameter {
                name: "n_neighbors".to_string(),
                value: k.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let weights = match config.get_str("weights", "uniform") {
            "uniform" => WeightScheme::Uniform,
            "distance" => WeightScheme::Distance,
            other => {
                return Err(KolosalError::InvalidParameter {
                    name: "weights".to_string(),
                    value: other.to_string(),
                    reason: "expected uniform or distance".to_string(),
                })
            }
        };
        let metric = match config.get_str("metric", "euclidean") {
            "euclidean" => DistanceMetric::Euclidean,
            "manhattan" => DistanceMetric::Manhattan,
            other => {
                return Err(KolosalError::InvalidParameter {
                    name: "metric".to_string(),
                    value: other.to_string(),
                    reason: "expected euclidean or manhattan".to_string(),
                })
            }
        };
        Ok(Box::new(
            KnnModel::new(problem)
                .with_k(k as usize)
                .with_weights(weights)
                .with_metric(metric),
        ))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn TrainableModel>> {
        let model: KnnModel = serde_json::from_slice(bytes)?;
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
            quantile_levels: Some(vec![0.0, 1.0]),
            eval_metric: Scorer::default_for(problem_type),
            random_seed: 0,
        }
    }

    #[test]
    fn test_knn_multiclass_proba() {
        let x = array![[0.0], [0.1], [5.0], [5.1], [10.0], [10.1]];
        let y = array![0.0, 0.0, 1.0, 1.0, 2.0, 2.0];
        let mut model = KnnModel::new(&problem(ProblemType::Multiclass, 3)).with_k(2);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let proba = model.predict_proba(&array![[0.05], [9.9]]).unwrap();
        assert_eq!(proba.dim(), (2, 3));
        assert_relative_eq!(proba[[0, 0]], 1.0);
        assert_relative_eq!(proba[[1, 2]], 1.0);
    }

    #[test]
    fn test_knn_binary_is_single_column() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let mut model = KnnModel::new(&problem(ProblemType::Binary, 2)).with_k(4);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let proba = model.predict_proba(&array![[1.5]]).unwrap();
        assert_eq!(proba.dim(), (1, 1));
        assert_relative_eq!(proba[[0, 0]], 0.5);
    }

    #[test]
    fn test_knn_regression_and_quantile() {
        let x = array![[0.0], [1.0], [2.0], [10.0]];
        let y = array![1.0, 2.0, 3.0, 100.0];
        let mut model = KnnModel::new(&problem(ProblemType::Regression, 0)).with_k(3);
        model.fit(&FitData::new(&x, &y)).unwrap();
        assert_relative_eq!(model.predict_proba(&array![[1.0]]).unwrap()[[0, 0]], 2.0);

        let mut model = KnnModel::new(&problem(ProblemType::Quantile, 0)).with_k(3);
        model.fit(&FitData::new(&x, &y)).unwrap();
        let q = model.predict_proba(&array![[1.0]]).unwrap();
        assert_eq!(q.row(0).to_vec(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_k_larger_than_train_set() {
        let x = array![[0.0], [1.0]];
        let y = array![3.0, 5.0];
        let mut model = KnnModel::new(&problem(ProblemType::Regression, 0)).with_k(10);
        model.fit(&FitData::new(&x, &y)).unwrap();
        assert_relative_eq!(model.predict_proba(&array![[0.5]]).unwrap()[[0, 0]], 4.0);
    }

    #[test]
    fn test_factory_rejects_bad_config() {
        let info = problem(ProblemType::Regression, 0);
        let bad = Configuration::new().with("weights", ParameterValue::String("cubic".to_string()));
        assert!(KnnFactory.build(&bad, &info).is_err());
        let default = KnnFactory.default_search_space(&info).default_configuration();
        assert!(KnnFactory.build(&default, &info).is_ok());
    }
}
