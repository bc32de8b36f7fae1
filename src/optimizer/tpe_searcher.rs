//! Tree-structured Parzen Estimator searcher
//!
//! Observed cases are split into a "good" set (top `gamma` by reward) and a
//! "bad" set. Candidates drawn from the space are ranked by
//! `log l(x) - log g(x)`, where `l` and `g` are per-dimension Parzen
//! densities fit on the good and bad sets. Pending and failed
//! configurations count as bad so the searcher steers away from them.

use super::search_space::{Configuration, Parameter, ParameterType, ParameterValue, SearchSpace};
use super::searcher::{SearchContext, Searcher, SearcherConfig, SearcherCore, SearcherState, TrialMetrics};
use crate::error::{KolosalError, Result};
use crate::utils::neg_inf_as_null;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// TPE tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpeConfig {
    /// Observations required before the density model is used
    pub n_startup_trials: usize,
    /// Random candidates scored per proposal
    pub n_candidates: usize,
    /// Fraction of observations considered good
    pub gamma: f64,
    /// Weight of the uniform prior mixed into every density
    pub prior_weight: f64,
}

impl Default for TpeConfig {
    fn default() -> Self {
        Self {
            n_startup_trials: 10,
            n_candidates: 24,
            gamma: 0.25,
            prior_weight: 1.0,
        }
    }
}

impl TpeConfig {
    pub fn with_n_startup(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    pub fn with_n_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n.max(1);
        self
    }
}

/// One surrogate training case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Case {
    config: Configuration,
    #[serde(with = "neg_inf_as_null")]
    reward: f64,
    resource: Option<f64>,
}

/// Everything the density model is fit on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TpeDataset {
    cases: Vec<Case>,
    pending: Vec<Configuration>,
    failed: Vec<Configuration>,
}

impl TpeDataset {
    /// Latest-fidelity case per configuration, in first-seen order
    fn observations(&self) -> Vec<(Configuration, f64)> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, &Case> = HashMap::new();
        for case in &self.cases {
            let key = case.config.key();
            let replace = match latest.get(&key) {
                None => {
                    order.push(key.clone());
                    true
                }
                Some(prev) => case.resource.unwrap_or(0.0) >= prev.resource.unwrap_or(0.0),
            };
            if replace {
                latest.insert(key, case);
            }
        }
        order
            .iter()
            .filter_map(|k| latest.get(k))
            .map(|c| (c.config.clone(), c.reward))
            .collect()
    }
}

/// Model-based searcher using a tree-structured Parzen estimator
#[derive(Debug)]
pub struct TpeSearcher {
    core: SearcherCore,
    tpe: TpeConfig,
    dataset: Mutex<TpeDataset>,
}

impl TpeSearcher {
    pub const NAME: &'static str = "tpe";

    pub fn new(space: SearchSpace, config: SearcherConfig, tpe: TpeConfig) -> Self {
        Self {
            core: SearcherCore::new(space, config),
            tpe,
            dataset: Mutex::new(TpeDataset::default()),
        }
    }

    /// Rank `candidates` best first
    fn rank_candidates(
        &self,
        candidates: Vec<Configuration>,
        good: &[&Configuration],
        bad: &[&Configuration],
    ) -> Vec<Configuration> {
        let mut scored: Vec<(f64, Configuration)> = candidates
            .into_iter()
            .map(|c| (self.log_ratio(&c, good, bad), c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, c)| c).collect()
    }

    fn log_ratio(&self, candidate: &Configuration, good: &[&Configuration], bad: &[&Configuration]) -> f64 {
        const EPS: f64 = 1e-12;
        self.core
            .space()
            .parameters()
            .iter()
            .filter(|p| p.is_searchable())
            .filter_map(|p| {
                let value = candidate.get(&p.name)?;
                let l = parzen_density(p, value, good, self.tpe.prior_weight);
                let g = parzen_density(p, value, bad, self.tpe.prior_weight);
                Some((l + EPS).ln() - (g + EPS).ln())
            })
            .sum()
    }
}

/// Density of `value` under a Parzen estimator fit on `points`, mixed with a uniform prior
fn parzen_density(param: &Parameter, value: &ParameterValue, points: &[&Configuration], prior_weight: f64) -> f64 {
    let observed: Vec<&ParameterValue> = points.iter().filter_map(|c| c.get(&param.name)).collect();
    let n = observed.len() as f64;

    match &param.param_type {
        ParameterType::Float { .. } | ParameterType::Int { .. } => {
            let x = match param.to_unit(value) {
                Some(x) => x,
                None => return 1.0,
            };
            let units: Vec<f64> = observed.iter().filter_map(|v| param.to_unit(v)).collect();
            let bandwidth = bandwidth(&units);
            let norm = 1.0 / (bandwidth * (2.0 * std::f64::consts::PI).sqrt());
            let kernel_sum: f64 = units
                .iter()
                .map(|u| {
                    let z = (x - u) / bandwidth;
                    norm * (-0.5 * z * z).exp()
                })
                .sum();
            // The uniform prior on [0, 1] has density 1.
            (prior_weight + kernel_sum) / (prior_weight + units.len() as f64)
        }
        _ => {
            let k = param.cardinality().unwrap_or(1).max(1) as f64;
            let count = observed.iter().filter(|v| **v == value).count() as f64;
            (prior_weight / k + count) / (prior_weight + n)
        }
    }
}

/// Scott's rule on the unit interval, clamped to a sane range
fn bandwidth(units: &[f64]) -> f64 {
    if units.len() < 2 {
        return 0.25;
    }
    let n = units.len() as f64;
    let mean = units.iter().sum::<f64>() / n;
    let std = (units.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / n).sqrt();
    (1.06 * std * n.powf(-0.2)).clamp(0.05, 0.5)
}

impl Searcher for TpeSearcher {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &SearcherCore {
        &self.core
    }

    fn get_config(&self, _context: &SearchContext) -> Result<Configuration> {
        let (observations, pending, failed) = {
            let dataset = self.dataset.lock();
            (dataset.observations(), dataset.pending.clone(), dataset.failed.clone())
        };

        if observations.len() < self.tpe.n_startup_trials.max(1) {
            let candidate = self.core.initial_candidate();
            return self.core.propose_novel(candidate, || self.core.sample());
        }

        let mut sorted = observations;
        sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let n_good = ((sorted.len() as f64 * self.tpe.gamma).ceil() as usize).clamp(1, sorted.len());
        let good: Vec<&Configuration> = sorted[..n_good].iter().map(|(c, _)| c).collect();
        let bad: Vec<&Configuration> = sorted[n_good..]
            .iter()
            .map(|(c, _)| c)
            .chain(pending.iter())
            .chain(failed.iter())
            .collect();

        let candidates = self.core.sample_many(self.tpe.n_candidates);
        for candidate in self.rank_candidates(candidates, &good, &bad) {
            if self.core.reserve(&candidate) {
                return Ok(candidate);
            }
        }

        debug!(searcher = Self::NAME, "All ranked candidates already proposed, falling back to random");
        let candidate = self.core.sample();
        self.core.propose_novel(candidate, || self.core.sample())
    }

    fn update(&self, config: &Configuration, metrics: &TrialMetrics) -> Result<()> {
        let reward = self.core.reward_from(metrics)?;
        let reward = if reward.is_nan() { f64::NEG_INFINITY } else { reward };
        let resource = self.core.resource_from(metrics);
        self.core.update(config, metrics)?;

        let key = config.key();
        let mut dataset = self.dataset.lock();
        dataset.pending.retain(|c| c.key() != key);
        match dataset
            .cases
            .iter_mut()
            .find(|c| c.resource == resource && c.config.key() == key)
        {
            Some(case) => case.reward = reward,
            None => dataset.cases.push(Case {
                config: config.clone(),
                reward,
                resource,
            }),
        }
        Ok(())
    }

    fn register_pending(&self, config: &Configuration, _milestone: Option<f64>) {
        let key = config.key();
        let mut dataset = self.dataset.lock();
        if !dataset.pending.iter().any(|c| c.key() == key) {
            dataset.pending.push(config.clone());
        }
    }

    fn remove_case(&self, config: &Configuration, metrics: &TrialMetrics) {
        let key = config.key();
        let resource = self.core.resource_from(metrics);
        let mut dataset = self.dataset.lock();
        dataset
            .cases
            .retain(|c| !(c.config.key() == key && (resource.is_none() || c.resource == resource)));
    }

    fn evaluation_failed(&self, config: &Configuration) {
        let key = config.key();
        let mut dataset = self.dataset.lock();
        dataset.pending.retain(|c| c.key() != key);
        if !dataset.failed.iter().any(|c| c.key() == key) {
            dataset.failed.push(config.clone());
        }
    }

    fn dataset_size(&self) -> usize {
        self.dataset.lock().cases.len()
    }

    fn get_state(&self) -> Result<SearcherState> {
        let extra = serde_json::to_value(&*self.dataset.lock())?;
        Ok(self.core.state(Self::NAME, extra))
    }

    fn clone_from_state(&self, state: SearcherState) -> Result<Box<dyn Searcher>> {
        let core = self.core.from_state(Self::NAME, &state)?;
        let dataset: TpeDataset = if state.extra.is_null() {
            TpeDataset::default()
        } else {
            serde_json::from_value(state.extra.clone())
                .map_err(|e| KolosalError::SerializationError(format!("invalid tpe state: {}", e)))?
        };
        Ok(Box::new(Self {
            core,
            tpe: self.tpe.clone(),
            dataset: Mutex::new(dataset),
        }))
    }
}
