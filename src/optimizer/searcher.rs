//! Searcher contract
//!
//! A searcher maps the observed `(configuration -> reward)` history to new
//! candidate configurations. Rewards are always "higher is better".
//!
//! Every searcher owns a [`SearcherCore`]: the search space, an ordered
//! results map and a seeded generator, each behind its own mutex. Locks are
//! only held around reads and writes of that shared state, never while a
//! model-based searcher scores candidates.

use super::search_space::{Configuration, SearchSpace};
use super::random_searcher::RandomSearcher;
use super::tpe_searcher::{TpeConfig, TpeSearcher};
use crate::error::{KolosalError, Result};
use crate::utils::neg_inf_as_null;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Metric name that carries the reward in reported metrics
pub const DEFAULT_REWARD_ATTRIBUTE: &str = "validation_performance";
/// Metric name that carries the resource level (epochs, rounds, ...)
pub const DEFAULT_RESOURCE_ATTRIBUTE: &str = "epoch";
/// Seed used when none is configured
pub const DEFAULT_RANDOM_SEED: u64 = 31_415_927;
/// Resampling attempts before giving up on finding a novel configuration
pub const MAX_RETRIES: usize = 100;

/// Metrics reported for one resource step of a trial
pub type TrialMetrics = BTreeMap<String, f64>;

/// Searcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherConfig {
    /// Key of the reward inside reported metrics
    pub reward_attribute: String,
    /// Key of the resource level inside reported metrics
    pub resource_attribute: String,
    /// Seed of the proposal generator
    pub random_seed: u64,
    /// Propose the space's default configuration before exploring
    pub first_is_default: bool,
    /// Resampling attempts in `get_config`
    pub max_retries: usize,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            reward_attribute: DEFAULT_REWARD_ATTRIBUTE.to_string(),
            resource_attribute: DEFAULT_RESOURCE_ATTRIBUTE.to_string(),
            random_seed: DEFAULT_RANDOM_SEED,
            first_is_default: true,
            max_retries: MAX_RETRIES,
        }
    }
}

impl SearcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reward_attribute(mut self, attr: impl Into<String>) -> Self {
        self.reward_attribute = attr.into();
        self
    }

    pub fn with_resource_attribute(mut self, attr: impl Into<String>) -> Self {
        self.resource_attribute = attr.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_first_is_default(mut self, first_is_default: bool) -> Self {
        self.first_is_default = first_is_default;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// One entry of the results map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub config: Configuration,
    /// Best reward seen so far, `-inf` while pending
    #[serde(with = "neg_inf_as_null")]
    pub reward: f64,
}

/// Insertion-ordered map from configuration to best reward so far.
///
/// Keys are [`Configuration::key`], so equal configurations collide
/// regardless of how they were built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Observation>", into = "Vec<Observation>")]
pub struct ResultsMap {
    entries: Vec<Observation>,
    index: HashMap<String, usize>,
}

impl From<Vec<Observation>> for ResultsMap {
    fn from(entries: Vec<Observation>) -> Self {
        let mut map = ResultsMap::default();
        for obs in entries {
            map.record(&obs.config, obs.reward);
        }
        map
    }
}

impl From<ResultsMap> for Vec<Observation> {
    fn from(map: ResultsMap) -> Self {
        map.entries
    }
}

impl ResultsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, config: &Configuration) -> bool {
        self.index.contains_key(&config.key())
    }

    /// Stored reward for `config`
    pub fn get(&self, config: &Configuration) -> Option<f64> {
        self.index.get(&config.key()).map(|&i| self.entries[i].reward)
    }

    /// Insert `config` with a `-inf` reward. Returns false if it was already present.
    pub fn insert_pending(&mut self, config: &Configuration) -> bool {
        let key = config.key();
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(Observation {
            config: config.clone(),
            reward: f64::NEG_INFINITY,
        });
        true
    }

    /// Store `max(existing, reward)` and return the stored value.
    ///
    /// NaN rewards never replace an existing value and are stored as `-inf`.
    pub fn record(&mut self, config: &Configuration, reward: f64) -> f64 {
        let reward = if reward.is_nan() { f64::NEG_INFINITY } else { reward };
        let key = config.key();
        match self.index.get(&key) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                entry.reward = entry.reward.max(reward);
                entry.reward
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(Observation {
                    config: config.clone(),
                    reward,
                });
                reward
            }
        }
    }

    /// Drop `config` from the map, keeping the order of the others
    pub fn remove(&mut self, config: &Configuration) -> Option<f64> {
        let i = self.index.remove(&config.key())?;
        let removed = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(removed.reward)
    }

    /// Arg-max over rewards; the earliest inserted entry wins ties
    pub fn best(&self) -> Option<&Observation> {
        let mut best: Option<&Observation> = None;
        for obs in &self.entries {
            match best {
                Some(b) if obs.reward <= b.reward => {}
                _ => best = Some(obs),
            }
        }
        best
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.entries.iter()
    }
}

/// Context passed to `get_config`
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    /// Id the scheduler will assign to the trial
    pub trial_id: Option<usize>,
    /// Resource level the trial will first report at
    pub milestone: Option<f64>,
}

impl SearchContext {
    pub fn for_trial(trial_id: usize) -> Self {
        Self {
            trial_id: Some(trial_id),
            milestone: None,
        }
    }
}

/// Serializable checkpoint of a searcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherState {
    /// Name of the searcher that produced this state
    pub searcher: String,
    /// Exact generator state, so proposals continue where they left off
    pub rng: Xoshiro256PlusPlus,
    pub results: ResultsMap,
    /// Searcher-specific state such as a surrogate's training cases
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl SearcherState {
    /// Save to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// State shared by every searcher implementation
#[derive(Debug)]
pub struct SearcherCore {
    space: SearchSpace,
    config: SearcherConfig,
    results: Mutex<ResultsMap>,
    rng: Mutex<Xoshiro256PlusPlus>,
}

impl SearcherCore {
    pub fn new(space: SearchSpace, config: SearcherConfig) -> Self {
        let rng = Xoshiro256PlusPlus::seed_from_u64(config.random_seed);
        Self::restore(space, config, rng, ResultsMap::new())
    }

    /// Rebuild from checkpointed parts
    pub fn restore(
        space: SearchSpace,
        config: SearcherConfig,
        rng: Xoshiro256PlusPlus,
        results: ResultsMap,
    ) -> Self {
        Self {
            space,
            config,
            results: Mutex::new(results),
            rng: Mutex::new(rng),
        }
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn config(&self) -> &SearcherConfig {
        &self.config
    }

    /// Draw a configuration; only the generator lock is held
    pub fn sample(&self) -> Configuration {
        let mut rng = self.rng.lock();
        self.space.sample(&mut *rng)
    }

    /// Draw `n` configurations under a single generator lock
    pub fn sample_many(&self, n: usize) -> Vec<Configuration> {
        let mut rng = self.rng.lock();
        (0..n).map(|_| self.space.sample(&mut *rng)).collect()
    }

    /// Default configuration while nothing has been proposed yet, a sample otherwise
    pub fn initial_candidate(&self) -> Configuration {
        let is_first = self.results.lock().is_empty();
        if self.config.first_is_default && is_first {
            self.space.default_configuration()
        } else {
            self.sample()
        }
    }

    /// Claim `config` as pending. Returns false if it was already proposed.
    pub fn reserve(&self, config: &Configuration) -> bool {
        self.results.lock().insert_pending(config)
    }

    /// Reserve `candidate`, resampling until a novel configuration is found.
    pub fn propose_novel<F>(&self, mut candidate: Configuration, mut resample: F) -> Result<Configuration>
    where
        F: FnMut() -> Configuration,
    {
        let max_retries = self.config.max_retries;
        let mut num_tries = 0;
        loop {
            if self.reserve(&candidate) {
                return Ok(candidate);
            }
            if num_tries >= max_retries {
                return Err(KolosalError::SearchSpaceExhausted { retries: max_retries });
            }
            candidate = resample();
            num_tries += 1;
        }
    }

    /// Extract the reward from reported metrics
    pub fn reward_from(&self, metrics: &TrialMetrics) -> Result<f64> {
        metrics
            .get(&self.config.reward_attribute)
            .copied()
            .ok_or_else(|| KolosalError::MissingRewardAttribute(self.config.reward_attribute.clone()))
    }

    /// Extract the resource level, if reported
    pub fn resource_from(&self, metrics: &TrialMetrics) -> Option<f64> {
        metrics.get(&self.config.resource_attribute).copied()
    }

    /// Build a metrics map with the configured attribute names
    pub fn metrics(&self, reward: f64, resource: Option<f64>) -> TrialMetrics {
        let mut metrics = TrialMetrics::new();
        metrics.insert(self.config.reward_attribute.clone(), reward);
        if let Some(r) = resource {
            metrics.insert(self.config.resource_attribute.clone(), r);
        }
        metrics
    }

    /// Record the reported reward, keeping the per-config maximum
    pub fn update(&self, config: &Configuration, metrics: &TrialMetrics) -> Result<f64> {
        let reward = self.reward_from(metrics)?;
        Ok(self.results.lock().record(config, reward))
    }

    pub fn remove(&self, config: &Configuration) -> Option<f64> {
        self.results.lock().remove(config)
    }

    pub fn reward_of(&self, config: &Configuration) -> Option<f64> {
        self.results.lock().get(config)
    }

    /// Best configuration and reward, or `(empty, -inf)` without data
    pub fn best(&self) -> (Configuration, f64) {
        let results = self.results.lock();
        results
            .best()
            .map(|obs| (obs.config.clone(), obs.reward))
            .unwrap_or_else(|| (Configuration::new(), f64::NEG_INFINITY))
    }

    pub fn num_results(&self) -> usize {
        self.results.lock().len()
    }

    pub fn results_snapshot(&self) -> ResultsMap {
        self.results.lock().clone()
    }

    pub fn rng_snapshot(&self) -> Xoshiro256PlusPlus {
        self.rng.lock().clone()
    }

    /// Checkpoint of the shared parts
    pub fn state(&self, searcher: &str, extra: serde_json::Value) -> SearcherState {
        SearcherState {
            searcher: searcher.to_string(),
            rng: self.rng_snapshot(),
            results: self.results_snapshot(),
            extra,
        }
    }

    /// Restore from a checkpoint produced by a searcher named `searcher`
    pub fn from_state(&self, searcher: &str, state: &SearcherState) -> Result<Self> {
        if state.searcher != searcher {
            return Err(KolosalError::ConfigError(format!(
                "cannot restore a '{}' searcher from '{}' state",
                searcher, state.searcher
            )));
        }
        Ok(Self::restore(
            self.space.clone(),
            self.config.clone(),
            state.rng.clone(),
            state.results.clone(),
        ))
    }
}

/// Proposes configurations and absorbs (possibly partial) reward feedback.
///
/// All methods take `&self`; implementations synchronise internally so a
/// scheduler can share one searcher between worker threads.
pub trait Searcher: Send + Sync {
    /// Short identifier stored in checkpoints
    fn name(&self) -> &'static str;

    /// Shared state
    fn core(&self) -> &SearcherCore;

    /// Propose a configuration that has not been proposed before.
    ///
    /// The returned configuration is recorded as pending with a `-inf`
    /// reward. Fails with [`KolosalError::SearchSpaceExhausted`] once no
    /// novel configuration is found within the retry budget.
    fn get_config(&self, context: &SearchContext) -> Result<Configuration>;

    /// Record reported metrics for `config`.
    ///
    /// The reward attribute must be present. The stored reward is the
    /// maximum over all updates for the same configuration.
    fn update(&self, config: &Configuration, metrics: &TrialMetrics) -> Result<()> {
        self.core().update(config, metrics).map(|_| ())
    }

    /// Convenience wrapper around [`Searcher::update`]
    fn update_reward(&self, config: &Configuration, reward: f64, resource: Option<f64>) -> Result<()> {
        let metrics = self.core().metrics(reward, resource);
        self.update(config, &metrics)
    }

    /// Mark `config` as in flight
    fn register_pending(&self, _config: &Configuration, _milestone: Option<f64>) {}

    /// Retract an observation previously passed to `update`
    fn remove_case(&self, _config: &Configuration, _metrics: &TrialMetrics) {}

    /// React to a trial that errored
    fn evaluation_failed(&self, _config: &Configuration) {}

    /// Number of cases a surrogate model is fit on
    fn dataset_size(&self) -> usize {
        0
    }

    fn get_best_config(&self) -> Configuration {
        self.core().best().0
    }

    fn get_best_reward(&self) -> f64 {
        self.core().best().1
    }

    fn get_best_config_reward(&self) -> (Configuration, f64) {
        self.core().best()
    }

    /// Stored reward for `config`
    fn get_reward(&self, config: &Configuration) -> Option<f64> {
        self.core().reward_of(config)
    }

    fn num_results(&self) -> usize {
        self.core().num_results()
    }

    /// Serializable checkpoint
    fn get_state(&self) -> Result<SearcherState>;

    /// New searcher of the same kind, over the same space, restored from `state`
    fn clone_from_state(&self, state: SearcherState) -> Result<Box<dyn Searcher>>;
}

/// Available searcher implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SearcherType {
    /// Uniform random proposals
    #[default]
    Random,
    /// Tree-structured Parzen estimator
    Tpe,
}

/// Create a searcher
pub fn create_searcher(
    searcher_type: SearcherType,
    space: SearchSpace,
    config: SearcherConfig,
) -> Box<dyn Searcher> {
    match searcher_type {
        SearcherType::Random => Box::new(RandomSearcher::new(space, config)),
        SearcherType::Tpe => Box::new(TpeSearcher::new(space, config, TpeConfig::default())),
    }
}
