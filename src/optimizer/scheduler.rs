//! Trial scheduler driving a [`Searcher`]
//!
//! The scheduler pulls configurations from a searcher, dispatches them to a
//! trainable function as [`TrialRequest`] messages and collects
//! [`TrialOutcome`] messages back. Towards the searcher it honours the
//! following protocol:
//!
//! - `register_pending` before a trial is dispatched
//! - `update` on every reported resource step, not just on completion
//! - `evaluation_failed` when a trial errors or reports nothing
//!
//! Trials run on a dedicated rayon pool of `n_workers` threads. An optional
//! successive-halving rule stops trials whose intermediate reward falls
//! outside the top `1 / reduction_factor` at a rung.

use super::search_space::Configuration;
use super::searcher::{SearchContext, Searcher, TrialMetrics};
use crate::error::{KolosalError, Result};
use crate::utils::{neg_inf_as_null, neg_inf_history_as_null, TimeBudget};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Ordered mapping of trial id to the metrics it reported, step by step
pub type TrainingHistory = BTreeMap<usize, Vec<TrialMetrics>>;

/// When to stop a running trial early
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum StoppingRule {
    /// Every trial runs until it returns
    #[default]
    Fifo,
    /// Asynchronous successive halving over rungs `grace_period * eta^k`
    SuccessiveHalving {
        grace_period: f64,
        reduction_factor: f64,
    },
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of trials to launch
    pub num_trials: usize,
    /// Wall-clock budget in seconds
    pub time_limit: Option<f64>,
    /// Resource level at which a trial is told to stop
    pub max_resource: Option<f64>,
    /// Trials executed concurrently
    pub n_workers: usize,
    pub stopping_rule: StoppingRule,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_trials: 10,
            time_limit: None,
            max_resource: None,
            n_workers: 1,
            stopping_rule: StoppingRule::Fifo,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_trials(mut self, n: usize) -> Self {
        self.num_trials = n;
        self
    }

    pub fn with_time_limit(mut self, secs: f64) -> Self {
        self.time_limit = Some(secs);
        self
    }

    pub fn with_max_resource(mut self, max_resource: f64) -> Self {
        self.max_resource = Some(max_resource);
        self
    }

    pub fn with_n_workers(mut self, n: usize) -> Self {
        self.n_workers = n.max(1);
        self
    }

    pub fn with_successive_halving(mut self, grace_period: f64, reduction_factor: f64) -> Self {
        self.stopping_rule = StoppingRule::SuccessiveHalving {
            grace_period,
            reduction_factor,
        };
        self
    }
}

/// Work sent to a trainable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRequest {
    pub trial_id: usize,
    pub config: Configuration,
    /// Resource level the trial should not exceed
    pub max_resource: Option<f64>,
    /// Seconds left in the scheduler budget at dispatch
    pub time_limit: Option<f64>,
}

/// How a trial ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialStatus {
    Completed,
    /// Stopped early by the stopping rule
    Stopped,
    Failed(String),
}

/// Result sent back by a finished trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub trial_id: usize,
    pub config: Configuration,
    /// Best reward the trial reported, `-inf` if none
    #[serde(with = "neg_inf_as_null")]
    pub reward: f64,
    /// Last reported resource level
    pub resource: Option<f64>,
    pub status: TrialStatus,
    pub elapsed_secs: f64,
}

/// What a trainable should do after reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop,
}

/// Summary of a scheduler run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub best_config: Configuration,
    #[serde(with = "neg_inf_as_null")]
    pub best_reward: f64,
    pub num_trials: usize,
    pub num_failed: usize,
    pub total_time_secs: f64,
    pub trials: Vec<TrialOutcome>,
    #[serde(with = "neg_inf_history_as_null")]
    pub training_history: TrainingHistory,
}

/// Rewards recorded per rung for successive halving
#[derive(Debug, Default)]
struct Rungs {
    levels: Vec<f64>,
    recorded: Vec<Vec<f64>>,
    /// Next rung index each trial has yet to reach
    next_rung: HashMap<usize, usize>,
}

impl Rungs {
    fn new(rule: &StoppingRule, max_resource: Option<f64>) -> Self {
        let mut levels = Vec::new();
        if let StoppingRule::SuccessiveHalving {
            grace_period,
            reduction_factor,
        } = rule
        {
            let eta = reduction_factor.max(1.0 + f64::EPSILON);
            let cap = max_resource.unwrap_or(f64::INFINITY);
            let mut level = grace_period.max(f64::MIN_POSITIVE);
            // Bounded so an unlimited max resource still yields a finite ladder.
            while level < cap && levels.len() < 32 {
                levels.push(level);
                level *= eta;
            }
        }
        let recorded = vec![Vec::new(); levels.len()];
        Self {
            levels,
            recorded,
            next_rung: HashMap::new(),
        }
    }

    /// Record `reward` on every rung newly reached at `resource`
    fn on_report(&mut self, trial_id: usize, resource: f64, reward: f64, eta: f64) -> Decision {
        let mut rung = *self.next_rung.get(&trial_id).unwrap_or(&0);
        let mut decision = Decision::Continue;
        while rung < self.levels.len() && resource >= self.levels[rung] {
            let recorded = &mut self.recorded[rung];
            recorded.push(reward);
            let mut sorted = recorded.clone();
            sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let n_keep = ((sorted.len() as f64 / eta).floor() as usize).max(1);
            if reward < sorted[n_keep - 1] {
                decision = Decision::Stop;
            }
            rung += 1;
            if decision == Decision::Stop {
                break;
            }
        }
        self.next_rung.insert(trial_id, rung);
        decision
    }

    fn first_milestone(&self) -> Option<f64> {
        self.levels.first().copied()
    }
}

/// Handed to a trainable to report intermediate results
pub struct Reporter<'a> {
    scheduler: &'a Scheduler,
    request: &'a TrialRequest,
    best_reward: f64,
    last_resource: Option<f64>,
    num_reports: usize,
    stopped: bool,
}

impl<'a> Reporter<'a> {
    fn new(scheduler: &'a Scheduler, request: &'a TrialRequest) -> Self {
        Self {
            scheduler,
            request,
            best_reward: f64::NEG_INFINITY,
            last_resource: None,
            num_reports: 0,
            stopped: false,
        }
    }

    pub fn trial_id(&self) -> usize {
        self.request.trial_id
    }

    pub fn config(&self) -> &Configuration {
        &self.request.config
    }

    /// Report metrics for one resource step.
    ///
    /// Forwards the metrics to the searcher, appends them to the training
    /// history and returns whether the trial should keep going.
    pub fn report(&mut self, metrics: TrialMetrics) -> Result<Decision> {
        let searcher = &self.scheduler.searcher;
        searcher.update(&self.request.config, &metrics)?;
        let reward = searcher.core().reward_from(&metrics)?;
        let resource = searcher.core().resource_from(&metrics);

        self.scheduler
            .history
            .lock()
            .entry(self.request.trial_id)
            .or_default()
            .push(metrics);

        self.num_reports += 1;
        self.best_reward = self.best_reward.max(reward);
        self.last_resource = resource.or(self.last_resource);

        let mut decision = Decision::Continue;
        if let (Some(r), Some(max)) = (resource, self.request.max_resource) {
            if r >= max {
                decision = Decision::Stop;
            }
        }
        if let (StoppingRule::SuccessiveHalving { reduction_factor, .. }, Some(r)) =
            (&self.scheduler.config.stopping_rule, resource)
        {
            let rung_decision = self
                .scheduler
                .rungs
                .lock()
                .on_report(self.request.trial_id, r, reward, *reduction_factor);
            if rung_decision == Decision::Stop && decision == Decision::Continue {
                debug!(trial_id = self.request.trial_id, resource = r, reward, "Trial stopped at rung");
                self.stopped = true;
                decision = Decision::Stop;
            }
        }
        Ok(decision)
    }

    /// Report a reward (and optional resource level) with the searcher's attribute names
    pub fn report_reward(&mut self, reward: f64, resource: Option<f64>) -> Result<Decision> {
        let metrics = self.scheduler.searcher.core().metrics(reward, resource);
        self.report(metrics)
    }
}

/// Runs trials against a shared searcher
pub struct Scheduler {
    config: SchedulerConfig,
    searcher: Arc<dyn Searcher>,
    history: Mutex<TrainingHistory>,
    outcomes: Mutex<Vec<TrialOutcome>>,
    rungs: Mutex<Rungs>,
    next_trial_id: AtomicUsize,
}

impl Scheduler {
    pub fn new(searcher: Arc<dyn Searcher>, config: SchedulerConfig) -> Self {
        let rungs = Rungs::new(&config.stopping_rule, config.max_resource);
        Self {
            config,
            searcher,
            history: Mutex::new(TrainingHistory::new()),
            outcomes: Mutex::new(Vec::new()),
            rungs: Mutex::new(rungs),
            next_trial_id: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn searcher(&self) -> &Arc<dyn Searcher> {
        &self.searcher
    }

    /// Launch trials until `num_trials` is reached, the time limit runs out
    /// or the search space is exhausted. Blocks until all dispatched trials
    /// have returned.
    pub fn run<F>(&self, trainable: F) -> Result<SchedulerSummary>
    where
        F: Fn(&TrialRequest, &mut Reporter<'_>) -> Result<()> + Send + Sync,
    {
        let start = Instant::now();
        let budget = TimeBudget::new(self.config.time_limit);
        let n_workers = self.config.n_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .build()
            .map_err(|e| KolosalError::ThreadPoolError(e.to_string()))?;
        let milestone = self.rungs.lock().first_milestone().or(self.config.max_resource);

        let mut launched = 0;
        let mut exhausted = false;
        while launched < self.config.num_trials && !exhausted {
            if budget.is_exhausted() {
                info!(launched, "Scheduler time limit reached");
                break;
            }

            let batch_size = (self.config.num_trials - launched).min(n_workers);
            let mut batch = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let trial_id = self.next_trial_id.load(Ordering::SeqCst);
                let context = SearchContext {
                    trial_id: Some(trial_id),
                    milestone,
                };
                match self.searcher.get_config(&context) {
                    Ok(config) => {
                        self.next_trial_id.fetch_add(1, Ordering::SeqCst);
                        batch.push(TrialRequest {
                            trial_id,
                            config,
                            max_resource: self.config.max_resource,
                            time_limit: budget.remaining_secs(),
                        });
                    }
                    Err(KolosalError::SearchSpaceExhausted { retries }) => {
                        info!(retries, launched = launched + batch.len(), "Search space exhausted, ending search");
                        exhausted = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if batch.is_empty() {
                break;
            }
            launched += batch.len();

            for request in &batch {
                self.searcher.register_pending(&request.config, milestone);
            }

            let results: Vec<Result<TrialOutcome>> = pool.install(|| {
                batch
                    .into_par_iter()
                    .map(|request| self.execute(request, &trainable))
                    .collect()
            });
            for result in results {
                let outcome = result?;
                self.outcomes.lock().push(outcome);
            }
        }

        let outcomes = self.outcomes();
        let (best_config, best_reward) = self.searcher.get_best_config_reward();
        let num_failed = outcomes
            .iter()
            .filter(|o| matches!(o.status, TrialStatus::Failed(_)))
            .count();
        info!(
            num_trials = outcomes.len(),
            num_failed,
            best_reward,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Scheduler finished"
        );

        Ok(SchedulerSummary {
            best_config,
            best_reward,
            num_trials: outcomes.len(),
            num_failed,
            total_time_secs: start.elapsed().as_secs_f64(),
            trials: outcomes,
            training_history: self.training_history(),
        })
    }

    /// Run one specific configuration outside of the search loop
    pub fn run_with_config<F>(&self, config: Configuration, trainable: F) -> Result<TrialOutcome>
    where
        F: Fn(&TrialRequest, &mut Reporter<'_>) -> Result<()>,
    {
        let trial_id = self.next_trial_id.fetch_add(1, Ordering::SeqCst);
        let milestone = self.rungs.lock().first_milestone().or(self.config.max_resource);
        self.searcher.register_pending(&config, milestone);
        let request = TrialRequest {
            trial_id,
            config,
            max_resource: self.config.max_resource,
            time_limit: self.config.time_limit,
        };
        let outcome = self.execute(request, &trainable)?;
        self.outcomes.lock().push(outcome.clone());
        Ok(outcome)
    }

    fn execute<F>(&self, request: TrialRequest, trainable: &F) -> Result<TrialOutcome>
    where
        F: Fn(&TrialRequest, &mut Reporter<'_>) -> Result<()>,
    {
        let start = Instant::now();
        let mut reporter = Reporter::new(self, &request);
        let result = trainable(&request, &mut reporter);
        let (reward, resource, num_reports, stopped) = (
            reporter.best_reward,
            reporter.last_resource,
            reporter.num_reports,
            reporter.stopped,
        );

        let status = match result {
            // A reward reported under the wrong name is a programming error.
            Err(e @ KolosalError::MissingRewardAttribute(_)) => return Err(e),
            Err(e) => {
                warn!(trial_id = request.trial_id, config = %request.config, error = %e, "Trial failed");
                self.searcher.evaluation_failed(&request.config);
                TrialStatus::Failed(e.to_string())
            }
            Ok(()) if num_reports == 0 => {
                warn!(trial_id = request.trial_id, "Trial returned without reporting a result");
                self.searcher.evaluation_failed(&request.config);
                TrialStatus::Failed("no result reported".to_string())
            }
            Ok(()) if stopped => TrialStatus::Stopped,
            Ok(()) => TrialStatus::Completed,
        };

        Ok(TrialOutcome {
            trial_id: request.trial_id,
            config: request.config.clone(),
            reward,
            resource,
            status,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }

    pub fn get_best_config(&self) -> Configuration {
        self.searcher.get_best_config()
    }

    pub fn get_best_reward(&self) -> f64 {
        self.searcher.get_best_reward()
    }

    /// Snapshot of every reported step, keyed by trial id
    pub fn training_history(&self) -> TrainingHistory {
        self.history.lock().clone()
    }

    /// Outcomes of all finished trials in completion order
    pub fn outcomes(&self) -> Vec<TrialOutcome> {
        self.outcomes.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::random_searcher::RandomSearcher;
    use crate::optimizer::search_space::SearchSpace;
    use crate::optimizer::searcher::SearcherConfig;

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let space = SearchSpace::new().float("x", -2.0, 2.0);
        let searcher: Arc<dyn Searcher> = Arc::new(RandomSearcher::new(space, SearcherConfig::default()));
        Scheduler::new(searcher, config)
    }

    #[test]
    fn test_run_records_history_and_best() {
        let s = scheduler(SchedulerConfig::default().with_num_trials(8));
        let summary = s
            .run(|req, reporter| {
                let x = req.config.get_float("x", 0.0);
                reporter.report_reward(-(x * x), None)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(summary.num_trials, 8);
        assert_eq!(summary.num_failed, 0);
        assert_eq!(summary.training_history.len(), 8);
        // The default configuration x = 0 is tried first and is optimal.
        assert_eq!(summary.best_reward, 0.0);
        assert_eq!(s.get_best_reward(), 0.0);
        assert_eq!(s.get_best_config().get_float("x", 1.0), 0.0);
    }

    #[test]
    fn test_failed_trial_is_isolated() {
        let s = scheduler(SchedulerConfig::default().with_num_trials(4));
        let summary = s
            .run(|req, reporter| {
                if req.trial_id == 1 {
                    return Err(KolosalError::TrainingError("boom".to_string()));
                }
                reporter.report_reward(1.0, None)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.num_trials, 4);
        assert_eq!(summary.num_failed, 1);
        let failed = summary.trials.iter().find(|t| t.trial_id == 1).unwrap();
        assert!(matches!(failed.status, TrialStatus::Failed(_)));
        assert_eq!(failed.reward, f64::NEG_INFINITY);
    }

    #[test]
    fn test_missing_reward_is_fatal() {
        let s = scheduler(SchedulerConfig::default().with_num_trials(2));
        let result = s.run(|_, reporter| {
            let mut metrics = TrialMetrics::new();
            metrics.insert("accuracy".to_string(), 0.5);
            reporter.report(metrics)?;
            Ok(())
        });
        assert!(matches!(result, Err(KolosalError::MissingRewardAttribute(_))));
    }

    #[test]
    fn test_exhaustion_ends_run() {
        let space = SearchSpace::new().boolean("flag");
        let searcher: Arc<dyn Searcher> = Arc::new(RandomSearcher::new(space, SearcherConfig::default()));
        let s = Scheduler::new(searcher, SchedulerConfig::default().with_num_trials(10));
        let summary = s.run(|_, reporter| reporter.report_reward(0.5, None).map(|_| ())).unwrap();
        assert_eq!(summary.num_trials, 2);
    }

    #[test]
    fn test_parallel_workers() {
        let s = scheduler(SchedulerConfig::default().with_num_trials(12).with_n_workers(4));
        let summary = s
            .run(|req, reporter| {
                reporter.report_reward(req.config.get_float("x", 0.0), None)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.num_trials, 12);
        let mut ids: Vec<usize> = summary.trials.iter().map(|t| t.trial_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_successive_halving_stops_weak_trials() {
        let config = SchedulerConfig::default()
            .with_num_trials(9)
            .with_max_resource(9.0)
            .with_successive_halving(1.0, 3.0);
        let s = scheduler(config);
        let summary = s
            .run(|req, reporter| {
                let x = req.config.get_float("x", 0.0);
                for epoch in 1..=9 {
                    let reward = -(x * x) * 10.0 / epoch as f64;
                    if reporter.report_reward(reward, Some(epoch as f64))? == Decision::Stop {
                        break;
                    }
                }
                Ok(())
            })
            .unwrap();

        let stopped = summary
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Stopped)
            .count();
        assert!(stopped > 0);
        // Every reported step reached the searcher.
        let steps: usize = summary.training_history.values().map(Vec::len).sum();
        assert!(steps >= 9);
    }

    #[test]
    fn test_run_with_config() {
        let s = scheduler(SchedulerConfig::default());
        let config = Configuration::new().with("x", crate::optimizer::ParameterValue::Float(1.5));
        let outcome = s
            .run_with_config(config.clone(), |_, reporter| reporter.report_reward(0.25, None).map(|_| ()))
            .unwrap();
        assert_eq!(outcome.status, TrialStatus::Completed);
        assert_eq!(s.searcher().get_reward(&config), Some(0.25));
        assert_eq!(s.training_history().len(), 1);
    }

    #[test]
    fn test_rung_levels() {
        let rungs = Rungs::new(
            &StoppingRule::SuccessiveHalving {
                grace_period: 1.0,
                reduction_factor: 3.0,
            },
            Some(27.0),
        );
        assert_eq!(rungs.levels, vec![1.0, 3.0, 9.0]);
    }
}
