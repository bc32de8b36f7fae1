//! Hyperparameter search
//!
//! Provides:
//! - Search spaces and canonical configurations
//! - The `Searcher` contract with random and TPE implementations
//! - A trial scheduler with optional successive halving

mod search_space;
mod searcher;
mod random_searcher;
mod tpe_searcher;
pub mod scheduler;

pub use search_space::{Configuration, Parameter, ParameterType, ParameterValue, SearchSpace};
pub use searcher::{
    create_searcher, Observation, ResultsMap, SearchContext, Searcher, SearcherConfig, SearcherCore,
    SearcherState, SearcherType, TrialMetrics, DEFAULT_RANDOM_SEED, DEFAULT_RESOURCE_ATTRIBUTE,
    DEFAULT_REWARD_ATTRIBUTE, MAX_RETRIES,
};
pub use random_searcher::RandomSearcher;
pub use tpe_searcher::{TpeConfig, TpeSearcher};
pub use scheduler::{
    Decision, Reporter, Scheduler, SchedulerConfig, SchedulerSummary, StoppingRule, TrainingHistory,
    TrialOutcome, TrialRequest, TrialStatus,
};
