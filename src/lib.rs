//! Kolosal Tabular - AutoML core for tabular data
//!
//! This crate provides the search, training and ensembling engine of a
//! tabular AutoML system:
//! - Hyperparameter searchers (random, TPE) behind a common contract
//! - A trial scheduler with time budgets and successive halving
//! - Multi-model training with failure isolation, k-fold bagging and stacking
//! - Greedy forward ensemble selection with decision threshold calibration
//!
//! # Modules
//!
//! - [`optimizer`] - Search spaces, searchers and the trial scheduler
//! - [`training`] - Learner, trainer, model families, splits and bagging
//! - [`ensemble`] - Ensemble selection and weighted ensembles
//! - [`metrics`] - Evaluation metrics and prediction helpers
//! - [`utils`] - Time budgets and array helpers

// Core error handling
pub mod error;

// Search and training
pub mod optimizer;
pub mod training;
pub mod ensemble;
pub mod metrics;

// Utilities
pub mod utils;

pub use error::{KolosalError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{KolosalError, Result};

    // Hyperparameter search
    pub use crate::optimizer::{
        create_searcher, Configuration, ParameterValue, Scheduler, SchedulerConfig, SearchSpace, Searcher,
        SearcherConfig, SearcherType,
    };

    // Training
    pub use crate::training::{
        FitOptions, Learner, LearnerConfig, ModelFactory, ModelRegistry, ProblemType, TrainableModel, Trainer,
        TrainerConfig,
    };

    // Ensemble
    pub use crate::ensemble::{EnsembleSelection, EnsembleSelectionConfig, WeightedEnsemble};

    // Metrics
    pub use crate::metrics::Scorer;
}
