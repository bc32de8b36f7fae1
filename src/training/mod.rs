//! Model training module
//!
//! Provides the training side of the AutoML core:
//! - [`Learner`]: label cleaning, rare-class thresholds and the `fit()` entry
//! - [`Trainer`]: multi-model orchestration with tuning, bagging and stacking
//! - Model families behind the [`ModelFactory`] / [`TrainableModel`] seam
//!   (linear models and k-nearest neighbors are built in)
//! - Holdout splits, k-fold bagging and permutation-importance feature pruning

mod config;
mod models;
pub mod bagging;
pub mod cross_validation;
pub mod feature_prune;
pub mod knn;
pub mod learner;
pub mod linear_models;
pub mod split;
pub mod trainer;

pub use bagging::{fit_bagged, BaggedFit};
pub use config::{FitOptions, ProblemType, TrainerConfig};
pub use cross_validation::{CVSplit, CVStrategy, CrossValidator};
pub use feature_prune::{permutation_importance, FeatureImportance};
pub use knn::{DistanceMetric, KnnFactory, KnnModel, WeightScheme};
pub use learner::{LabelEncoder, Learner, LearnerConfig};
pub use linear_models::{LinearFactory, LinearModel, Standardizer};
pub use models::{
    BaggingInfo, FitData, FittedModel, ModelFactory, ModelHandle, ModelRegistry, ModelStatus, ModelTemplate,
    ProblemInfo, TrainableModel,
};
pub use split::{
    adjust_threshold_if_necessary, class_counts_descending, generate_train_test_split, train_test_indices,
    ThresholdAdjustment,
};
pub use trainer::{HpoSummary, LeaderboardEntry, Trainer, TrainingData, EQUAL_WEIGHTS_KEY, OPTIMIZED_KEY};
