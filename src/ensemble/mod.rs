//! Ensemble methods module
//!
//! Provides:
//! - Greedy forward ensemble selection with optional threshold calibration
//! - Weighted averaging of base model predictions

mod ensemble_selection;
mod weighted;

pub use ensemble_selection::{CalibrationMode, EnsembleSelection, EnsembleSelectionConfig, TieBreaker};
pub use weighted::{weight_pred_probas, WeightedEnsemble};
