//! Evaluation metrics
//!
//! - [`Scorer`]: named metrics with sign-adjusted scores and regret
//! - [`get_pred_from_proba`]: probabilities to hard predictions
//! - [`functions`]: the raw, weighted metric implementations

pub mod functions;
mod scorer;

pub use scorer::{get_pred_from_proba, Scorer};
