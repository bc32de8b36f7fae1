//! Utility functions and types

pub mod arrays;

pub use arrays::{class_counts, concat_columns, concat_rows, label_key, select_columns, select_labels, select_rows};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Wall-clock budget measured from the moment it is created
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    start: Instant,
    limit: Option<Duration>,
}

impl TimeBudget {
    /// Start a budget of `limit_secs` seconds, or an unlimited one for `None`.
    ///
    /// Non-positive limits produce an already exhausted budget. Limits too
    /// large for a [`Duration`], infinity and NaN are treated as unlimited.
    pub fn new(limit_secs: Option<f64>) -> Self {
        let limit = limit_secs.and_then(|s| {
            if s.is_nan() {
                None
            } else {
                Duration::try_from_secs_f64(s.max(0.0)).ok()
            }
        });
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Seconds left, `None` when unlimited. May be negative once overrun.
    pub fn remaining_secs(&self) -> Option<f64> {
        self.limit
            .map(|l| l.as_secs_f64() - self.start.elapsed().as_secs_f64())
    }

    pub fn limit_secs(&self) -> Option<f64> {
        self.limit.map(|l| l.as_secs_f64())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_secs().map(|r| r <= 0.0).unwrap_or(false)
    }
}

/// Serde adapter storing non-finite floats as `null`.
///
/// JSON has no infinity, and pending rewards are `-inf`.
pub mod neg_inf_as_null {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

/// `-inf` for NaN, leaving every other value alone.
///
/// Scores are higher-is-better, so a NaN score ranks as the worst possible.
pub fn nan_to_neg_inf(value: f64) -> f64 {
    if value.is_nan() {
        f64::NEG_INFINITY
    } else {
        value
    }
}

/// [`neg_inf_as_null`] for every value of a map
pub mod neg_inf_map_as_null {
    use super::*;

    pub fn serialize<K, S>(map: &BTreeMap<K, f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(k, v)| (k, v.is_finite().then_some(*v))))
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, f64>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<K, Option<f64>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(f64::NEG_INFINITY)))
            .collect())
    }
}

/// [`neg_inf_as_null`] for per-trial metric histories
pub mod neg_inf_history_as_null {
    use super::*;

    type History = BTreeMap<usize, Vec<BTreeMap<String, f64>>>;

    pub fn serialize<S: Serializer>(history: &History, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(history.iter().map(|(trial, steps)| {
            let steps: Vec<BTreeMap<&String, Option<f64>>> = steps
                .iter()
                .map(|step| step.iter().map(|(k, v)| (k, v.is_finite().then_some(*v))).collect())
                .collect();
            (trial, steps)
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<History, D::Error> {
        let raw = BTreeMap::<usize, Vec<BTreeMap<String, Option<f64>>>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(trial, steps)| {
                let steps = steps
                    .into_iter()
                    .map(|step| {
                        step.into_iter()
                            .map(|(k, v)| (k, v.unwrap_or(f64::NEG_INFINITY)))
                            .collect()
                    })
                    .collect();
                (trial, steps)
            })
            .collect())
    }
}
