//! Search space definition for hyperparameters
//!
//! A [`SearchSpace`] is an ordered list of named dimensions. Sampling it
//! yields a [`Configuration`]: every dimension resolved to a concrete
//! [`ParameterValue`]. Configurations serialize canonically (sorted keys)
//! so that [`Configuration::key`] can be used as a map key by searchers.

use crate::error::{KolosalError, Result};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Type of parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterType {
    /// Continuous float parameter
    Float {
        low: f64,
        high: f64,
        log_scale: bool,
    },
    /// Integer parameter (inclusive bounds)
    Int {
        low: i64,
        high: i64,
        log_scale: bool,
    },
    /// Categorical parameter
    Categorical { choices: Vec<String> },
    /// Boolean parameter
    Boolean,
    /// A constant that is carried into every configuration but never searched
    Fixed(ParameterValue),
}

/// A single hyperparameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParameterType,
    /// Value used for the baseline configuration
    #[serde(default)]
    pub default: Option<ParameterValue>,
}

impl Parameter {
    fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            default: None,
        }
    }

    /// Create a float parameter
    pub fn float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self::new(name, ParameterType::Float { low, high, log_scale: false })
    }

    /// Create a log-scale float parameter
    pub fn log_float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self::new(name, ParameterType::Float { low, high, log_scale: true })
    }

    /// Create an integer parameter
    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self::new(name, ParameterType::Int { low, high, log_scale: false })
    }

    /// Create a log-scale integer parameter
    pub fn log_int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self::new(name, ParameterType::Int { low, high, log_scale: true })
    }

    /// Create a categorical parameter
    pub fn categorical(name: impl Into<String>, choices: Vec<&str>) -> Self {
        Self::new(
            name,
            ParameterType::Categorical {
                choices: choices.into_iter().map(String::from).collect(),
            },
        )
    }

    /// Create a boolean parameter
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParameterType::Boolean)
    }

    /// Create a constant parameter
    pub fn fixed(name: impl Into<String>, value: ParameterValue) -> Self {
        Self::new(name, ParameterType::Fixed(value))
    }

    /// Set the baseline value
    pub fn with_default(mut self, value: ParameterValue) -> Self {
        self.default = Some(value);
        self
    }

    /// True if sampling this parameter can produce more than one value
    pub fn is_searchable(&self) -> bool {
        match &self.param_type {
            ParameterType::Float { low, high, .. } => high > low,
            ParameterType::Int { low, high, .. } => high > low,
            ParameterType::Categorical { choices } => choices.len() > 1,
            ParameterType::Boolean => true,
            ParameterType::Fixed(_) => false,
        }
    }

    /// Sample a random value
    pub fn sample(&self, rng: &mut impl Rng) -> ParameterValue {
        match &self.param_type {
            ParameterType::Float { low, high, log_scale } => {
                let val = if *log_scale {
                    let log_low = low.ln();
                    let log_high = high.ln();
                    (rng.gen::<f64>() * (log_high - log_low) + log_low).exp()
                } else {
                    rng.gen::<f64>() * (high - low) + low
                };
                ParameterValue::Float(val.clamp(*low, *high))
            }
            ParameterType::Int { low, high, log_scale } => {
                let val = if *log_scale {
                    let log_low = ((*low).max(1) as f64).ln();
                    let log_high = ((*high).max(1) as f64 + 1.0).ln();
                    ((rng.gen::<f64>() * (log_high - log_low) + log_low).exp().floor() as i64)
                        .clamp(*low, *high)
                } else {
                    rng.gen_range(*low..=*high)
                };
                ParameterValue::Int(val)
            }
            ParameterType::Categorical { choices } => {
                let idx = rng.gen_range(0..choices.len());
                ParameterValue::String(choices[idx].clone())
            }
            ParameterType::Boolean => ParameterValue::Bool(rng.gen()),
            ParameterType::Fixed(value) => value.clone(),
        }
    }

    /// Baseline value: explicit default, else the (geometric) midpoint or first choice
    pub fn default_value(&self) -> ParameterValue {
        if let Some(value) = &self.default {
            return value.clone();
        }
        match &self.param_type {
            ParameterType::Float { low, high, log_scale } => {
                if *log_scale {
                    ParameterValue::Float(((low.ln() + high.ln()) / 2.0).exp())
                } else {
                    ParameterValue::Float((low + high) / 2.0)
                }
            }
            ParameterType::Int { low, high, log_scale } => {
                let mid = if *log_scale && *low > 0 {
                    (((*low as f64).ln() + (*high as f64).ln()) / 2.0).exp().round() as i64
                } else {
                    ((*low as f64 + *high as f64) / 2.0).round() as i64
                };
                ParameterValue::Int(mid.clamp(*low, *high))
            }
            ParameterType::Categorical { choices } => {
                ParameterValue::String(choices.first().cloned().unwrap_or_default())
            }
            ParameterType::Boolean => ParameterValue::Bool(false),
            ParameterType::Fixed(value) => value.clone(),
        }
    }

    /// Check that `value` lies inside this dimension
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (&self.param_type, value) {
            (ParameterType::Float { low, high, .. }, v) => v
                .as_float()
                .map(|f| f >= *low && f <= *high)
                .unwrap_or(false),
            (ParameterType::Int { low, high, .. }, ParameterValue::Int(v)) => v >= low && v <= high,
            (ParameterType::Categorical { choices }, ParameterValue::String(s)) => {
                choices.iter().any(|c| c == s)
            }
            (ParameterType::Boolean, ParameterValue::Bool(_)) => true,
            (ParameterType::Fixed(expected), v) => expected == v,
            _ => false,
        }
    }

    /// Position of `value` mapped into [0, 1] (log-space for log dimensions).
    ///
    /// Returns `None` for categorical-like dimensions.
    pub fn to_unit(&self, value: &ParameterValue) -> Option<f64> {
        let (low, high, log_scale) = match &self.param_type {
            ParameterType::Float { low, high, log_scale } => (*low, *high, *log_scale),
            ParameterType::Int { low, high, log_scale } => (*low as f64, *high as f64, *log_scale),
            _ => return None,
        };
        let v = value.as_float()?;
        if high <= low {
            return Some(0.5);
        }
        let unit = if log_scale && low > 0.0 {
            (v.ln() - low.ln()) / (high.ln() - low.ln())
        } else {
            (v - low) / (high - low)
        };
        Some(unit.clamp(0.0, 1.0))
    }

    /// Number of distinct values, `None` for continuous dimensions
    pub fn cardinality(&self) -> Option<u128> {
        match &self.param_type {
            ParameterType::Float { low, high, .. } => (high <= low).then_some(1),
            ParameterType::Int { low, high, .. } => Some((high - low).max(0) as u128 + 1),
            ParameterType::Categorical { choices } => Some(choices.len() as u128),
            ParameterType::Boolean => Some(2),
            ParameterType::Fixed(_) => Some(1),
        }
    }
}

/// Sampled parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    String(String),
    Bool(bool),
}

impl ParameterValue {
    /// Get as float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as int
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            ParameterValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            ParameterValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::String(v) => write!(f, "{}", v),
            ParameterValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// A fully resolved assignment of values to hyperparameter names.
///
/// Backed by a `BTreeMap`, so iteration and serialization order never
/// depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, ParameterValue>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) -> Option<ParameterValue> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    /// Float value or `default` when missing
    pub fn get_float(&self, name: &str, default: f64) -> f64 {
        self.get(name).and_then(ParameterValue::as_float).unwrap_or(default)
    }

    /// Integer value or `default` when missing
    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(ParameterValue::as_int).unwrap_or(default)
    }

    /// String value or `default` when missing
    pub fn get_str<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).and_then(ParameterValue::as_string).unwrap_or(default)
    }

    /// Bool value or `default` when missing
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(ParameterValue::as_bool).unwrap_or(default)
    }

    /// Canonical serialization used as a results-map key.
    ///
    /// Two configurations with equal contents always produce the same key.
    pub fn key(&self) -> String {
        // Serializing a BTreeMap of plain values cannot fail.
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl FromIterator<(String, ParameterValue)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

/// Search space for hyperparameter optimization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    parameters: Vec<Parameter>,
}

impl SearchSpace {
    /// Create a new empty search space
    pub fn new() -> Self {
        Self { parameters: Vec::new() }
    }

    /// Add a parameter to the search space, replacing one with the same name
    pub fn add(mut self, param: Parameter) -> Self {
        self.parameters.retain(|p| p.name != param.name);
        self.parameters.push(param);
        self
    }

    /// Add a float parameter
    pub fn float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(Parameter::float(name, low, high))
    }

    /// Add a log-scale float parameter
    pub fn log_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(Parameter::log_float(name, low, high))
    }

    /// Add an integer parameter
    pub fn int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(Parameter::int(name, low, high))
    }

    /// Add a log-scale integer parameter
    pub fn log_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(Parameter::log_int(name, low, high))
    }

    /// Add a categorical parameter
    pub fn categorical(self, name: impl Into<String>, choices: Vec<&str>) -> Self {
        self.add(Parameter::categorical(name, choices))
    }

    /// Add a boolean parameter
    pub fn boolean(self, name: impl Into<String>) -> Self {
        self.add(Parameter::boolean(name))
    }

    /// Add a constant
    pub fn fixed(self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.add(Parameter::fixed(name, value))
    }

    /// Set the baseline value of an existing parameter
    pub fn with_default(mut self, name: &str, value: ParameterValue) -> Self {
        if let Some(p) = self.parameters.iter_mut().find(|p| p.name == name) {
            p.default = Some(value);
        }
        self
    }

    /// Get all parameters
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Look up a parameter by name
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Sample a random configuration
    pub fn sample(&self, rng: &mut impl Rng) -> Configuration {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.sample(rng)))
            .collect()
    }

    /// The baseline configuration tried before any exploration
    pub fn default_configuration(&self) -> Configuration {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.default_value()))
            .collect()
    }

    /// Check that every dimension is present and in range
    pub fn validate(&self, config: &Configuration) -> Result<()> {
        for p in &self.parameters {
            let value = config.get(&p.name).ok_or_else(|| {
                KolosalError::ValidationError(format!("configuration is missing '{}'", p.name))
            })?;
            if !p.contains(value) {
                return Err(KolosalError::InvalidParameter {
                    name: p.name.clone(),
                    value: value.to_string(),
                    reason: "outside of the search space".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Total number of distinct configurations for fully discrete spaces
    pub fn cardinality(&self) -> Option<u128> {
        self.parameters
            .iter()
            .try_fold(1u128, |acc, p| p.cardinality().map(|c| acc.saturating_mul(c)))
    }

    /// True when no dimension can vary
    pub fn is_fixed(&self) -> bool {
        !self.parameters.iter().any(Parameter::is_searchable)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Get parameter names in order
    pub fn param_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_search_space_builder() {
        let space = SearchSpace::new()
            .float("learning_rate", 0.001, 0.1)
            .int("n_estimators", 10, 1000)
            .categorical("model", vec!["rf", "gbm", "linear"])
            .boolean("early_stopping");

        assert_eq!(space.len(), 4);
        assert!(!space.is_fixed());
        assert_eq!(space.cardinality(), None);
    }

    #[test]
    fn test_sample_resolves_every_key() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let space = SearchSpace::new()
            .log_float("alpha", 1e-4, 10.0)
            .int("k", 1, 30)
            .categorical("weights", vec!["uniform", "distance"])
            .fixed("solver", ParameterValue::String("gd".into()));

        for _ in 0..50 {
            let config = space.sample(&mut rng);
            assert_eq!(config.len(), 4);
            space.validate(&config).unwrap();
        }
    }

    #[test]
    fn test_default_configuration() {
        let space = SearchSpace::new()
            .float("a", 0.0, 1.0)
            .log_float("b", 0.01, 1.0)
            .int("c", 1, 9)
            .categorical("d", vec!["x", "y"])
            .boolean("e")
            .with_default("c", ParameterValue::Int(3));

        let config = space.default_configuration();
        assert_eq!(config.get_float("a", -1.0), 0.5);
        assert!((config.get_float("b", -1.0) - 0.1).abs() < 1e-12);
        assert_eq!(config.get_int("c", -1), 3);
        assert_eq!(config.get_str("d", ""), "x");
        assert!(!config.get_bool("e", true));
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = Configuration::new()
            .with("x", ParameterValue::Int(1))
            .with("y", ParameterValue::String("z".into()));
        let b = Configuration::new()
            .with("y", ParameterValue::String("z".into()))
            .with("x", ParameterValue::Int(1));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), a.clone().with("x", ParameterValue::Int(2)).key());
    }

    #[test]
    fn test_cardinality_of_discrete_space() {
        let space = SearchSpace::new()
            .int("k", 1, 3)
            .boolean("flag")
            .categorical("c", vec!["a", "b", "c"]);
        assert_eq!(space.cardinality(), Some(18));
        assert!(SearchSpace::new().fixed("x", ParameterValue::Int(1)).is_fixed());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let space = SearchSpace::new().int("k", 1, 3);
        let bad = Configuration::new().with("k", ParameterValue::Int(7));
        assert!(space.validate(&bad).is_err());
        assert!(space.validate(&Configuration::new()).is_err());
    }

    #[test]
    fn test_log_int_stays_in_bounds() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let param = Parameter::log_int("n", 1, 100);
        for _ in 0..200 {
            let v = param.sample(&mut rng).as_int().unwrap();
            assert!((1..=100).contains(&v));
        }
    }
}
