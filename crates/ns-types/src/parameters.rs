//! Experiment parameters: tunable knobs grouped by category.
//!
//! Every entry is either a fixed value or a domain sampled each time a
//! consumer asks for it. Recognized entries and their defaults:
//!
//! | category    | name               | default                          |
//! |-------------|--------------------|----------------------------------|
//! | `layout`    | `rows`             | int in `1..=3`                   |
//! | `layout`    | `blocks`           | int in `1..=3`                   |
//! | `layout`    | `layers`           | int in `1..=3`                   |
//! | `layer`     | `types`            | one of `Dense`, `Dropout`        |
//! | `layer`     | `dense.units`      | int in `16..=256`                |
//! | `layer`     | `dense.activation` | one of `relu`, `tanh`, `sigmoid` |
//! | `layer`     | `dropout.rate`     | float in `0.0..=0.5`             |
//! | `optimizer` | `learning_rate`    | log-uniform in `1e-4..=1e-1`     |

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ConfigError, NsResult};

pub const LAYOUT: &str = "layout";
pub const LAYER: &str = "layer";
pub const OPTIMIZER: &str = "optimizer";

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
            Self::Json(v) => v.as_i64(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One parameter entry: a fixed value or a sampling domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Parameter {
    Fixed { value: ParameterValue },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl Parameter {
    pub fn int_range(low: i64, high: i64) -> Self {
        Self::IntRange { low, high }
    }

    pub fn float_range(low: f64, high: f64) -> Self {
        Self::FloatRange { low, high }
    }

    pub fn log_uniform(low: f64, high: f64) -> Self {
        Self::LogUniform { low, high }
    }

    pub fn choice<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<serde_json::Value>,
    {
        Self::Choice {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Draw one value. Fixed values return themselves.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Result<ParameterValue, String> {
        match self {
            Parameter::Fixed { value } => Ok(value.clone()),
            Parameter::IntRange { low, high } => {
                if low > high {
                    return Err(format!("empty range {low}..={high}"));
                }
                Ok(ParameterValue::Int(rng.random_range(*low..=*high)))
            }
            Parameter::FloatRange { low, high } => {
                // The span must be finite too, or sampling overflows.
                if !(low <= high && (high - low).is_finite()) {
                    return Err(format!("invalid range {low}..={high}"));
                }
                Ok(ParameterValue::Float(rng.random_range(*low..=*high)))
            }
            Parameter::LogUniform { low, high } => {
                if !(*low > 0.0 && high.is_finite() && low <= high) {
                    return Err(format!("invalid log-uniform range {low}..={high}"));
                }
                let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                Ok(ParameterValue::Float(log_val.exp().clamp(*low, *high)))
            }
            Parameter::Choice { values } => {
                if values.is_empty() {
                    return Err("no choices".to_string());
                }
                let idx = rng.random_range(0..values.len());
                Ok(ParameterValue::Json(values[idx].clone()))
            }
        }
    }
}

impl From<ParameterValue> for Parameter {
    fn from(value: ParameterValue) -> Self {
        Parameter::Fixed { value }
    }
}

impl From<i64> for Parameter {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v).into()
    }
}

impl From<i32> for Parameter {
    fn from(v: i32) -> Self {
        ParameterValue::Int(v.into()).into()
    }
}

impl From<usize> for Parameter {
    fn from(v: usize) -> Self {
        ParameterValue::Int(v as i64).into()
    }
}

impl From<f64> for Parameter {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v).into()
    }
}

impl From<bool> for Parameter {
    fn from(v: bool) -> Self {
        ParameterValue::Json(v.into()).into()
    }
}

impl From<&str> for Parameter {
    fn from(v: &str) -> Self {
        ParameterValue::Json(v.into()).into()
    }
}

impl From<String> for Parameter {
    fn from(v: String) -> Self {
        ParameterValue::Json(v.into()).into()
    }
}

/// Recognized (category, name) pairs with their default values.
pub fn default_parameters() -> Vec<(&'static str, &'static str, Parameter)> {
    vec![
        (LAYOUT, "rows", Parameter::int_range(1, 3)),
        (LAYOUT, "blocks", Parameter::int_range(1, 3)),
        (LAYOUT, "layers", Parameter::int_range(1, 3)),
        (LAYER, "types", Parameter::choice(["Dense", "Dropout"])),
        (LAYER, "dense.units", Parameter::int_range(16, 256)),
        (
            LAYER,
            "dense.activation",
            Parameter::choice(["relu", "tanh", "sigmoid"]),
        ),
        (LAYER, "dropout.rate", Parameter::float_range(0.0, 0.5)),
        (OPTIMIZER, "learning_rate", Parameter::log_uniform(1e-4, 1e-1)),
    ]
}

/// Two-level mapping category → name → parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentParameters {
    use_default_values: bool,
    values: BTreeMap<String, BTreeMap<String, Parameter>>,
}

impl ExperimentParameters {
    /// With `use_default_values` every recognized parameter starts at its
    /// documented default; otherwise the set starts empty.
    pub fn new(use_default_values: bool) -> Self {
        let mut params = Self {
            use_default_values,
            values: BTreeMap::new(),
        };
        if use_default_values {
            for (category, name, value) in default_parameters() {
                params.parameter(category, name, value);
            }
        }
        params
    }

    pub fn uses_default_values(&self) -> bool {
        self.use_default_values
    }

    /// Set or overwrite one entry, creating the category if needed.
    pub fn parameter(
        &mut self,
        category: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Parameter>,
    ) -> &mut Self {
        self.values
            .entry(category.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    /// `parameter("layout", name, value)`.
    pub fn layout_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Parameter>,
    ) -> &mut Self {
        self.parameter(LAYOUT, name, value)
    }

    pub fn contains(&self, category: &str, name: &str) -> bool {
        self.values
            .get(category)
            .is_some_and(|entries| entries.contains_key(name))
    }

    pub fn get(&self, category: &str, name: &str) -> NsResult<&Parameter> {
        self.values
            .get(category)
            .and_then(|entries| entries.get(name))
            .ok_or_else(|| {
                ConfigError::MissingParameter {
                    category: category.to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// All entries of a category in name order.
    pub fn category(&self, category: &str) -> impl Iterator<Item = (&str, &Parameter)> {
        self.values
            .get(category)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn sample<R: Rng>(
        &self,
        category: &str,
        name: &str,
        rng: &mut R,
    ) -> NsResult<ParameterValue> {
        self.get(category, name)?
            .sample(rng)
            .map_err(|message| invalid(category, name, message))
    }

    pub fn sample_int<R: Rng>(
        &self,
        category: &str,
        name: &str,
        rng: &mut R,
    ) -> NsResult<i64> {
        let value = self.sample(category, name, rng)?;
        value
            .as_i64()
            .ok_or_else(|| invalid(category, name, format!("expected an integer, got {value}")))
    }

    pub fn sample_float<R: Rng>(
        &self,
        category: &str,
        name: &str,
        rng: &mut R,
    ) -> NsResult<f64> {
        let value = self.sample(category, name, rng)?;
        value
            .as_f64()
            .ok_or_else(|| invalid(category, name, format!("expected a number, got {value}")))
    }

    pub fn sample_text<R: Rng>(
        &self,
        category: &str,
        name: &str,
        rng: &mut R,
    ) -> NsResult<String> {
        let value = self.sample(category, name, rng)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| invalid(category, name, format!("expected text, got {value}")))
    }
}

impl Default for ExperimentParameters {
    fn default() -> Self {
        Self::new(true)
    }
}

fn invalid(category: &str, name: &str, message: String) -> crate::NsError {
    ConfigError::InvalidParameter {
        category: category.to_string(),
        name: name.to_string(),
        message,
    }
    .into()
}
