//! Parameter bounds and concrete parameter sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{CremaError, CremaResult};

/// Legal range for one brew parameter.
///
/// A bound with `points > 1` describes a short time series (for example a
/// pressure profile) whose every point shares the same range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub name: String,
    pub min: f64,
    pub max: f64,
    /// Grid spacing for discrete settings such as grinder clicks.
    pub step: Option<f64>,
    #[serde(default = "default_points")]
    pub points: usize,
}

fn default_points() -> usize {
    1
}

impl Bound {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            step: None,
            points: 1,
        }
    }

    pub fn stepped(name: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        Self {
            step: Some(step),
            ..Self::new(name, min, max)
        }
    }

    pub fn profile(name: impl Into<String>, min: f64, max: f64, points: usize) -> Self {
        Self {
            points,
            ..Self::new(name, min, max)
        }
    }

    pub fn is_profile(&self) -> bool {
        self.points > 1
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Check the bound's own invariants.
    pub fn check(&self) -> CremaResult<()> {
        if self.name.trim().is_empty() {
            return Err(CremaError::Config("bound with empty name".into()));
        }
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(CremaError::Config(format!(
                "bound {} has non-finite limits",
                self.name
            )));
        }
        if self.min > self.max {
            return Err(CremaError::Config(format!(
                "bound {}: min {} exceeds max {}",
                self.name, self.min, self.max
            )));
        }
        if let Some(step) = self.step {
            if !(step.is_finite() && step > 0.0) {
                return Err(CremaError::Config(format!(
                    "bound {}: step must be positive, got {step}",
                    self.name
                )));
            }
        }
        if self.points == 0 {
            return Err(CremaError::Config(format!(
                "bound {}: profile needs at least one point",
                self.name
            )));
        }
        Ok(())
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Whether `value` sits on the step grid (always true for continuous bounds).
    pub fn on_grid(&self, value: f64) -> bool {
        match self.step {
            Some(step) => {
                let k = (value - self.min) / step;
                (k - k.round()).abs() < 1e-6
            }
            None => true,
        }
    }

    /// Nearest legal value: clamp into range, then snap to the step grid.
    pub fn nearest_legal(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        match self.step {
            Some(step) => {
                let last = ((self.max - self.min) / step + 1e-9).floor();
                let k = ((clamped - self.min) / step).round().min(last);
                (self.min + k * step).min(self.max)
            }
            None => clamped,
        }
    }
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(f64),
    Profile(Vec<f64>),
}

impl ParameterValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Profile(_) => None,
        }
    }

    /// Flattened view of the value's numbers.
    pub fn values(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Profile(points) => points,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{v:.3}"),
            Self::Profile(points) => {
                let parts: Vec<String> = points.iter().map(|p| format!("{p:.2}")).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// One candidate brew configuration, keyed by parameter name.
///
/// There are no mutating accessors; derive a new set with [`ParameterSet::with`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion returning a new set.
    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_scalar(self, name: impl Into<String>, value: f64) -> Self {
        self.with(name, ParameterValue::Scalar(value))
    }

    pub fn with_profile(self, name: impl Into<String>, points: Vec<f64>) -> Self {
        self.with(name, ParameterValue::Profile(points))
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParameterValue::as_scalar)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, ParameterValue)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
