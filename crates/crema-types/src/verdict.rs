//! Outcome of validating a parameter set.

use serde::{Deserialize, Serialize};

use crate::params::ParameterSet;

/// A single value projected onto its legal range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampEvent {
    pub parameter: String,
    /// Position inside a profile parameter; `None` for scalars.
    pub point: Option<usize>,
    pub original: f64,
    pub adjusted: f64,
}

impl std::fmt::Display for ClampEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.point {
            Some(i) => write!(
                f,
                "{}[{}] {} -> {}",
                self.parameter, i, self.original, self.adjusted
            ),
            None => write!(f, "{} {} -> {}", self.parameter, self.original, self.adjusted),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyVerdict {
    Accepted(ParameterSet),
    Clamped {
        original: ParameterSet,
        adjusted: ParameterSet,
        adjustments: Vec<ClampEvent>,
    },
    Rejected {
        reason: String,
    },
}

impl SafetyVerdict {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Whether the verdict allows the set to reach the hardware.
    pub fn is_executable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// The parameter set that would actually be brewed.
    pub fn executable(&self) -> Option<&ParameterSet> {
        match self {
            Self::Accepted(set) => Some(set),
            Self::Clamped { adjusted, .. } => Some(adjusted),
            Self::Rejected { .. } => None,
        }
    }

    pub fn adjustments(&self) -> &[ClampEvent] {
        match self {
            Self::Clamped { adjustments, .. } => adjustments,
            _ => &[],
        }
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_views() {
        let set = ParameterSet::new().with_scalar("temperature", 93.0);
        assert_eq!(
            SafetyVerdict::Accepted(set.clone()).executable(),
            Some(&set)
        );

        let clamped = SafetyVerdict::Clamped {
            original: ParameterSet::new().with_scalar("temperature", 150.0),
            adjusted: ParameterSet::new().with_scalar("temperature", 100.0),
            adjustments: vec![ClampEvent {
                parameter: "temperature".into(),
                point: None,
                original: 150.0,
                adjusted: 100.0,
            }],
        };
        assert!(clamped.is_executable());
        assert_eq!(
            clamped.executable().and_then(|s| s.scalar("temperature")),
            Some(100.0)
        );
        assert_eq!(clamped.adjustments()[0].to_string(), "temperature 150 -> 100");

        let rejected = SafetyVerdict::rejected("too hot");
        assert!(!rejected.is_executable());
        assert_eq!(rejected.rejection_reason(), Some("too hot"));
        assert!(rejected.adjustments().is_empty());
    }
}
