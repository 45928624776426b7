//! Loop state that survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crema_optimizer::ParameterSpace;
use crema_types::{BrewContext, RunConfig, TrialHistory};

/// Phase of the optimization loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Proposing,
    Validating,
    Executing,
    Observing,
    Updating,
    Converged,
    BudgetExhausted,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::BudgetExhausted | Self::Aborted)
    }
}

/// Proximate cause of an aborted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    Hardware,
    Timeout,
    Safety,
    ModelFit,
    Persistence,
    Cancelled,
}

impl AbortCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Timeout => "timeout",
            Self::Safety => "safety",
            Self::ModelFit => "model_fit",
            Self::Persistence => "persistence",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Trials,
    Time,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Termination {
    Converged { trials: usize },
    BudgetExhausted { limit: BudgetLimit },
    Aborted { cause: AbortCause, message: String },
}

impl Termination {
    pub fn phase(&self) -> RunPhase {
        match self {
            Self::Converged { .. } => RunPhase::Converged,
            Self::BudgetExhausted { .. } => RunPhase::BudgetExhausted,
            Self::Aborted { .. } => RunPhase::Aborted,
        }
    }

    pub fn abort_cause(&self) -> Option<AbortCause> {
        match self {
            Self::Aborted { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged { trials } => write!(f, "converged after {trials} trials"),
            Self::BudgetExhausted { limit: BudgetLimit::Trials } => {
                f.write_str("trial budget exhausted")
            }
            Self::BudgetExhausted { limit: BudgetLimit::Time } => {
                f.write_str("time budget exhausted")
            }
            Self::Aborted { cause, message } => write!(f, "aborted ({cause}): {message}"),
        }
    }
}

/// Everything the orchestrator needs to continue a run after a restart.
///
/// Only the surrogate's hyperparameters are kept; its fit is rebuilt from the
/// history on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationState {
    pub run_id: String,
    pub phase: RunPhase,
    pub config: RunConfig,
    pub space: ParameterSpace,
    pub history: TrialHistory,
    #[serde(default)]
    pub surrogate: serde_json::Value,
    /// Consecutive failed surrogate fits.
    pub fit_failures: usize,
    /// Consecutive model-driven proposals below the convergence threshold.
    pub low_improvement_streak: usize,
    pub started_at: DateTime<Utc>,
    /// Loop time spent in earlier sessions of this run.
    pub elapsed_secs: f64,
    pub termination: Option<Termination>,
    /// Trial log entries already reflected in this state.
    #[serde(default)]
    pub log_entries: usize,
    /// Attached to every measurement that arrives without its own context.
    #[serde(default)]
    pub brew_context: Option<BrewContext>,
}

impl OptimizationState {
    pub fn new(run_id: impl Into<String>, config: RunConfig, space: ParameterSpace) -> Self {
        Self {
            run_id: run_id.into(),
            phase: RunPhase::Init,
            config,
            space,
            history: TrialHistory::new(),
            surrogate: serde_json::Value::Null,
            fit_failures: 0,
            low_improvement_streak: 0,
            started_at: Utc::now(),
            elapsed_secs: 0.0,
            termination: None,
            log_entries: 0,
            brew_context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_causes_have_stable_names() {
        let names: Vec<&str> = [
            AbortCause::Hardware,
            AbortCause::Timeout,
            AbortCause::Safety,
            AbortCause::ModelFit,
            AbortCause::Persistence,
            AbortCause::Cancelled,
        ]
        .iter()
        .map(AbortCause::as_str)
        .collect();
        assert_eq!(
            names,
            ["hardware", "timeout", "safety", "model_fit", "persistence", "cancelled"]
        );
        assert_eq!(
            serde_json::to_value(AbortCause::ModelFit).unwrap(),
            serde_json::json!("model_fit")
        );
    }

    #[test]
    fn terminal_phases() {
        assert!(RunPhase::Converged.is_terminal());
        assert!(RunPhase::Aborted.is_terminal());
        assert!(!RunPhase::Executing.is_terminal());
        let t = Termination::Aborted {
            cause: AbortCause::Hardware,
            message: "3 consecutive failures".into(),
        };
        assert_eq!(t.phase(), RunPhase::Aborted);
        assert_eq!(t.abort_cause(), Some(AbortCause::Hardware));
        assert_eq!(t.to_string(), "aborted (hardware): 3 consecutive failures");
    }

    #[test]
    fn state_roundtrips_through_json() {
        let state = OptimizationState::new(
            "run-1",
            RunConfig::default(),
            ParameterSpace::espresso_default(),
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: OptimizationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, state.run_id);
        assert_eq!(back.phase, RunPhase::Init);
        assert_eq!(back.space, state.space);
        assert_eq!(back.started_at, state.started_at);
        assert!(back.history.is_empty());
    }
}
