//! Run configuration (the control surface of an optimization run).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{CremaError, CremaResult};

/// What to do when a brew exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Record a failed trial and continue with the next proposal.
    #[default]
    RecordFailure,
    /// Stop the run; used when an interrupted brew could stress the machine.
    Abort,
}

/// Scoring rule used to rank candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKind {
    #[default]
    ExpectedImprovement,
    UpperConfidenceBound,
    ProbabilityOfImprovement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_trials: usize,
    #[serde(with = "duration_secs_opt")]
    pub time_budget: Option<Duration>,
    pub min_trials_before_model: usize,
    /// Expected improvement (reward units) below which an iteration counts
    /// toward convergence.
    pub convergence_threshold: f64,
    pub convergence_patience: usize,
    pub exploration_weight: f64,
    /// Allow proposals inside flagged failure regions.
    pub safety_override: bool,

    #[serde(with = "duration_secs")]
    pub trial_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub max_proposal_retries: usize,
    pub consecutive_failure_threshold: usize,
    /// Reward assigned to failed trials. `None` leaves them unrewarded.
    pub failure_penalty: Option<f64>,
    pub max_fit_failures: usize,
    /// Project out-of-range values onto their bounds instead of rejecting.
    pub allow_clamping: bool,
    pub acquisition: AcquisitionKind,
    pub candidate_count: usize,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_trials: 30,
            time_budget: None,
            min_trials_before_model: 5,
            convergence_threshold: 0.01,
            convergence_patience: 3,
            exploration_weight: 0.1,
            safety_override: false,
            trial_timeout: Duration::from_secs(120),
            timeout_policy: TimeoutPolicy::RecordFailure,
            max_proposal_retries: 5,
            consecutive_failure_threshold: 3,
            failure_penalty: None,
            max_fit_failures: 3,
            allow_clamping: true,
            acquisition: AcquisitionKind::ExpectedImprovement,
            candidate_count: 512,
            seed: 0,
        }
    }
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> CremaResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CremaResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> CremaResult<()> {
        if self.max_trials == 0 {
            return Err(CremaError::Config("max_trials must be at least 1".into()));
        }
        if self.min_trials_before_model < 2 {
            return Err(CremaError::Config(
                "min_trials_before_model must be at least 2".into(),
            ));
        }
        if !(self.convergence_threshold.is_finite() && self.convergence_threshold >= 0.0) {
            return Err(CremaError::Config(format!(
                "convergence_threshold must be non-negative, got {}",
                self.convergence_threshold
            )));
        }
        if self.convergence_patience == 0 {
            return Err(CremaError::Config(
                "convergence_patience must be at least 1".into(),
            ));
        }
        if !(self.exploration_weight.is_finite() && self.exploration_weight >= 0.0) {
            return Err(CremaError::Config(format!(
                "exploration_weight must be non-negative, got {}",
                self.exploration_weight
            )));
        }
        if self.trial_timeout.is_zero() {
            return Err(CremaError::Config("trial_timeout must be positive".into()));
        }
        if self.consecutive_failure_threshold == 0 {
            return Err(CremaError::Config(
                "consecutive_failure_threshold must be at least 1".into(),
            ));
        }
        if self.candidate_count == 0 {
            return Err(CremaError::Config("candidate_count must be at least 1".into()));
        }
        if let Some(p) = self.failure_penalty {
            if !p.is_finite() {
                return Err(CremaError::Config("failure_penalty must be finite".into()));
            }
        }
        Ok(())
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_min_trials_before_model(mut self, n: usize) -> Self {
        self.min_trials_before_model = n;
        self
    }

    pub fn with_convergence(mut self, threshold: f64, patience: usize) -> Self {
        self.convergence_threshold = threshold;
        self.convergence_patience = patience;
        self
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn with_safety_override(mut self, enabled: bool) -> Self {
        self.safety_override = enabled;
        self
    }

    pub fn with_trial_timeout(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.trial_timeout = timeout;
        self.timeout_policy = policy;
        self
    }

    pub fn with_failure_threshold(mut self, n: usize) -> Self {
        self.consecutive_failure_threshold = n;
        self
    }

    pub fn with_failure_penalty(mut self, penalty: f64) -> Self {
        self.failure_penalty = Some(penalty);
        self
    }

    pub fn with_clamping(mut self, enabled: bool) -> Self {
        self.allow_clamping = enabled;
        self
    }

    pub fn with_acquisition(mut self, kind: AcquisitionKind) -> Self {
        self.acquisition = kind;
        self
    }

    pub fn with_candidate_count(mut self, n: usize) -> Self {
        self.candidate_count = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Durations are written as fractional seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = RunConfig::default();
        assert!(!config.safety_override);
        assert_eq!(config.timeout_policy, TimeoutPolicy::RecordFailure);
        assert!(config.failure_penalty.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_chain() {
        let config = RunConfig::default()
            .with_max_trials(12)
            .with_min_trials_before_model(4)
            .with_convergence(0.05, 2)
            .with_time_budget(Duration::from_secs(3600))
            .with_failure_threshold(2)
            .with_seed(7);
        assert_eq!(config.max_trials, 12);
        assert_eq!(config.min_trials_before_model, 4);
        assert_eq!(config.convergence_patience, 2);
        assert_eq!(config.time_budget, Some(Duration::from_secs(3600)));
        assert_eq!(config.consecutive_failure_threshold, 2);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RunConfig::default().with_max_trials(0).validate().is_err());
        assert!(RunConfig::default()
            .with_convergence(-1.0, 3)
            .validate()
            .is_err());
        assert!(RunConfig::default()
            .with_convergence(0.1, 0)
            .validate()
            .is_err());
        assert!(RunConfig::default()
            .with_min_trials_before_model(1)
            .validate()
            .is_err());
        assert!(RunConfig::default()
            .with_trial_timeout(Duration::ZERO, TimeoutPolicy::Abort)
            .validate()
            .is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = RunConfig::from_json_str(
            r#"{"max_trials": 8, "time_budget": 1800.0, "trial_timeout": 90, "timeout_policy": "abort"}"#,
        )
        .unwrap();
        assert_eq!(config.max_trials, 8);
        assert_eq!(config.time_budget, Some(Duration::from_secs(1800)));
        assert_eq!(config.trial_timeout, Duration::from_secs(90));
        assert_eq!(config.timeout_policy, TimeoutPolicy::Abort);
        assert_eq!(config.min_trials_before_model, 5);
    }

    #[test]
    fn invalid_json_config_is_rejected() {
        assert!(RunConfig::from_json_str(r#"{"max_trials": 0}"#).is_err());
        assert!(RunConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn json_roundtrip_keeps_durations() {
        let config = RunConfig::default().with_time_budget(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        let back = RunConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
