//! Trial records and the append-only trial history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{CremaError, CremaResult};
use crate::measurement::{TasteEvaluation, TrialMeasurement};
use crate::params::ParameterSet;
use crate::verdict::ClampEvent;

/// Scalar reward derived from a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub value: f64,
    /// Computed without a taste score; expected to be replaced later.
    pub provisional: bool,
}

impl Reward {
    pub fn final_value(value: f64) -> Self {
        Self {
            value,
            provisional: false,
        }
    }

    pub fn provisional(value: f64) -> Self {
        Self {
            value,
            provisional: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    HardwareFault,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Measured(TrialMeasurement),
    Failed { kind: FailureKind, message: String },
}

/// One executed experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: u64,
    pub id: Uuid,
    pub parameters: ParameterSet,
    pub outcome: TrialOutcome,
    /// `None` for failed trials unless a failure penalty is configured.
    pub reward: Option<Reward>,
    /// Values adjusted by validation before the brew.
    #[serde(default)]
    pub adjustments: Vec<ClampEvent>,
    pub recorded_at: DateTime<Utc>,
}

impl Trial {
    pub fn measured(
        index: u64,
        parameters: ParameterSet,
        measurement: TrialMeasurement,
        reward: Reward,
    ) -> Self {
        Self {
            index,
            id: Uuid::new_v4(),
            parameters,
            outcome: TrialOutcome::Measured(measurement),
            reward: Some(reward),
            adjustments: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        index: u64,
        parameters: ParameterSet,
        kind: FailureKind,
        message: impl Into<String>,
        penalty: Option<f64>,
    ) -> Self {
        Self {
            index,
            id: Uuid::new_v4(),
            parameters,
            outcome: TrialOutcome::Failed {
                kind,
                message: message.into(),
            },
            reward: penalty.map(Reward::final_value),
            adjustments: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_adjustments(mut self, adjustments: Vec<ClampEvent>) -> Self {
        self.adjustments = adjustments;
        self
    }

    pub fn measurement(&self) -> Option<&TrialMeasurement> {
        match &self.outcome {
            TrialOutcome::Measured(m) => Some(m),
            TrialOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match &self.outcome {
            TrialOutcome::Failed { kind, .. } => Some(*kind),
            TrialOutcome::Measured(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure().is_some()
    }

    pub fn reward_value(&self) -> Option<f64> {
        self.reward.map(|r| r.value)
    }
}

/// Ordered, append-only log of trials.
///
/// Trials are never removed; the only in-place change is attaching a delayed
/// taste evaluation (and its reward) to an already measured trial.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialHistory {
    trials: Vec<Trial>,
}

impl TrialHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self) -> u64 {
        self.trials.len() as u64
    }

    /// Append a trial. Its index must equal [`TrialHistory::next_index`].
    pub fn push(&mut self, trial: Trial) -> CremaResult<()> {
        if trial.index != self.next_index() {
            return Err(CremaError::Internal(format!(
                "trial index {} out of sequence (expected {})",
                trial.index,
                self.next_index()
            )));
        }
        self.trials.push(trial);
        Ok(())
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn get(&self, index: u64) -> Option<&Trial> {
        self.trials.get(index as usize)
    }

    pub fn last(&self) -> Option<&Trial> {
        self.trials.last()
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn rewarded(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter().filter(|t| t.reward.is_some())
    }

    pub fn rewarded_count(&self) -> usize {
        self.rewarded().count()
    }

    pub fn failure_count(&self) -> usize {
        self.trials.iter().filter(|t| t.is_failure()).count()
    }

    /// Highest-reward trial; earlier trials win ties.
    pub fn best(&self) -> Option<&Trial> {
        self.rewarded().fold(None, |best: Option<&Trial>, t| match best {
            Some(b) if b.reward_value() >= t.reward_value() => Some(b),
            _ => Some(t),
        })
    }

    /// Number of failed trials at the tail of the history.
    pub fn consecutive_failures(&self) -> usize {
        self.trials
            .iter()
            .rev()
            .take_while(|t| t.is_failure())
            .count()
    }

    /// Attach a delayed taste evaluation to a measured trial and replace its reward.
    pub fn amend_taste(
        &mut self,
        index: u64,
        taste: TasteEvaluation,
        reward: Reward,
    ) -> CremaResult<&Trial> {
        taste.validate()?;
        let trial = self
            .trials
            .get_mut(index as usize)
            .ok_or_else(|| CremaError::Validation(format!("no trial with index {index}")))?;
        match &mut trial.outcome {
            TrialOutcome::Measured(m) => {
                m.taste = Some(taste);
                trial.reward = Some(reward);
                Ok(trial)
            }
            TrialOutcome::Failed { .. } => Err(CremaError::Validation(format!(
                "trial {index} failed and cannot take a taste evaluation"
            ))),
        }
    }

    /// Recompute the reward of every measured trial from its raw measurement.
    pub fn rescore<F>(&mut self, mut score: F)
    where
        F: FnMut(&TrialMeasurement) -> Reward,
    {
        for trial in &mut self.trials {
            if let TrialOutcome::Measured(m) = &trial.outcome {
                trial.reward = Some(score(m));
            }
        }
    }
}
