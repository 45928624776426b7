//! Safety guard: the last check before a parameter set reaches the machine.
//!
//! Static checks come from the [`ParameterSpace`]; on top of them the guard
//! derives failure regions from the trial history. Regions are recomputed on
//! every call so a guard rebuilt after a restart behaves identically.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use crema_optimizer::ParameterSpace;
use crema_types::{ParameterSet, SafetyVerdict, Trial, TrialHistory};

use crate::alerts::{SafetyAlert, SafetyAlertKind, SafetySeverity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Failure signals needed before a neighbourhood is flagged.
    pub failures_to_flag: usize,
    /// Neighbourhood size in normalized parameter distance.
    pub region_radius: f64,
    /// Extraction times outside this window count as failure signals.
    pub plausible_extraction_secs: (f64, f64),
    /// Let proposals inside flagged regions through (with a warning).
    pub override_enabled: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            failures_to_flag: 2,
            region_radius: 0.08,
            plausible_extraction_secs: (5.0, 90.0),
            override_enabled: false,
        }
    }
}

/// A neighbourhood of the encoded space that produced repeated failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedRegion {
    pub centre: Vec<f64>,
    pub radius: f64,
    /// Trials whose failures formed the region, ascending.
    pub trials: Vec<u64>,
}

impl FlaggedRegion {
    pub fn contains(&self, space: &ParameterSpace, point: &[f64]) -> bool {
        space.distance(&self.centre, point) <= self.radius
    }

    fn describe_trials(&self) -> String {
        self.trials
            .iter()
            .map(|t| format!("#{t}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct SafetyGuard {
    space: ParameterSpace,
    config: SafetyConfig,
    alert_tx: Option<Sender<SafetyAlert>>,
    /// Trials belonging to regions already alerted on.
    announced: HashSet<u64>,
}

impl SafetyGuard {
    pub fn new(space: ParameterSpace, config: SafetyConfig) -> Self {
        Self {
            space,
            config,
            alert_tx: None,
            announced: HashSet::new(),
        }
    }

    pub fn with_alerts(mut self, alert_tx: Sender<SafetyAlert>) -> Self {
        self.alert_tx = Some(alert_tx);
        self
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    fn is_failure_signal(&self, trial: &Trial) -> bool {
        if trial.is_failure() {
            return true;
        }
        let (lo, hi) = self.config.plausible_extraction_secs;
        trial
            .measurement()
            .map_or(false, |m| m.extraction_time_secs < lo || m.extraction_time_secs > hi)
    }

    /// Regions implied by `history`, in order of their earliest trial.
    pub fn flagged_regions(&self, history: &TrialHistory) -> Vec<FlaggedRegion> {
        let signals: Vec<(u64, Vec<f64>)> = history
            .trials()
            .iter()
            .filter(|t| self.is_failure_signal(t))
            .map(|t| (t.index, self.space.encode(&t.parameters)))
            .collect();

        let radius = self.config.region_radius;
        let mut assigned = vec![false; signals.len()];
        let mut regions = Vec::new();
        for start in 0..signals.len() {
            if assigned[start] {
                continue;
            }
            // Connected component under the "within radius" relation
            assigned[start] = true;
            let mut members = vec![start];
            let mut cursor = 0;
            while cursor < members.len() {
                let current = members[cursor];
                for other in 0..signals.len() {
                    if !assigned[other]
                        && self.space.distance(&signals[current].1, &signals[other].1) <= radius
                    {
                        assigned[other] = true;
                        members.push(other);
                    }
                }
                cursor += 1;
            }
            if members.len() < self.config.failures_to_flag.max(1) {
                continue;
            }

            let dims = signals[start].1.len();
            let mut centre = vec![0.0; dims];
            for &m in &members {
                for (c, v) in centre.iter_mut().zip(&signals[m].1) {
                    *c += v / members.len() as f64;
                }
            }
            let spread = members
                .iter()
                .map(|&m| self.space.distance(&centre, &signals[m].1))
                .fold(0.0, f64::max);
            let mut trials: Vec<u64> = members.iter().map(|&m| signals[m].0).collect();
            trials.sort_unstable();
            regions.push(FlaggedRegion {
                centre,
                radius: radius.max(spread),
                trials,
            });
        }
        regions
    }

    /// Pure verdict for `set` given `history`. No logging, no alerts.
    pub fn check(&self, set: &ParameterSet, history: &TrialHistory) -> SafetyVerdict {
        self.evaluate(set, history).0
    }

    /// Verdict plus the region the override let the set into, if any.
    fn evaluate(
        &self,
        set: &ParameterSet,
        history: &TrialHistory,
    ) -> (SafetyVerdict, Option<FlaggedRegion>) {
        let verdict = self.space.validate(set);
        let Some(candidate) = verdict.executable() else {
            return (verdict, None);
        };
        let point = self.space.encode(candidate);
        let hit = self
            .flagged_regions(history)
            .into_iter()
            .find(|r| r.contains(&self.space, &point));
        match hit {
            None => (verdict, None),
            Some(region) if self.config.override_enabled => (verdict, Some(region)),
            Some(region) => (
                SafetyVerdict::rejected(format!(
                    "{candidate} lies within {:.3} of a failure region formed by trials {}",
                    region.radius,
                    region.describe_trials()
                )),
                None,
            ),
        }
    }

    /// [`check`](Self::check) for a set about to be executed: logs the
    /// outcome and emits clamp and override alerts.
    pub fn enforce(&self, set: &ParameterSet, history: &TrialHistory) -> SafetyVerdict {
        let (verdict, overridden) = self.evaluate(set, history);
        match &verdict {
            SafetyVerdict::Rejected { reason } => {
                warn!(%reason, "proposal rejected by safety guard");
                return verdict;
            }
            SafetyVerdict::Clamped { adjustments, .. } => {
                let message = adjustments
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                self.emit(SafetyAlert::new(
                    SafetySeverity::Warning,
                    SafetyAlertKind::ClampApplied {
                        adjustments: adjustments.clone(),
                    },
                    format!("clamped: {message}"),
                ));
            }
            SafetyVerdict::Accepted(_) => {}
        }
        if let Some(region) = overridden {
            self.emit(SafetyAlert::new(
                SafetySeverity::Critical,
                SafetyAlertKind::OverrideUsed {
                    trials: region.trials.clone(),
                },
                format!(
                    "safety override: executing inside failure region of trials {}",
                    region.describe_trials()
                ),
            ));
        }
        verdict
    }

    /// Recompute regions and alert on any not announced before.
    ///
    /// A region that shares a trial with an announced one is the same region
    /// grown or merged, and stays quiet.
    pub fn refresh(&mut self, history: &TrialHistory) -> Vec<FlaggedRegion> {
        let mut fresh = Vec::new();
        for region in self.flagged_regions(history) {
            let known = region.trials.iter().any(|t| self.announced.contains(t));
            self.announced.extend(region.trials.iter().copied());
            if !known {
                self.emit(SafetyAlert::new(
                    SafetySeverity::Warning,
                    SafetyAlertKind::RegionFlagged {
                        centre: region.centre.clone(),
                        radius: region.radius,
                        trials: region.trials.clone(),
                    },
                    format!("failure region flagged around trials {}", region.describe_trials()),
                ));
                fresh.push(region);
            }
        }
        fresh
    }

    fn emit(&self, alert: SafetyAlert) {
        match alert.severity {
            SafetySeverity::Critical => warn!(%alert.message, "SAFETY CRITICAL"),
            SafetySeverity::Warning => warn!(%alert.message, "SAFETY WARNING"),
            SafetySeverity::Info => info!(%alert.message, "SAFETY INFO"),
        }
        if let Some(tx) = &self.alert_tx {
            let _ = tx.try_send(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crema_types::{Bound, FailureKind, Reward, TrialMeasurement};

    fn space() -> ParameterSpace {
        ParameterSpace::new(vec![
            Bound::stepped("grind", 1.0, 30.0, 1.0),
            Bound::new("temperature", 88.0, 100.0),
        ])
        .unwrap()
    }

    fn brew(grind: f64, temperature: f64) -> ParameterSet {
        ParameterSet::new()
            .with_scalar("grind", grind)
            .with_scalar("temperature", temperature)
    }

    fn push_fault(history: &mut TrialHistory, set: ParameterSet) {
        let index = history.next_index();
        history
            .push(Trial::failed(index, set, FailureKind::HardwareFault, "pump stalled", None))
            .unwrap();
    }

    fn push_shot(history: &mut TrialHistory, set: ParameterSet, secs: f64) {
        let index = history.next_index();
        history
            .push(Trial::measured(
                index,
                set,
                TrialMeasurement::new(secs, 36.0),
                Reward::provisional(0.0),
            ))
            .unwrap();
    }

    #[test]
    fn out_of_range_rejected_without_clamping() {
        let guard = SafetyGuard::new(space(), SafetyConfig::default());
        let verdict = guard.check(&brew(10.0, 150.0), &TrialHistory::new());
        let reason = verdict.rejection_reason().unwrap();
        assert!(reason.contains("temperature=150"));
    }

    #[test]
    fn out_of_range_clamped_and_alerted() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let guard =
            SafetyGuard::new(space().with_clamping(true), SafetyConfig::default()).with_alerts(tx);
        let verdict = guard.enforce(&brew(10.0, 150.0), &TrialHistory::new());
        assert_eq!(verdict.executable().unwrap().scalar("temperature"), Some(100.0));
        assert_eq!(verdict.adjustments().len(), 1);
        let alert = rx.try_recv().unwrap();
        assert!(matches!(alert.kind, SafetyAlertKind::ClampApplied { .. }));
    }

    #[test]
    fn check_is_silent() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let guard =
            SafetyGuard::new(space().with_clamping(true), SafetyConfig::default()).with_alerts(tx);
        guard.check(&brew(10.0, 150.0), &TrialHistory::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn single_failure_does_not_flag() {
        let guard = SafetyGuard::new(space(), SafetyConfig::default());
        let mut history = TrialHistory::new();
        push_fault(&mut history, brew(2.0, 99.0));
        assert!(guard.flagged_regions(&history).is_empty());
        assert!(guard.check(&brew(2.0, 99.0), &history).is_executable());
    }

    #[test]
    fn repeated_failures_flag_a_region() {
        let guard = SafetyGuard::new(space(), SafetyConfig::default());
        let mut history = TrialHistory::new();
        push_shot(&mut history, brew(15.0, 93.0), 28.0);
        push_fault(&mut history, brew(2.0, 99.0));
        push_fault(&mut history, brew(3.0, 99.5));

        let regions = guard.flagged_regions(&history);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].trials, vec![1, 2]);

        let verdict = guard.check(&brew(2.0, 100.0), &history);
        let reason = verdict.rejection_reason().unwrap();
        assert!(reason.contains("#1, #2"), "{reason}");

        assert!(guard.check(&brew(20.0, 92.0), &history).is_executable());
    }

    #[test]
    fn implausible_extraction_counts_as_failure() {
        let guard = SafetyGuard::new(space(), SafetyConfig::default());
        let mut history = TrialHistory::new();
        // Gushers: far too fast
        push_shot(&mut history, brew(30.0, 90.0), 3.0);
        push_shot(&mut history, brew(29.0, 90.0), 2.5);
        assert_eq!(guard.flagged_regions(&history).len(), 1);
        assert!(!guard.check(&brew(30.0, 90.5), &history).is_executable());
    }

    #[test]
    fn distant_failures_stay_separate() {
        let guard = SafetyGuard::new(space(), SafetyConfig::default());
        let mut history = TrialHistory::new();
        push_fault(&mut history, brew(1.0, 88.0));
        push_fault(&mut history, brew(30.0, 100.0));
        assert!(guard.flagged_regions(&history).is_empty());
    }

    #[test]
    fn override_lets_proposal_through_with_alert() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = SafetyConfig {
            override_enabled: true,
            ..SafetyConfig::default()
        };
        let guard = SafetyGuard::new(space(), config).with_alerts(tx);
        let mut history = TrialHistory::new();
        push_fault(&mut history, brew(2.0, 99.0));
        push_fault(&mut history, brew(3.0, 99.5));

        let verdict = guard.enforce(&brew(2.0, 99.0), &history);
        assert!(verdict.is_executable());
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.severity, SafetySeverity::Critical);
        assert_eq!(alert.kind, SafetyAlertKind::OverrideUsed { trials: vec![0, 1] });
    }

    #[test]
    fn refresh_announces_each_region_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut guard = SafetyGuard::new(space(), SafetyConfig::default()).with_alerts(tx);
        let mut history = TrialHistory::new();
        push_fault(&mut history, brew(2.0, 99.0));
        assert!(guard.refresh(&history).is_empty());
        push_fault(&mut history, brew(3.0, 99.5));
        assert_eq!(guard.refresh(&history).len(), 1);
        assert!(guard.refresh(&history).is_empty());
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn growing_region_is_not_announced_again() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut guard = SafetyGuard::new(space(), SafetyConfig::default()).with_alerts(tx);
        let mut history = TrialHistory::new();
        push_fault(&mut history, brew(2.0, 99.0));
        push_fault(&mut history, brew(3.0, 99.5));
        assert_eq!(guard.refresh(&history).len(), 1);

        push_fault(&mut history, brew(2.0, 99.5));
        assert_eq!(guard.flagged_regions(&history)[0].trials.len(), 3);
        assert!(guard.refresh(&history).is_empty());
        assert_eq!(rx.try_iter().count(), 1);

        // A separate cluster elsewhere is still news
        push_fault(&mut history, brew(29.0, 88.0));
        push_fault(&mut history, brew(30.0, 88.5));
        assert_eq!(guard.refresh(&history).len(), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }
}
