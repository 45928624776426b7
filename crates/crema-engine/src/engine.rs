//! Optimization loop orchestrator.
//!
//! Ties the parameter space, surrogate, acquisition, [`SafetyGuard`],
//! [`TrialExecutor`] and [`RunStore`] together in a sequential state machine:
//! propose, validate, execute, observe, update, until the run converges,
//! exhausts its budget or aborts.

use chrono::Utc;
use crossbeam_channel::Sender;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crema_optimizer::{
    AcquisitionStrategy, EspressoReward, GaussianProcess, ParameterSpace, Proposal,
    ProposalSource, RewardModel, SamplingStrategy, SurrogateModel,
};
use crema_safety::{SafetyAlert, SafetyConfig, SafetyGuard};
use crema_types::{
    internal_error, validation_error, BrewContext, ClampEvent, CremaError, CremaResult, FailureKind,
    ParameterSet, Reward, RunConfig, SafetyVerdict, TasteEvaluation, TimeoutPolicy, Trial,
    TrialHistory, TrialMeasurement, TrialOutcome,
};

use crate::executor::{ExecutorError, TrialExecutor};
use crate::state::{AbortCause, BudgetLimit, OptimizationState, RunPhase, Termination};
use crate::storage::{Checkpoint, CheckpointScope, LogEntry, RunStore};

/// Space-filling draws tried before handing a rejected one to validation.
const SPACE_FILLING_DRAWS: usize = 8;

/// Events emitted by the orchestrator for external consumption (logging, UI,
/// alerting).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    Started {
        run_id: String,
        resumed: bool,
        trials: usize,
    },
    PhaseChanged {
        from: RunPhase,
        to: RunPhase,
    },
    Proposed {
        trial: u64,
        attempt: usize,
        source: ProposalSource,
        parameters: ParameterSet,
        expected_improvement: Option<f64>,
    },
    Rejected {
        trial: u64,
        attempt: usize,
        source: ProposalSource,
        reason: String,
    },
    Clamped {
        trial: u64,
        adjustments: Vec<ClampEvent>,
    },
    FallbackUsed {
        trial: u64,
        parameters: ParameterSet,
    },
    TrialRecorded {
        trial: u64,
        reward: Option<Reward>,
    },
    TrialFailed {
        trial: u64,
        kind: FailureKind,
        message: String,
    },
    ModelFitFailed {
        consecutive: usize,
        message: String,
    },
    RegionFlagged {
        trials: Vec<u64>,
    },
    TasteAmended {
        trial: u64,
        reward: Reward,
    },
    Rescored {
        trials: usize,
    },
    Finished {
        termination: Termination,
    },
}

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub termination: Termination,
    pub trials: Vec<Trial>,
    pub best: Option<Trial>,
    pub events: Vec<RunEvent>,
}

/// Requests cancellation of a running [`Orchestrator`] from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Selection {
    Ready {
        proposal: Proposal,
        parameters: ParameterSet,
        adjustments: Vec<ClampEvent>,
    },
    Terminate(Termination),
}

enum BrewOutcome {
    Measured(TrialMeasurement),
    Fault(String),
    TimedOut(String),
    Cancelled,
}

fn aborted(cause: AbortCause, message: impl Into<String>) -> Termination {
    Termination::Aborted {
        cause,
        message: message.into(),
    }
}

/// Any failure to write the run record counts as a persistence failure,
/// whatever layer of the store raised it.
fn stored<T>(result: CremaResult<T>) -> CremaResult<T> {
    result.map_err(|e| match e {
        e @ CremaError::Persistence { .. } => e,
        other => CremaError::Persistence {
            message: other.to_string(),
        },
    })
}

/// The closed-loop optimizer. Generic over the executor and store so callers
/// can plug in the simulator and an in-memory store for tests, or a real
/// machine adapter with on-disk persistence.
pub struct Orchestrator<E: TrialExecutor, S: RunStore> {
    executor: E,
    scope: CheckpointScope<S>,
    state: OptimizationState,
    surrogate: Box<dyn SurrogateModel>,
    reward: Box<dyn RewardModel>,
    acquisition: AcquisitionStrategy,
    safety_config: SafetyConfig,
    alert_tx: Option<Sender<SafetyAlert>>,
    guard: SafetyGuard,
    events: Vec<RunEvent>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    session_start: Option<Instant>,
    resumed: bool,
}

impl<E: TrialExecutor, S: RunStore> Orchestrator<E, S> {
    /// Start a fresh run with the default surrogate, reward model and guard.
    pub fn new(
        space: ParameterSpace,
        config: RunConfig,
        executor: E,
        store: S,
    ) -> CremaResult<Self> {
        config.validate()?;
        let space = space.with_clamping(config.allow_clamping);
        let state = OptimizationState::new(Uuid::new_v4().to_string(), config, space);
        Ok(Self::assemble(state, executor, store, false))
    }

    /// Continue a stored run: load its checkpoint, fold in newer log entries,
    /// restore the surrogate's hyperparameters and refit.
    pub fn resume(run_id: &str, executor: E, store: S) -> CremaResult<Self> {
        let recovered = store.load(run_id)?.ok_or_else(|| CremaError::Persistence {
            message: format!("no stored run {run_id}"),
        })?;
        let checkpoint = recovered.checkpoint.ok_or_else(|| CremaError::Persistence {
            message: format!("run {run_id} has no checkpoint"),
        })?;
        let mut state = checkpoint.state;
        state.phase = RunPhase::Init;
        state.termination = None;

        let mut orchestrator = Self::assemble(state, executor, store, true);
        orchestrator.replay(&recovered.entries)?;
        orchestrator.guard.refresh(&orchestrator.state.history);
        orchestrator
            .surrogate
            .restore(&orchestrator.state.surrogate)?;
        // The checkpoint already counts any failed fit; only log here
        if let Err(e) = orchestrator.surrogate.fit(orchestrator.state.history.trials()) {
            warn!(run_id, error = %e, "surrogate refit on resume failed");
        } else {
            orchestrator.state.surrogate = orchestrator.surrogate.snapshot();
        }
        info!(
            run_id,
            trials = orchestrator.state.history.len(),
            "run restored from checkpoint"
        );
        Ok(orchestrator)
    }

    fn assemble(state: OptimizationState, executor: E, store: S, resumed: bool) -> Self {
        let surrogate: Box<dyn SurrogateModel> =
            Box::new(GaussianProcess::with_defaults(state.space.clone()));
        let acquisition = AcquisitionStrategy::from_config(&state.config);
        let safety_config = SafetyConfig::default();
        let guard = SafetyGuard::new(
            state.space.clone(),
            SafetyConfig {
                override_enabled: state.config.safety_override,
                ..safety_config.clone()
            },
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            executor,
            scope: CheckpointScope::new(store),
            state,
            surrogate,
            reward: Box::new(EspressoReward::default()),
            acquisition,
            safety_config,
            alert_tx: None,
            guard,
            events: Vec::new(),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            session_start: None,
            resumed,
        }
    }

    fn rebuild_guard(&mut self) {
        let config = SafetyConfig {
            override_enabled: self.state.config.safety_override,
            ..self.safety_config.clone()
        };
        let mut guard = SafetyGuard::new(self.state.space.clone(), config);
        // Regions already in the history were announced before
        guard.refresh(&self.state.history);
        if let Some(tx) = &self.alert_tx {
            guard = guard.with_alerts(tx.clone());
        }
        self.guard = guard;
    }

    /// Fold log entries written after the checkpoint into the state.
    ///
    /// Taste amendments carry the reward computed when they were recorded,
    /// and that reward is applied as logged.
    fn replay(&mut self, entries: &[LogEntry]) -> CremaResult<()> {
        let seen = self.state.log_entries;
        if seen > entries.len() {
            warn!(
                checkpoint = seen,
                log = entries.len(),
                "trial log is shorter than the checkpoint expects"
            );
        }
        let unseen = entries.get(seen..).unwrap_or_default();
        let mut folded = 0;
        for entry in unseen {
            match entry {
                LogEntry::Trial(trial) => {
                    let next = self.state.history.next_index();
                    if trial.index < next {
                        continue;
                    }
                    if trial.index > next {
                        return Err(CremaError::Persistence {
                            message: format!(
                                "trial log skips from {next} to {}",
                                trial.index
                            ),
                        });
                    }
                    self.state.history.push(trial.clone())?;
                    folded += 1;
                }
                LogEntry::TasteAmended {
                    index,
                    taste,
                    reward,
                    ..
                } => {
                    self.state
                        .history
                        .amend_taste(*index, taste.clone(), *reward)?;
                    folded += 1;
                }
            }
        }
        self.state.log_entries = entries.len();
        if folded > 0 {
            info!(entries = folded, "folded log entries newer than the checkpoint");
        }
        Ok(())
    }

    /// Append to the trial log and count the entry as reflected in the state.
    fn log(&mut self, entry: &LogEntry) -> CremaResult<()> {
        let run_id = self.state.run_id.clone();
        stored(self.scope.append(&run_id, entry))?;
        self.state.log_entries += 1;
        Ok(())
    }

    fn commit(&mut self) -> CremaResult<()> {
        let checkpoint = self.checkpoint();
        stored(self.scope.commit(checkpoint))
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.state.run_id = run_id.into();
        self
    }

    /// Swap the surrogate; it is restored from the current snapshot and refit.
    pub fn with_surrogate(mut self, mut surrogate: Box<dyn SurrogateModel>) -> Self {
        if let Err(e) = surrogate.restore(&self.state.surrogate) {
            warn!(error = %e, "surrogate snapshot not applicable, starting fresh");
        }
        self.surrogate = surrogate;
        if !self.state.history.is_empty() {
            self.refit();
        }
        self
    }

    pub fn with_reward_model(mut self, reward: Box<dyn RewardModel>) -> Self {
        self.reward = reward;
        self
    }

    pub fn with_acquisition(mut self, acquisition: AcquisitionStrategy) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_safety_config(mut self, config: SafetyConfig) -> Self {
        self.safety_config = config;
        self.rebuild_guard();
        self
    }

    pub fn with_alerts(mut self, alert_tx: Sender<SafetyAlert>) -> Self {
        self.alert_tx = Some(alert_tx);
        self.rebuild_guard();
        self
    }

    pub fn with_brew_context(mut self, context: BrewContext) -> Self {
        self.state.brew_context = Some(context);
        self
    }

    /// Context recorded with subsequent measurements that carry none of
    /// their own. `None` stops attaching one. A `first_brew` flag applies to
    /// the next measurement only.
    pub fn set_brew_context(&mut self, context: Option<BrewContext>) {
        self.state.brew_context = context;
    }

    pub fn brew_context(&self) -> Option<&BrewContext> {
        self.state.brew_context.as_ref()
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.state.phase
    }

    pub fn state(&self) -> &OptimizationState {
        &self.state
    }

    pub fn history(&self) -> &TrialHistory {
        &self.state.history
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.state.space
    }

    pub fn surrogate(&self) -> &dyn SurrogateModel {
        self.surrogate.as_ref()
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &S {
        self.scope.store()
    }

    pub fn cancellation_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Safety verdict for `set` against the current history, without side effects.
    pub fn check_parameters(&self, set: &ParameterSet) -> SafetyVerdict {
        self.guard.check(set, &self.state.history)
    }

    fn emit(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    fn transition(&mut self, to: RunPhase) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        self.state.phase = to;
        debug!(?from, ?to, "phase transition");
        self.emit(RunEvent::PhaseChanged { from, to });
    }

    fn elapsed_secs(&self) -> f64 {
        self.state.elapsed_secs
            + self
                .session_start
                .map_or(0.0, |start| start.elapsed().as_secs_f64())
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut state = self.state.clone();
        state.elapsed_secs = self.elapsed_secs();
        Checkpoint::new(state)
    }

    fn rng_for(&self, attempt: usize) -> ChaCha8Rng {
        let trials = self.state.history.len() as u64;
        let seed = self.state.config.seed
            ^ trials.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (attempt as u64 + 1).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        ChaCha8Rng::seed_from_u64(seed)
    }

    fn model_ready(&self) -> bool {
        self.state.history.rewarded_count() >= self.state.config.min_trials_before_model
            && self.state.fit_failures == 0
            && self.surrogate.is_informed()
    }

    fn proposal_for(&self, attempt: usize) -> CremaResult<Proposal> {
        let mut rng = self.rng_for(attempt);
        let history = &self.state.history;
        let space = &self.state.space;

        if !self.model_ready() {
            if history.is_empty() && attempt == 0 {
                return Ok(Proposal::space_filling(space.sample(
                    SamplingStrategy::Center,
                    &[],
                    &mut rng,
                )));
            }
            let existing: Vec<Vec<f64>> = history
                .trials()
                .iter()
                .map(|t| space.encode(&t.parameters))
                .collect();
            let mut last = None;
            for _ in 0..SPACE_FILLING_DRAWS {
                let candidate = space.sample(SamplingStrategy::default(), &existing, &mut rng);
                if self.guard.check(&candidate, history).is_executable() {
                    return Ok(Proposal::space_filling(candidate));
                }
                last = Some(candidate);
            }
            return last
                .map(Proposal::space_filling)
                .ok_or_else(|| internal_error!("space-filling produced no candidate"));
        }

        let guard = &self.guard;
        let admissible = |p: &ParameterSet| guard.check(p, history).is_executable();
        self.acquisition
            .propose(self.surrogate.as_ref(), history, space, &admissible, &mut rng)
    }

    /// The proposal the loop would make next from the current state.
    pub fn propose_next(&self) -> CremaResult<Proposal> {
        self.proposal_for(0)
    }

    /// Up to `k` alternative next brews, best first, all passing the guard.
    ///
    /// Ranked by the acquisition function once the model is ready, otherwise
    /// spread-out space-filling draws. Does not change the run.
    pub fn recommend(&self, k: usize) -> CremaResult<Vec<Proposal>> {
        let mut rng = self.rng_for(0);
        let history = &self.state.history;
        let space = &self.state.space;
        let guard = &self.guard;

        if self.model_ready() {
            let admissible = |p: &ParameterSet| guard.check(p, history).is_executable();
            return self.acquisition.recommend(
                self.surrogate.as_ref(),
                history,
                space,
                &admissible,
                k,
                &mut rng,
            );
        }

        let mut existing: Vec<Vec<f64>> = history
            .trials()
            .iter()
            .map(|t| space.encode(&t.parameters))
            .collect();
        let mut out = Vec::with_capacity(k);
        for _ in 0..k * SPACE_FILLING_DRAWS {
            if out.len() == k {
                break;
            }
            let candidate = space.sample(SamplingStrategy::default(), &existing, &mut rng);
            if guard.check(&candidate, history).is_executable() {
                existing.push(space.encode(&candidate));
                out.push(Proposal::space_filling(candidate));
            }
        }
        Ok(out)
    }

    /// Nearest measured trial that still passes the guard.
    fn fallback(&self, near: Option<&ParameterSet>) -> Option<ParameterSet> {
        let space = &self.state.space;
        let target = near.map(|p| space.encode(p));
        let mut candidates: Vec<(f64, &Trial)> = self
            .state
            .history
            .trials()
            .iter()
            .filter(|t| !t.is_failure())
            .map(|t| {
                let key = match &target {
                    Some(point) => space.distance(point, &space.encode(&t.parameters)),
                    None => -t.reward_value().unwrap_or(f64::NEG_INFINITY),
                };
                (key, t)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates.into_iter().find_map(|(_, t)| {
            self.guard
                .check(&t.parameters, &self.state.history)
                .executable()
                .cloned()
        })
    }

    fn select_parameters(&mut self, trial: u64) -> CremaResult<Selection> {
        let retries = self.state.config.max_proposal_retries;
        let mut last_rejected: Option<ParameterSet> = None;

        for attempt in 0..=retries {
            self.transition(RunPhase::Proposing);
            let proposal = match self.proposal_for(attempt) {
                Ok(p) => p,
                Err(e) if e.is_recoverable() => {
                    warn!(trial, attempt, error = %e, "no proposal this attempt");
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(
                trial,
                attempt,
                source = ?proposal.source,
                parameters = %proposal.parameters,
                "proposal"
            );
            self.emit(RunEvent::Proposed {
                trial,
                attempt,
                source: proposal.source,
                parameters: proposal.parameters.clone(),
                expected_improvement: proposal.expected_improvement,
            });

            self.transition(RunPhase::Validating);
            match self.guard.enforce(&proposal.parameters, &self.state.history) {
                SafetyVerdict::Rejected { reason } => {
                    self.emit(RunEvent::Rejected {
                        trial,
                        attempt,
                        source: proposal.source,
                        reason,
                    });
                    last_rejected = Some(proposal.parameters);
                }
                verdict => {
                    let adjustments = verdict.adjustments().to_vec();
                    let parameters = verdict
                        .executable()
                        .cloned()
                        .ok_or_else(|| internal_error!("executable verdict without parameters"))?;
                    if !adjustments.is_empty() {
                        self.emit(RunEvent::Clamped {
                            trial,
                            adjustments: adjustments.clone(),
                        });
                    }
                    return Ok(Selection::Ready {
                        proposal,
                        parameters,
                        adjustments,
                    });
                }
            }
        }

        match self.fallback(last_rejected.as_ref()) {
            Some(parameters) => {
                warn!(
                    trial,
                    parameters = %parameters,
                    "proposal retries exhausted, repeating nearest validated brew"
                );
                self.emit(RunEvent::FallbackUsed {
                    trial,
                    parameters: parameters.clone(),
                });
                Ok(Selection::Ready {
                    proposal: Proposal::fallback(parameters.clone()),
                    parameters,
                    adjustments: Vec::new(),
                })
            }
            None => Ok(Selection::Terminate(aborted(
                AbortCause::Safety,
                format!(
                    "no safe parameters after {} attempts and no validated brew to fall back on",
                    retries + 1
                ),
            ))),
        }
    }

    async fn brew(&mut self, params: &ParameterSet) -> BrewOutcome {
        let timeout = self.state.config.trial_timeout;
        let mut cancel_rx = self.cancel_rx.clone();
        let result = {
            let brew = tokio::time::timeout(timeout, self.executor.execute(params, timeout));
            tokio::select! {
                r = brew => Some(r),
                _ = cancelled(&mut cancel_rx) => None,
            }
        };
        match result {
            None => {
                if let Err(e) = self.executor.abort().await {
                    error!(error = %e, "executor abort failed after cancellation");
                }
                BrewOutcome::Cancelled
            }
            Some(Ok(Ok(measurement))) => match measurement.validate() {
                Ok(()) => BrewOutcome::Measured(measurement),
                Err(e) => BrewOutcome::Fault(format!("invalid measurement: {e}")),
            },
            Some(Ok(Err(ExecutorError::HardwareFault { message }))) => BrewOutcome::Fault(message),
            Some(Ok(Err(e @ ExecutorError::Timeout { .. }))) => BrewOutcome::TimedOut(e.to_string()),
            Some(Err(_elapsed)) => {
                if let Err(e) = self.executor.abort().await {
                    error!(error = %e, "executor abort failed after timeout");
                }
                BrewOutcome::TimedOut(format!(
                    "no result within {:.1} s",
                    timeout.as_secs_f64()
                ))
            }
        }
    }

    /// Fit the surrogate to the current history, tracking consecutive failures.
    fn refit(&mut self) -> bool {
        match self.surrogate.fit(self.state.history.trials()) {
            Ok(()) => {
                self.state.fit_failures = 0;
                self.state.surrogate = self.surrogate.snapshot();
                true
            }
            Err(e) => {
                self.state.fit_failures += 1;
                warn!(
                    consecutive = self.state.fit_failures,
                    error = %e,
                    "surrogate fit failed, falling back to space-filling proposals"
                );
                self.emit(RunEvent::ModelFitFailed {
                    consecutive: self.state.fit_failures,
                    message: e.to_string(),
                });
                false
            }
        }
    }

    fn budget_exhausted(&self) -> Option<BudgetLimit> {
        if self.state.history.len() >= self.state.config.max_trials {
            return Some(BudgetLimit::Trials);
        }
        match self.state.config.time_budget {
            Some(budget) if self.elapsed_secs() >= budget.as_secs_f64() => Some(BudgetLimit::Time),
            _ => None,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// One pass through the loop; `Some` when the run should stop.
    async fn iterate(&mut self) -> CremaResult<Option<Termination>> {
        if self.is_cancelled() {
            return Ok(Some(aborted(AbortCause::Cancelled, "cancelled between trials")));
        }
        if let Some(limit) = self.budget_exhausted() {
            return Ok(Some(Termination::BudgetExhausted { limit }));
        }

        let index = self.state.history.next_index();
        let (proposal, parameters, adjustments) = match self.select_parameters(index)? {
            Selection::Ready {
                proposal,
                parameters,
                adjustments,
            } => (proposal, parameters, adjustments),
            Selection::Terminate(termination) => return Ok(Some(termination)),
        };

        // Stored only once the trial is recorded; a cancelled brew leaves it unchanged
        let streak = if proposal.is_model_driven() {
            let improvement = proposal.expected_improvement.unwrap_or(f64::INFINITY);
            let streak = if improvement < self.state.config.convergence_threshold {
                self.state.low_improvement_streak + 1
            } else {
                0
            };
            if streak >= self.state.config.convergence_patience {
                info!(
                    trial = index,
                    expected_improvement = improvement,
                    streak,
                    "expected improvement below threshold, converged"
                );
                self.state.low_improvement_streak = streak;
                return Ok(Some(Termination::Converged {
                    trials: self.state.history.len(),
                }));
            }
            streak
        } else {
            0
        };

        self.transition(RunPhase::Executing);
        self.scope.stage(self.checkpoint());
        let outcome = self.brew(&parameters).await;

        self.transition(RunPhase::Observing);
        let penalty = self.state.config.failure_penalty;
        let mut abort_on_timeout = false;
        let trial = match outcome {
            BrewOutcome::Measured(mut measurement) => {
                if measurement.context.is_none() {
                    measurement.context = self.state.brew_context.clone();
                    // Only the next shot after setting the context is a first brew
                    if let Some(context) = &mut self.state.brew_context {
                        context.first_brew = false;
                    }
                }
                let reward = self.reward.score(&measurement);
                Trial::measured(index, parameters, measurement, reward)
            }
            BrewOutcome::Fault(message) => {
                Trial::failed(index, parameters, FailureKind::HardwareFault, message, penalty)
            }
            BrewOutcome::TimedOut(message) => {
                abort_on_timeout = self.state.config.timeout_policy == TimeoutPolicy::Abort;
                Trial::failed(index, parameters, FailureKind::Timeout, message, penalty)
            }
            BrewOutcome::Cancelled => {
                return Ok(Some(aborted(AbortCause::Cancelled, "cancelled during brew")));
            }
        }
        .with_adjustments(adjustments);

        self.update(trial, abort_on_timeout, streak)
    }

    fn update(
        &mut self,
        trial: Trial,
        abort_on_timeout: bool,
        streak: usize,
    ) -> CremaResult<Option<Termination>> {
        self.transition(RunPhase::Updating);
        self.state.low_improvement_streak = streak;
        let index = trial.index;
        match &trial.outcome {
            TrialOutcome::Measured(m) => {
                info!(
                    trial = index,
                    parameters = %trial.parameters,
                    extraction_secs = m.extraction_time_secs,
                    reward = ?trial.reward_value(),
                    provisional = trial.reward.map_or(false, |r| r.provisional),
                    "trial recorded"
                );
                self.emit(RunEvent::TrialRecorded {
                    trial: index,
                    reward: trial.reward,
                });
            }
            TrialOutcome::Failed { kind, message } => {
                warn!(trial = index, ?kind, %message, "trial failed");
                self.emit(RunEvent::TrialFailed {
                    trial: index,
                    kind: *kind,
                    message: message.clone(),
                });
            }
        }

        self.state.history.push(trial.clone())?;
        self.log(&LogEntry::Trial(trial))?;

        self.refit();
        for region in self.guard.refresh(&self.state.history) {
            self.emit(RunEvent::RegionFlagged {
                trials: region.trials,
            });
        }
        self.commit()?;

        if abort_on_timeout {
            return Ok(Some(aborted(
                AbortCause::Timeout,
                format!("trial {index} timed out and the timeout policy is abort"),
            )));
        }
        let failures = self.state.history.consecutive_failures();
        if failures >= self.state.config.consecutive_failure_threshold {
            let cause = match self.state.history.last().and_then(Trial::failure) {
                Some(FailureKind::Timeout) => AbortCause::Timeout,
                _ => AbortCause::Hardware,
            };
            return Ok(Some(aborted(
                cause,
                format!("{failures} consecutive failed trials"),
            )));
        }
        if self.state.fit_failures > self.state.config.max_fit_failures {
            return Ok(Some(aborted(
                AbortCause::ModelFit,
                format!("{} consecutive surrogate fit failures", self.state.fit_failures),
            )));
        }
        Ok(None)
    }

    /// Drive the loop until it converges, exhausts its budget or aborts.
    ///
    /// Only internal errors are returned as `Err`; every other failure ends
    /// the run with an aborted [`Termination`] in the report.
    pub async fn run(&mut self) -> CremaResult<RunReport> {
        if let Some(termination) = self.state.termination.clone() {
            return Ok(self.report(termination));
        }
        self.session_start = Some(Instant::now());
        self.emit(RunEvent::Started {
            run_id: self.state.run_id.clone(),
            resumed: self.resumed,
            trials: self.state.history.len(),
        });
        info!(
            run_id = %self.state.run_id,
            resumed = self.resumed,
            trials = self.state.history.len(),
            max_trials = self.state.config.max_trials,
            executor = self.executor.name(),
            surrogate = self.surrogate.name(),
            reward = self.reward.name(),
            "optimization run started"
        );

        let termination = loop {
            match self.iterate().await {
                Ok(None) => continue,
                Ok(Some(termination)) => break termination,
                Err(e @ CremaError::Persistence { .. }) => {
                    break aborted(AbortCause::Persistence, e.to_string())
                }
                Err(e) => {
                    error!(error = %e, "optimization loop failed");
                    return Err(e);
                }
            }
        };
        Ok(self.finish(termination))
    }

    fn finish(&mut self, termination: Termination) -> RunReport {
        self.transition(termination.phase());
        self.state.elapsed_secs = self.elapsed_secs();
        self.session_start = None;
        self.state.termination = Some(termination.clone());
        self.emit(RunEvent::Finished {
            termination: termination.clone(),
        });

        let best = self.state.history.best().and_then(Trial::reward_value);
        match &termination {
            Termination::Aborted { cause, message } => warn!(
                run_id = %self.state.run_id,
                cause = cause.as_str(),
                %message,
                trials = self.state.history.len(),
                "run aborted"
            ),
            other => info!(
                run_id = %self.state.run_id,
                termination = %other,
                trials = self.state.history.len(),
                best_reward = ?best,
                "run finished"
            ),
        }
        if let Err(e) = self.scope.commit(self.checkpoint()) {
            error!(error = %e, "final checkpoint not written");
        }
        self.report(termination)
    }

    fn report(&self, termination: Termination) -> RunReport {
        RunReport {
            run_id: self.state.run_id.clone(),
            termination,
            trials: self.state.history.trials().to_vec(),
            best: self.state.history.best().cloned(),
            events: self.events.clone(),
        }
    }

    fn score_with_taste(&self, index: u64, taste: &TasteEvaluation) -> CremaResult<Reward> {
        let trial = self
            .state
            .history
            .get(index)
            .ok_or_else(|| validation_error!("no trial with index {index}"))?;
        let measurement = trial.measurement().ok_or_else(|| {
            validation_error!("trial {index} failed and cannot take a taste evaluation")
        })?;
        Ok(self.reward.score(&measurement.clone().with_taste(taste.clone())))
    }

    /// Attach a taste evaluation that arrived after the trial was recorded.
    ///
    /// The amendment is logged first; only then is the trial's provisional
    /// reward replaced and the surrogate refit. A failed log write leaves the
    /// history untouched.
    pub fn record_taste(&mut self, index: u64, taste: TasteEvaluation) -> CremaResult<Reward> {
        taste.validate()?;
        let reward = self.score_with_taste(index, &taste)?;
        self.log(&LogEntry::TasteAmended {
            index,
            taste: taste.clone(),
            reward,
            at: Utc::now(),
        })?;
        self.state.history.amend_taste(index, taste, reward)?;
        info!(trial = index, reward = reward.value, "taste evaluation recorded");
        self.emit(RunEvent::TasteAmended {
            trial: index,
            reward,
        });
        self.refit();
        self.commit()?;
        Ok(reward)
    }

    /// Install a revised reward model and recompute every reward from the
    /// retained raw measurements.
    pub fn rescore_history(&mut self, model: Box<dyn RewardModel>) -> CremaResult<()> {
        self.reward = model;
        let reward = &self.reward;
        self.state.history.rescore(|m| reward.score(m));
        let trials = self.state.history.rewarded_count();
        info!(trials, model = self.reward.name(), "history rescored");
        self.emit(RunEvent::Rescored { trials });
        self.refit();
        self.commit()
    }
}
