//! Boundary to the machine that physically brews a trial.

use async_trait::async_trait;
use std::time::Duration;

use crema_types::{ParameterSet, TrialMeasurement};

/// Errors surfaced by a trial executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("hardware fault: {message}")]
    HardwareFault { message: String },
    #[error("brew did not finish within {timeout_secs:.1} s")]
    Timeout { timeout_secs: f64 },
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Runs one brew and reports what was measured.
///
/// Implementations may drive real hardware or simulate it locally (see
/// [`crate::simulator::SimulatedMachine`]). The orchestrator additionally
/// enforces `timeout` itself and calls [`TrialExecutor::abort`] when a brew is
/// cut short.
#[async_trait]
pub trait TrialExecutor: Send {
    async fn execute(
        &mut self,
        params: &ParameterSet,
        timeout: Duration,
    ) -> ExecutorResult<TrialMeasurement>;

    /// Stop any brew in progress and return the machine to a safe state.
    async fn abort(&mut self) -> ExecutorResult<()>;

    fn name(&self) -> &str;
}
