//! # crema-engine
//!
//! Drives the closed optimization loop: propose, validate, brew, observe,
//! update. Hosts the [`TrialExecutor`] boundary with a simulated machine,
//! run persistence with checkpoint/resume, and history export.

pub mod engine;
pub mod executor;
pub mod report;
pub mod simulator;
pub mod state;
pub mod storage;

pub use engine::{CancelHandle, Orchestrator, RunEvent, RunReport};
pub use executor::{ExecutorError, ExecutorResult, TrialExecutor};
pub use report::{prediction_grid, GridPrediction};
pub use simulator::{ScriptedFault, SimulatedMachine, SimulatorConfig};
pub use state::{AbortCause, BudgetLimit, OptimizationState, RunPhase, Termination};
pub use storage::{
    Checkpoint, CheckpointScope, FileRunStore, LogEntry, MemoryRunStore, RecoveredRun, RunStore,
    CHECKPOINT_VERSION,
};
