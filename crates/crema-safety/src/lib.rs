//! Safety layer for the Crema loop.
//!
//! Provides:
//! - Static bound checks with optional clamping (delegated to the parameter space)
//! - Failure-region detection from trial history
//! - Alert emission via channels when regions are flagged or overridden

pub mod alerts;
pub mod guard;

pub use alerts::{SafetyAlert, SafetyAlertKind, SafetySeverity};
pub use guard::{FlaggedRegion, SafetyConfig, SafetyGuard};
