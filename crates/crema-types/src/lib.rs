//! # crema-types
//!
//! Shared data model for Crema: parameter bounds and parameter sets, trial
//! measurements and history, safety verdicts, run configuration and the
//! error taxonomy used across the workspace.

pub mod config;
pub mod errors;
pub mod measurement;
pub mod params;
pub mod trial;
pub mod verdict;

pub use config::*;
pub use errors::*;
pub use measurement::*;
pub use params::*;
pub use trial::*;
pub use verdict::*;
