//! # crema-optimizer
//!
//! The model-side half of the Crema loop.
//!
//! Provides the brewable parameter space (validation, clamping, space-filling
//! sampling), the reward model that turns measurements into a scalar, the
//! Gaussian-process surrogate behind the [`SurrogateModel`] trait, and the
//! acquisition strategy that picks the next brew to try.

mod acquisition;
mod reward;
mod space;
mod surrogate;

pub use acquisition::{
    expected_improvement, normal_cdf, normal_pdf, AcquisitionFunction, AcquisitionStrategy,
    Proposal, ProposalSource,
};
pub use reward::{EspressoReward, RewardModel, RewardPolicy};
pub use space::{ParameterSpace, SamplingStrategy};
pub use surrogate::{
    GaussianProcess, GpConfig, GpHyperparameters, Observation, Prediction, SurrogateModel,
};
