//! The sequential Monte Carlo filter: recursive Bayesian scoring of the
//! ensemble against the reference data, and the one-dimensional search for
//! the observation-noise scale that hits the target effective sample size.

mod ess;
mod update;

pub use ess::EssSolver;
pub use update::{reverse_time, PosteriorState, UpdateInputs};
