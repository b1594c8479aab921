//! Variational Bayesian Gaussian mixtures on weighted posterior samples.
//!
//! The resampler fits a mixture with a Dirichlet prior on the component
//! weights and a Gaussian-Wishart prior on the component parameters, so the
//! number of active components adapts to the posterior mass instead of being
//! fixed up front. Row weights enter the fit directly through the weighted
//! responsibility statistics.

mod algorithm;
mod hyperparams;

pub use algorithm::BayesMixture;
pub use hyperparams::BayesMixtureParams;
