use rand::Rng;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use crate::config::CovarianceType;
use crate::error::{CalibrationError, Result};

/// Hyper-parameters of the variational mixture fit.
///
/// Defaults match the reference pipeline: concentration prior
/// `1 / max_components`, full covariances, tolerance `1e-5`, at most `1e5`
/// update sweeps, one hundred restarts.
#[derive(Debug, Clone)]
pub struct BayesMixtureParams<R: Rng + Clone> {
    max_components: usize,
    covariance_type: CovarianceType,
    weight_concentration: f64,
    tolerance: f64,
    max_iterations: usize,
    n_init: usize,
    reg_covariance: f64,
    rng: R,
}

impl BayesMixtureParams<Isaac64Rng> {
    pub fn new(max_components: usize) -> Self {
        Self::new_with_rng(max_components, Isaac64Rng::seed_from_u64(42))
    }
}

impl<R: Rng + Clone> BayesMixtureParams<R> {
    pub fn new_with_rng(max_components: usize, rng: R) -> Self {
        BayesMixtureParams {
            max_components,
            covariance_type: CovarianceType::Full,
            weight_concentration: 1.0 / max_components.max(1) as f64,
            tolerance: 1e-5,
            max_iterations: 100_000,
            n_init: 100,
            reg_covariance: 1e-6,
            rng,
        }
    }

    pub fn covariance_type(mut self, covar: CovarianceType) -> Self {
        self.covariance_type = covar;
        self
    }

    pub fn weight_concentration(mut self, prior: f64) -> Self {
        self.weight_concentration = prior;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    pub fn reg_covariance(mut self, reg: f64) -> Self {
        self.reg_covariance = reg;
        self
    }

    pub(crate) fn get_max_components(&self) -> usize {
        self.max_components
    }

    pub(crate) fn get_covariance_type(&self) -> CovarianceType {
        self.covariance_type
    }

    pub(crate) fn get_weight_concentration(&self) -> f64 {
        self.weight_concentration
    }

    pub(crate) fn get_tolerance(&self) -> f64 {
        self.tolerance
    }

    pub(crate) fn get_max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub(crate) fn get_n_init(&self) -> usize {
        self.n_init
    }

    pub(crate) fn get_reg_covariance(&self) -> f64 {
        self.reg_covariance
    }

    pub(crate) fn rng(&self) -> R {
        self.rng.clone()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_components == 0 {
            return Err(CalibrationError::InvalidSpec(
                "mixture needs at least one component".into(),
            ));
        }
        if !(self.weight_concentration > 0.0) {
            return Err(CalibrationError::InvalidSpec(
                "weight_concentration must be positive".into(),
            ));
        }
        if !(self.tolerance > 0.0) || self.max_iterations == 0 || self.n_init == 0 {
            return Err(CalibrationError::InvalidSpec(
                "mixture tolerance, max_iterations and n_init must be positive".into(),
            ));
        }
        Ok(())
    }
}
