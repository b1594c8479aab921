//! Run configuration: the unknown parameters, the reference measurements and
//! the knobs of the filter and the resampler.
//!
//! A [`CalibrationConfig`] is built once, validated once and then treated as
//! immutable for the whole run; the driver threads it through the per-iteration
//! value objects without touching it again.

use std::path::{Path, PathBuf};

use crate::error::{CalibrationError, Result};

/// One unknown scalar parameter with its closed admissible interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRange {
    pub name: String,
    pub lo: f64,
    pub hi: f64,
}

/// Ordered list of unknown parameters.
///
/// The declaration order is the canonical column order of every sample table,
/// ensemble matrix and simulation file name for the run.
#[derive(Debug, Clone, Default)]
pub struct ParameterSpec {
    params: Vec<ParamRange>,
}

impl ParameterSpec {
    pub fn new() -> Self {
        ParameterSpec { params: Vec::new() }
    }

    pub fn with(mut self, name: impl Into<String>, lo: f64, hi: f64) -> Self {
        self.params.push(ParamRange {
            name: name.into(),
            lo,
            hi,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub fn ranges(&self) -> &[ParamRange] {
        &self.params
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(CalibrationError::InvalidSpec(
                "no parameters to identify".into(),
            ));
        }
        for p in &self.params {
            if !p.lo.is_finite() || !p.hi.is_finite() || p.lo >= p.hi {
                return Err(CalibrationError::InvalidSpec(format!(
                    "parameter `{}` has an empty range [{}, {}]",
                    p.name, p.lo, p.hi
                )));
            }
        }
        Ok(())
    }
}

/// A named reference channel: the measured values, their relative weights and
/// the identity of the external solver that reproduces them.
///
/// `data` and `weight` hold one entry for a scalar measurement; a scalar
/// weight is broadcast over a vector measurement.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub name: String,
    pub data: Vec<f64>,
    pub weight: Vec<f64>,
    /// Opaque to the core; carried through for the external solver dispatch.
    pub solver_id: String,
    /// Base name of the solver's output files.
    pub output_tag: String,
}

impl Measurement {
    pub fn scalar(name: impl Into<String>, data: f64, weight: f64) -> Self {
        Measurement {
            name: name.into(),
            data: vec![data],
            weight: vec![weight],
            solver_id: String::new(),
            output_tag: String::new(),
        }
    }

    pub fn series(name: impl Into<String>, data: Vec<f64>, weight: Vec<f64>) -> Self {
        Measurement {
            name: name.into(),
            data,
            weight,
            solver_id: String::new(),
            output_tag: String::new(),
        }
    }

    pub fn solver(mut self, solver_id: impl Into<String>) -> Self {
        self.solver_id = solver_id.into();
        self
    }

    pub fn output_tag(mut self, tag: impl Into<String>) -> Self {
        self.output_tag = tag.into();
        self
    }

    /// Weight vector broadcast to the length of `data`.
    pub fn broadcast_weight(&self) -> Vec<f64> {
        if self.weight.len() == 1 && self.data.len() > 1 {
            vec![self.weight[0]; self.data.len()]
        } else {
            self.weight.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(CalibrationError::InvalidSpec(format!(
                "measurement `{}` has no data",
                self.name
            )));
        }
        if self.weight.len() != 1 && self.weight.len() != self.data.len() {
            return Err(CalibrationError::InvalidSpec(format!(
                "measurement `{}`: weight length {} does not match data length {}",
                self.name,
                self.weight.len(),
                self.data.len()
            )));
        }
        if self.weight.iter().any(|&w| !(w > 0.0)) {
            return Err(CalibrationError::InvalidSpec(format!(
                "measurement `{}` has non-positive weights",
                self.name
            )));
        }
        Ok(())
    }
}

/// How the diagonal observation covariance is scaled across assimilation
/// steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovariancePolicy {
    /// One covariance for all steps, proportional to the per-channel maximum
    /// of the reference data.
    MaxScaled,
    /// A covariance per step, proportional to the reference value at that
    /// step.
    PointScaled,
}

/// Covariance structure of the mixture components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CovarianceType {
    Full,
    Tied,
    Diag,
    Spherical,
}

/// Immutable configuration for a whole calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub parameters: ParameterSpec,
    pub measurements: Vec<Measurement>,
    pub work_dir: PathBuf,

    pub n_iterations: usize,
    /// Ensemble size; defaults to ten samples per parameter.
    pub n_samples: Option<usize>,
    /// Upper bound on mixture components; defaults to `n_samples / 10`.
    pub max_components: Option<usize>,
    /// Target normalized effective sample size, in (0, 1).
    pub ess_target: f64,
    /// Initial upper bound of the normalized covariance coefficient.
    pub sigma_max: f64,
    /// Lower bound of the normalized covariance coefficient.
    pub sigma_min: f64,

    pub covariance_policy: CovariancePolicy,
    pub covariance_type: CovarianceType,
    /// Dirichlet concentration prior of the mixture weights; defaults to
    /// `1 / max_components`.
    pub weight_concentration: Option<f64>,

    /// Re-run scoring and resampling even where the next parameter table
    /// already exists. Never re-runs simulations.
    pub analysis: bool,
    /// Flip the time axis on odd iterations so consecutive iterations join
    /// end-to-end.
    pub alternate_direction: bool,
    /// Per-column max normalization of samples before scoring them under a
    /// proposal whose component means are all below one in magnitude.
    /// Compatibility behavior for proposals trained on normalized samples;
    /// enabling it changes results. Off by default.
    pub historical_normalization: bool,

    /// Prefix of merged per-sample simulation files.
    pub sim_name: String,
    /// Extension of merged per-sample simulation files.
    pub extension: String,
    pub seed: u64,
}

impl CalibrationConfig {
    pub fn new(
        parameters: ParameterSpec,
        measurements: Vec<Measurement>,
        work_dir: impl AsRef<Path>,
    ) -> Self {
        CalibrationConfig {
            parameters,
            measurements,
            work_dir: work_dir.as_ref().to_path_buf(),
            n_iterations: 3,
            n_samples: None,
            max_components: None,
            ess_target: 0.3,
            sigma_max: 1.0,
            sigma_min: 1.0e-4,
            covariance_policy: CovariancePolicy::MaxScaled,
            covariance_type: CovarianceType::Full,
            weight_concentration: None,
            analysis: false,
            alternate_direction: false,
            historical_normalization: false,
            sim_name: "data".into(),
            extension: "txt".into(),
            seed: 0,
        }
    }

    pub fn n_iterations(mut self, k: usize) -> Self {
        self.n_iterations = k;
        self
    }

    pub fn n_samples(mut self, n: usize) -> Self {
        self.n_samples = Some(n);
        self
    }

    pub fn max_components(mut self, k: usize) -> Self {
        self.max_components = Some(k);
        self
    }

    pub fn ess_target(mut self, ess: f64) -> Self {
        self.ess_target = ess;
        self
    }

    pub fn sigma_max(mut self, sigma: f64) -> Self {
        self.sigma_max = sigma;
        self
    }

    pub fn sigma_min(mut self, sigma: f64) -> Self {
        self.sigma_min = sigma;
        self
    }

    pub fn covariance_policy(mut self, policy: CovariancePolicy) -> Self {
        self.covariance_policy = policy;
        self
    }

    pub fn covariance_type(mut self, covar: CovarianceType) -> Self {
        self.covariance_type = covar;
        self
    }

    pub fn weight_concentration(mut self, prior: f64) -> Self {
        self.weight_concentration = Some(prior);
        self
    }

    pub fn analysis(mut self, analysis: bool) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn alternate_direction(mut self, alternate: bool) -> Self {
        self.alternate_direction = alternate;
        self
    }

    pub fn historical_normalization(mut self, enabled: bool) -> Self {
        self.historical_normalization = enabled;
        self
    }

    pub fn sim_name(mut self, name: impl Into<String>) -> Self {
        self.sim_name = name.into();
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of unknown parameters.
    pub fn n_params(&self) -> usize {
        self.parameters.len()
    }

    /// Ensemble size with the `10 * P` default applied.
    pub fn ensemble_size(&self) -> usize {
        self.n_samples.unwrap_or(10 * self.parameters.len())
    }

    /// Component bound with the `N / 10` default applied, at least one.
    pub fn component_bound(&self) -> usize {
        self.max_components
            .unwrap_or(self.ensemble_size() / 10)
            .max(1)
    }

    /// Measurement data flattened in declaration order.
    pub fn flat_data(&self) -> Vec<f64> {
        self.measurements
            .iter()
            .flat_map(|m| m.data.iter().copied())
            .collect()
    }

    /// Measurement weights flattened in declaration order, scalars broadcast.
    pub fn flat_weights(&self) -> Vec<f64> {
        self.measurements
            .iter()
            .flat_map(|m| m.broadcast_weight())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.parameters.validate()?;
        if self.measurements.is_empty() {
            return Err(CalibrationError::InvalidSpec(
                "no reference measurements".into(),
            ));
        }
        for m in &self.measurements {
            m.validate()?;
        }
        if self.n_iterations == 0 {
            return Err(CalibrationError::InvalidSpec(
                "n_iterations must be positive".into(),
            ));
        }
        if self.ensemble_size() == 0 {
            return Err(CalibrationError::InvalidSpec(
                "n_samples must be positive".into(),
            ));
        }
        if !(self.ess_target > 0.0 && self.ess_target < 1.0) {
            return Err(CalibrationError::InvalidSpec(format!(
                "ess_target must lie in (0, 1), got {}",
                self.ess_target
            )));
        }
        if !(self.sigma_min > 0.0) || !(self.sigma_max > self.sigma_min) {
            return Err(CalibrationError::InvalidSpec(format!(
                "need 0 < sigma_min < sigma_max, got [{}, {}]",
                self.sigma_min, self.sigma_max
            )));
        }
        if let Some(w) = self.weight_concentration {
            if !(w > 0.0) {
                return Err(CalibrationError::InvalidSpec(
                    "weight_concentration must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CalibrationConfig {
        let params = ParameterSpec::new().with("param", 0.0, 1.0);
        let measurements = vec![Measurement::scalar("measure", 1.0, 1.0)];
        CalibrationConfig::new(params, measurements, "/tmp/run")
    }

    #[test]
    fn defaults_follow_problem_size() {
        let config = base_config();
        assert_eq!(config.ensemble_size(), 10);
        assert_eq!(config.component_bound(), 1);
        let config = config.n_samples(40);
        assert_eq!(config.component_bound(), 4);
    }

    #[test]
    fn rejects_empty_range() {
        let params = ParameterSpec::new().with("param", 1.0, 1.0);
        let config = CalibrationConfig::new(
            params,
            vec![Measurement::scalar("measure", 1.0, 1.0)],
            "/tmp/run",
        );
        assert!(matches!(
            config.validate(),
            Err(CalibrationError::InvalidSpec(_))
        ));
    }

    #[test]
    fn rejects_bad_ess_target() {
        let config = base_config().ess_target(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn weights_broadcast_to_data_length() {
        let m = Measurement::series("measure", vec![2.0, 3.0], vec![1.0]);
        assert_eq!(m.broadcast_weight(), vec![1.0, 1.0]);
    }

    #[test]
    fn flattening_preserves_declaration_order() {
        let params = ParameterSpec::new()
            .with("param", 0.0, 4.0)
            .with("param0", 0.0, 4.0);
        let measurements = vec![
            Measurement::scalar("measure0", 1.0, 1.0),
            Measurement::series("measure1", vec![2.0, 3.0], vec![1.0, 1.0]),
        ];
        let config = CalibrationConfig::new(params, measurements, "/tmp/run");
        assert_eq!(config.flat_data(), vec![1.0, 2.0, 3.0]);
        assert_eq!(config.flat_weights(), vec![1.0, 1.0, 1.0]);
    }
}
