use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use ndarray_stats::QuantileExt;

use crate::config::CovariancePolicy;
use crate::observation::ObservationSet;

/// Everything one posterior evaluation depends on. The update is a pure
/// function of these values and the noise scale, which is what lets the
/// noise-scale search re-run it freely.
pub struct UpdateInputs<'a> {
    /// `N x P` parameter ensemble.
    pub samples: ArrayView2<'a, f64>,
    /// `T x N x M` simulated observations.
    pub simulated: ArrayView3<'a, f64>,
    /// Reference data and weights, already reversed by the driver when the
    /// iteration runs backwards.
    pub observations: &'a ObservationSet,
    /// Proposal probability of each sample.
    pub proposal: ArrayView1<'a, f64>,
    pub policy: CovariancePolicy,
}

/// Posterior evaluation over all assimilation steps at a fixed noise scale.
#[derive(Debug, Clone)]
pub struct PosteriorState {
    /// `N x T` normalized likelihood per step.
    pub likelihood: Array2<f64>,
    /// `N x T` normalized posterior per step.
    pub posterior: Array2<f64>,
    /// `P x T` ensemble mean per step.
    pub ips: Array2<f64>,
    /// `P x T` coefficient of variation per step.
    pub covs: Array2<f64>,
    /// Normalized effective sample size per step.
    pub ess: Array1<f64>,
    /// The noise scale this state was evaluated at.
    pub sigma: f64,
}

impl PosteriorState {
    /// Normalized effective sample size at the last assimilation step.
    pub fn final_ess(&self) -> f64 {
        self.ess[self.ess.len() - 1]
    }
}

impl<'a> UpdateInputs<'a> {
    pub fn n_samples(&self) -> usize {
        self.samples.nrows()
    }

    pub fn n_steps(&self) -> usize {
        self.simulated.shape()[0]
    }

    /// Run the recursive Bayesian update over all steps at noise scale
    /// `sigma`.
    ///
    /// Per step: a diagonal multivariate Gaussian likelihood of the residual,
    /// normalized over the ensemble; the posterior divides out the proposal
    /// at the first step and multiplies the likelihood recursively
    /// afterwards, renormalizing each step.
    pub fn evaluate(&self, sigma: f64) -> PosteriorState {
        let n_samples = self.n_samples();
        let n_params = self.samples.ncols();
        let n_steps = self.n_steps();
        let n_channels = self.observations.n_channels();
        let data = &self.observations.data;
        let weights = &self.observations.weights;

        // per-channel scale of the max-scaled policy, shared by every step
        let channel_max: Array1<f64> = (0..n_channels)
            .map(|j| *data.column(j).max().unwrap_or(&0.0))
            .collect();

        let mut likelihood = Array2::zeros((n_samples, n_steps));
        let mut posterior = Array2::zeros((n_samples, n_steps));
        let mut ips = Array2::zeros((n_params, n_steps));
        let mut covs = Array2::zeros((n_params, n_steps));
        let mut ess = Array1::zeros(n_steps);

        for t in 0..n_steps {
            // diagonal covariance for this step
            let variance: Array1<f64> = (0..n_channels)
                .map(|j| {
                    let scale = match self.policy {
                        CovariancePolicy::MaxScaled => channel_max[j],
                        CovariancePolicy::PointScaled => data[[t, j]],
                    };
                    sigma * weights[[t, j]] * scale * scale
                })
                .collect();

            for i in 0..n_samples {
                let mut power = 0.0;
                for j in 0..n_channels {
                    let residual = data[[t, j]] - self.simulated[[t, i, j]];
                    power += residual * residual / variance[j];
                }
                likelihood[[i, t]] = (-0.5 * power).exp();
            }
            let like_sum = likelihood.column(t).sum();
            likelihood.column_mut(t).mapv_inplace(|v| v / like_sum);

            for i in 0..n_samples {
                posterior[[i, t]] = if t == 0 {
                    likelihood[[i, 0]] / self.proposal[i]
                } else {
                    posterior[[i, t - 1]] * likelihood[[i, t]]
                };
            }
            let post_sum = posterior.column(t).sum();
            posterior.column_mut(t).mapv_inplace(|v| v / post_sum);

            // ensemble mean and coefficient of variation
            for p in 0..n_params {
                let mean = self.samples.column(p).dot(&posterior.column(t));
                let var = self
                    .samples
                    .column(p)
                    .iter()
                    .zip(posterior.column(t).iter())
                    .map(|(&x, &w)| w * (x - mean) * (x - mean))
                    .sum::<f64>();
                ips[[p, t]] = mean;
                covs[[p, t]] = var.sqrt() / mean;
            }

            ess[t] = 1.0
                / (posterior.column(t).mapv(|w| w * w).sum() * n_samples as f64);
        }

        PosteriorState {
            likelihood,
            posterior,
            ips,
            covs,
            ess,
            sigma,
        }
    }
}

/// Reverse the time axis of a simulation tensor; the counterpart of
/// [`ObservationSet::reversed`] for the gateway output.
pub fn reverse_time(simulated: &ArrayView3<f64>) -> Array3<f64> {
    let mut reversed = simulated.to_owned();
    reversed.invert_axis(Axis(0));
    reversed
}
