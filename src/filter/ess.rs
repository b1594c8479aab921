use log::{debug, warn};

use crate::filter::update::{PosteriorState, UpdateInputs};
use crate::optimize::{brent_min, brent_root};

/// Search for the observation-noise scale whose posterior hits the target
/// effective sample size.
///
/// Every probe of the objective re-runs the full recursive update over all
/// steps and samples, so the search leans on a handful of well-placed
/// evaluations rather than a dense sweep.
#[derive(Debug, Clone)]
pub struct EssSolver {
    /// Target normalized effective sample size.
    pub target: f64,
    /// Lower bound of the noise scale; raised by ten percent at a time while
    /// the objective is non-finite there.
    pub sigma_min: f64,
    /// Upper bound of the noise scale; the committed scale of one iteration
    /// becomes the bound of the next.
    pub sigma_max: f64,
    /// Interval tolerance of the root search.
    pub tolerance: f64,
}

impl EssSolver {
    /// Choose the noise scale and return it with its committed posterior
    /// state.
    ///
    /// `proposal_informed` selects the search variant used when the ensemble
    /// was drawn from a trained proposal: minimize the objective first, and
    /// only chase the exact target below the minimizer if the minimum
    /// overshoots it.
    ///
    /// A numerically infeasible problem never aborts: the solver warns and
    /// commits the (possibly relaxed) lower bound.
    pub fn solve(&self, inputs: &UpdateInputs, proposal_informed: bool) -> (f64, PosteriorState) {
        let objective = |sigma: f64| self.target - inputs.evaluate(sigma).final_ess();

        // the objective degenerates to 0/0 when every likelihood underflows;
        // back off the lower bound until it is finite
        let mut sigma_min = self.sigma_min;
        let mut f_min = objective(sigma_min);
        while !f_min.is_finite() && sigma_min < self.sigma_max {
            sigma_min *= 1.1;
            f_min = objective(sigma_min);
        }
        if !f_min.is_finite() {
            warn!(
                "effective sample size is undefined everywhere in [{:e}, {:e}]; committing the lower bound",
                self.sigma_min, self.sigma_max
            );
            return self.commit(inputs, sigma_min);
        }
        if sigma_min > self.sigma_min {
            debug!("raised sigma_min to {:e} for a finite objective", sigma_min);
        }

        let f_max = objective(self.sigma_max);
        let sigma = if !f_max.is_finite() || f_min * f_max > 0.0 {
            warn!(
                "no noise scale in [{:e}, {:e}] reaches ESS target {}; committing the lower bound",
                sigma_min, self.sigma_max, self.target
            );
            sigma_min
        } else if !proposal_informed {
            brent_root(objective, sigma_min, self.sigma_max, self.tolerance)
        } else {
            // with a trained proposal the objective need not cross zero;
            // find its minimum first
            let candidate = brent_min(objective, sigma_min, self.sigma_max, self.tolerance);
            if objective(candidate) < 0.0 {
                brent_root(objective, sigma_min, candidate, self.tolerance)
            } else {
                candidate
            }
        };
        self.commit(inputs, sigma)
    }

    fn commit(&self, inputs: &UpdateInputs, sigma: f64) -> (f64, PosteriorState) {
        let state = inputs.evaluate(sigma);
        debug!(
            "committed sigma {:e} with normalized ESS {}",
            sigma,
            state.final_ess()
        );
        (sigma, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CovariancePolicy;
    use crate::observation::ObservationSet;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, Array3};

    fn identity_problem(
        samples: Vec<f64>,
        data: f64,
    ) -> (Array2<f64>, Array3<f64>, ObservationSet, Array1<f64>) {
        let n = samples.len();
        let ensemble = Array2::from_shape_vec((n, 1), samples.clone()).unwrap();
        let mut simulated = Array3::zeros((1, n, 1));
        for i in 0..n {
            simulated[[0, i, 0]] = samples[i];
        }
        let observations = ObservationSet {
            data: Array2::from_elem((1, 1), data),
            weights: Array2::from_elem((1, 1), 1.0),
            control: None,
            channels: vec!["y0".into()],
        };
        let proposal = Array1::from_elem(n, 1.0 / n as f64);
        (ensemble, simulated, observations, proposal)
    }

    fn spread(n: usize) -> Vec<f64> {
        (0..n).map(|i| 0.05 + 1.9 * i as f64 / n as f64).collect()
    }

    #[test]
    fn hits_the_ess_target() {
        let (ensemble, simulated, observations, proposal) = identity_problem(spread(30), 1.0);
        let inputs = UpdateInputs {
            samples: ensemble.view(),
            simulated: simulated.view(),
            observations: &observations,
            proposal: proposal.view(),
            policy: CovariancePolicy::MaxScaled,
        };
        let solver = EssSolver {
            target: 0.2,
            sigma_min: 1e-4,
            sigma_max: 10.0,
            tolerance: 1e-4,
        };
        let (sigma, state) = solver.solve(&inputs, false);
        assert!(sigma > 1e-4 && sigma < 10.0);
        assert_abs_diff_eq!(state.final_ess(), 0.2, epsilon = 1e-2);
    }

    #[test]
    fn proposal_branch_also_hits_the_target() {
        let (ensemble, simulated, observations, proposal) = identity_problem(spread(30), 1.0);
        let inputs = UpdateInputs {
            samples: ensemble.view(),
            simulated: simulated.view(),
            observations: &observations,
            proposal: proposal.view(),
            policy: CovariancePolicy::MaxScaled,
        };
        let solver = EssSolver {
            target: 0.2,
            sigma_min: 1e-4,
            sigma_max: 10.0,
            tolerance: 1e-4,
        };
        let (_, state) = solver.solve(&inputs, true);
        assert!(state.final_ess() >= 0.2 - 1e-2);
    }

    #[test]
    fn single_sample_falls_back_to_sigma_min() {
        // ESS/N is identically one, the objective never crosses zero
        let (ensemble, simulated, observations, proposal) = identity_problem(vec![0.7], 1.0);
        let inputs = UpdateInputs {
            samples: ensemble.view(),
            simulated: simulated.view(),
            observations: &observations,
            proposal: proposal.view(),
            policy: CovariancePolicy::MaxScaled,
        };
        let solver = EssSolver {
            target: 0.2,
            sigma_min: 1e-4,
            sigma_max: 1.0,
            tolerance: 1e-2,
        };
        let (sigma, state) = solver.solve(&inputs, false);
        assert_abs_diff_eq!(sigma, 1e-4);
        assert_abs_diff_eq!(state.final_ess(), 1.0);
    }

    #[test]
    fn relaxes_sigma_min_out_of_underflow() {
        // samples far from the reference underflow every likelihood at the
        // initial lower bound
        let (ensemble, simulated, observations, proposal) =
            identity_problem(vec![120.0, 150.0, 180.0], 1.0);
        let inputs = UpdateInputs {
            samples: ensemble.view(),
            simulated: simulated.view(),
            observations: &observations,
            proposal: proposal.view(),
            policy: CovariancePolicy::MaxScaled,
        };
        let solver = EssSolver {
            target: 0.5,
            sigma_min: 1e-8,
            sigma_max: 1e6,
            tolerance: 1e-2,
        };
        let (sigma, state) = solver.solve(&inputs, false);
        assert!(sigma > 1e-8);
        assert!(state.final_ess().is_finite());
    }

    #[test]
    fn infeasible_problem_commits_without_panicking() {
        // an all-zero reference zeroes the covariance; the objective is NaN
        // for every sigma
        let (ensemble, simulated, observations, proposal) =
            identity_problem(vec![0.5, 1.5], 0.0);
        let inputs = UpdateInputs {
            samples: ensemble.view(),
            simulated: simulated.view(),
            observations: &observations,
            proposal: proposal.view(),
            policy: CovariancePolicy::MaxScaled,
        };
        let solver = EssSolver {
            target: 0.3,
            sigma_min: 1e-4,
            sigma_max: 2.0,
            tolerance: 1e-2,
        };
        let (sigma, _) = solver.solve(&inputs, false);
        assert!(sigma >= 1e-4);
    }
}
