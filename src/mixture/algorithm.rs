use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{s, Array, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::digamma;

use crate::config::CovarianceType;
use crate::error::{CalibrationError, Result};
use crate::mixture::hyperparams::BayesMixtureParams;

/// A fitted variational Bayesian Gaussian mixture.
///
/// The fit places a Dirichlet prior on the mixture weights and a
/// Gaussian-Wishart prior on each component; components that receive no
/// responsibility keep weights near the concentration prior, so the
/// effective number of components adapts to the data. After convergence the
/// posterior expectations are collapsed into a plain mixture
/// (weights, means, covariances) for scoring and sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesMixture {
    covariance_type: CovarianceType,
    weight_concentration: Array1<f64>,
    weights: Array1<f64>,
    means: Array2<f64>,
    covariances: Array3<f64>,
    precisions_chol: Array3<f64>,
}

/// Gaussian-Wishart and Dirichlet prior parameters, derived from the data.
struct Priors {
    alpha: f64,
    beta: f64,
    mean: Array1<f64>,
    nu: f64,
    scale_inv: Array2<f64>,
}

impl Priors {
    fn from_data(
        observations: &ArrayView2<f64>,
        counts: &Array1<f64>,
        alpha: f64,
        reg: f64,
    ) -> Priors {
        let n_features = observations.ncols();
        let total: f64 = counts.sum();
        let mean = observations.t().dot(counts) / total;
        let mut scale_inv = Array2::zeros((n_features, n_features));
        for (row, &c) in observations.outer_iter().zip(counts.iter()) {
            let diff = &row - &mean;
            for i in 0..n_features {
                for j in 0..n_features {
                    scale_inv[[i, j]] += c * diff[i] * diff[j];
                }
            }
        }
        scale_inv /= total;
        for i in 0..n_features {
            scale_inv[[i, i]] += reg;
        }
        Priors {
            alpha,
            beta: 1.0,
            mean,
            nu: n_features as f64,
            scale_inv,
        }
    }
}

/// Posterior parameters of one variational sweep.
#[derive(Clone)]
struct FitState {
    alpha: Array1<f64>,
    beta: Array1<f64>,
    nu: Array1<f64>,
    means: Array2<f64>,
    scale_inv: Array3<f64>,
}

impl<R: Rng + Clone> BayesMixtureParams<R> {
    /// Fit the mixture on `observations` with one non-negative weight per
    /// row.
    ///
    /// Restarts `n_init` times from random responsibilities and keeps the
    /// converged run with the best variational criterion; every restart
    /// failing to converge within the iteration budget is a
    /// [`FitFailure`](CalibrationError::FitFailure).
    pub fn fit(
        &self,
        observations: &ArrayView2<f64>,
        sample_weights: &ArrayView1<f64>,
    ) -> Result<BayesMixture> {
        self.validate()?;
        let n_samples = observations.nrows();
        let n_features = observations.ncols();
        if sample_weights.len() != n_samples {
            return Err(CalibrationError::shape(
                "mixture sample weights",
                format!("{}", n_samples),
                format!("{}", sample_weights.len()),
            ));
        }
        let total: f64 = sample_weights.sum();
        if !(total > 0.0) || sample_weights.iter().any(|&w| w < 0.0 || !w.is_finite()) {
            return Err(CalibrationError::InvalidSpec(
                "mixture sample weights must be non-negative with positive sum".into(),
            ));
        }
        // effective counts: the weighted rows stand in for a resampled
        // dataset of the original size
        let counts = sample_weights.mapv(|w| w * n_samples as f64 / total);

        let n_clusters = self.get_max_components();
        let priors = Priors::from_data(
            observations,
            &counts,
            self.get_weight_concentration(),
            self.get_reg_covariance(),
        );

        let mut rng = self.rng();
        let mut best: Option<(f64, FitState)> = None;
        for _ in 0..self.get_n_init() {
            let mut resp = Array2::random_using(
                (n_samples, n_clusters),
                Uniform::new(0., 1.),
                &mut rng,
            );
            let totals = resp.sum_axis(Axis(1)).insert_axis(Axis(1));
            resp = resp / &totals;

            let mut state = self.m_step(observations, &counts, &resp, &priors);
            let mut prev_criterion = f64::NEG_INFINITY;
            let mut converged = None;
            for _ in 0..self.get_max_iterations() {
                let (criterion, log_resp) = match e_step(&state, observations) {
                    Ok(step) => step,
                    // ill-conditioned sweep; give up on this restart
                    Err(_) => break,
                };
                state = self.m_step(observations, &counts, &log_resp.mapv(f64::exp), &priors);
                if (criterion - prev_criterion).abs() < self.get_tolerance() {
                    converged = Some(criterion);
                    break;
                }
                prev_criterion = criterion;
            }
            if let Some(criterion) = converged {
                if best.as_ref().map_or(true, |(b, _)| criterion > *b) {
                    best = Some((criterion, state));
                }
            }
        }

        let (_, state) = best.ok_or(CalibrationError::FitFailure)?;

        let alpha_total = state.alpha.sum();
        let weights = state.alpha.mapv(|a| a / alpha_total);
        let mut covariances = Array3::zeros((n_clusters, n_features, n_features));
        for k in 0..n_clusters {
            let cov = state.scale_inv.index_axis(Axis(0), k).mapv(|v| v / state.nu[k]);
            covariances.slice_mut(s![k, .., ..]).assign(&cov);
        }
        let precisions_chol = precisions_cholesky(&covariances)?;
        Ok(BayesMixture {
            covariance_type: self.get_covariance_type(),
            weight_concentration: state.alpha,
            weights,
            means: state.means,
            covariances,
            precisions_chol,
        })
    }

    fn m_step(
        &self,
        observations: &ArrayView2<f64>,
        counts: &Array1<f64>,
        resp: &Array2<f64>,
        priors: &Priors,
    ) -> FitState {
        let n_features = observations.ncols();
        let n_clusters = self.get_max_components();

        // responsibilities scaled by the per-row effective counts
        let mut resp_w = resp.clone();
        for (mut row, &c) in resp_w.outer_iter_mut().zip(counts.iter()) {
            row.mapv_inplace(|r| r * c);
        }
        let nk = resp_w.sum_axis(Axis(0)) + 10.0 * f64::EPSILON;
        let means_emp = resp_w.t().dot(observations) / &nk.clone().insert_axis(Axis(1));

        let alpha = nk.mapv(|n| priors.alpha + n);
        let beta = nk.mapv(|n| priors.beta + n);
        let nu = nk.mapv(|n| priors.nu + n);

        let mut means = Array2::zeros((n_clusters, n_features));
        let mut scale_inv = Array3::zeros((n_clusters, n_features, n_features));
        for k in 0..n_clusters {
            let xbar = means_emp.row(k);
            means
                .row_mut(k)
                .assign(&((&priors.mean * priors.beta + &xbar * nk[k]) / beta[k]));

            let diff = &observations.to_owned() - &xbar;
            let weighted = diff.t().to_owned() * &resp_w.slice(s![.., k]);
            let mut sk = weighted.dot(&diff);
            let dev = &xbar.to_owned() - &priors.mean;
            let shrink = priors.beta * nk[k] / beta[k];
            for i in 0..n_features {
                for j in 0..n_features {
                    sk[[i, j]] += priors.scale_inv[[i, j]] + shrink * dev[i] * dev[j];
                }
                sk[[i, i]] += self.get_reg_covariance();
            }
            scale_inv.slice_mut(s![k, .., ..]).assign(&sk);
        }
        restrict_structure(&mut scale_inv, self.get_covariance_type(), &nk);
        FitState {
            alpha,
            beta,
            nu,
            means,
            scale_inv,
        }
    }
}

/// Expected log responsibilities under the current posterior parameters.
///
/// Returns the mean log normalizer (the convergence criterion) and the log
/// responsibilities.
fn e_step(state: &FitState, observations: &ArrayView2<f64>) -> Result<(f64, Array2<f64>)> {
    let n_samples = observations.nrows();
    let n_features = observations.ncols();
    let n_clusters = state.means.nrows();

    let prec_chol = precisions_cholesky(&state.scale_inv)?;
    let half_log_det = log_det_cholesky(&prec_chol, n_features);
    let quad = mahalanobis_sq(observations, &state.means, &prec_chol);

    let alpha_total = state.alpha.sum();
    let digamma_total = digamma(alpha_total);

    let mut log_rho = Array2::zeros((n_samples, n_clusters));
    for k in 0..n_clusters {
        let log_pi = digamma(state.alpha[k]) - digamma_total;
        let mut log_lambda = n_features as f64 * std::f64::consts::LN_2 + 2.0 * half_log_det[k];
        for d in 0..n_features {
            log_lambda += digamma(0.5 * (state.nu[k] - d as f64));
        }
        let constant = log_pi + 0.5 * log_lambda
            - 0.5 * n_features as f64 * (2.0 * std::f64::consts::PI).ln()
            - 0.5 * n_features as f64 / state.beta[k];
        for i in 0..n_samples {
            log_rho[[i, k]] = constant - 0.5 * state.nu[k] * quad[[i, k]];
        }
    }

    let mut log_resp = log_rho;
    let mut norm_sum = 0.0;
    for mut row in log_resp.outer_iter_mut() {
        let norm = logsumexp(row.view());
        row.mapv_inplace(|v| v - norm);
        norm_sum += norm;
    }
    Ok((norm_sum / n_samples as f64, log_resp))
}

impl BayesMixture {
    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn means(&self) -> &Array2<f64> {
        &self.means
    }

    pub fn covariances(&self) -> &Array3<f64> {
        &self.covariances
    }

    pub fn covariance_type(&self) -> CovarianceType {
        self.covariance_type
    }

    pub fn n_components(&self) -> usize {
        self.means.nrows()
    }

    /// Largest component-mean magnitude; drives the historical
    /// normalization shim in the proposal evaluation.
    pub fn max_mean_magnitude(&self) -> f64 {
        self.means
            .iter()
            .fold(0.0f64, |acc, &m| acc.max(m.abs()))
    }

    /// Log density of the mixture at each row of `observations`.
    pub fn score_samples(&self, observations: &ArrayView2<f64>) -> Array1<f64> {
        let n_features = self.means.ncols();
        let quad = mahalanobis_sq(observations, &self.means, &self.precisions_chol);
        let half_log_det = log_det_cholesky(&self.precisions_chol, n_features);
        let norm = 0.5 * n_features as f64 * (2.0 * std::f64::consts::PI).ln();

        let mut scores = Array1::zeros(observations.nrows());
        let log_weights = self.weights.mapv(f64::ln);
        for (i, q_row) in quad.outer_iter().enumerate() {
            let weighted: Array1<f64> = q_row
                .iter()
                .zip(log_weights.iter())
                .zip(half_log_det.iter())
                .map(|((&q, &lw), &ld)| lw + ld - 0.5 * q - norm)
                .collect();
            scores[i] = logsumexp(weighted.view());
        }
        scores
    }

    /// Draw `n` independent samples: a component by its weight, then a
    /// Gaussian draw from that component.
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Array2<f64>> {
        let n_features = self.means.ncols();
        let mut chols: Vec<Option<Array2<f64>>> = vec![None; self.n_components()];
        let mut draws = Array2::zeros((n, n_features));
        for mut row in draws.outer_iter_mut() {
            let k = self.pick_component(rng.gen());
            if chols[k].is_none() {
                chols[k] = Some(self.covariances.index_axis(Axis(0), k).cholesky()?);
            }
            let chol = chols[k].as_ref().unwrap();
            let z: Array1<f64> = Array::random_using(n_features, StandardNormal, rng);
            row.assign(&(&self.means.row(k) + &chol.dot(&z)));
        }
        Ok(draws)
    }

    fn pick_component(&self, u: f64) -> usize {
        let mut acc = 0.0;
        for (k, &w) in self.weights.iter().enumerate() {
            acc += w;
            if u < acc {
                return k;
            }
        }
        self.weights.len() - 1
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> Result<BayesMixture> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Constrain the Wishart scale updates to the requested covariance
/// structure. Full is untouched; tied shares one pooled matrix; diag and
/// spherical zero the couplings.
fn restrict_structure(scale_inv: &mut Array3<f64>, covar: CovarianceType, nk: &Array1<f64>) {
    let n_clusters = scale_inv.shape()[0];
    let n_features = scale_inv.shape()[1];
    match covar {
        CovarianceType::Full => {}
        CovarianceType::Tied => {
            let total: f64 = nk.sum();
            let mut pooled = Array2::zeros((n_features, n_features));
            for k in 0..n_clusters {
                pooled += &scale_inv.index_axis(Axis(0), k).mapv(|v| v * nk[k] / total);
            }
            for k in 0..n_clusters {
                scale_inv.slice_mut(s![k, .., ..]).assign(&pooled);
            }
        }
        CovarianceType::Diag => {
            for k in 0..n_clusters {
                for i in 0..n_features {
                    for j in 0..n_features {
                        if i != j {
                            scale_inv[[k, i, j]] = 0.0;
                        }
                    }
                }
            }
        }
        CovarianceType::Spherical => {
            for k in 0..n_clusters {
                let mut trace = 0.0;
                for i in 0..n_features {
                    trace += scale_inv[[k, i, i]];
                }
                let iso = trace / n_features as f64;
                for i in 0..n_features {
                    for j in 0..n_features {
                        scale_inv[[k, i, j]] = if i == j { iso } else { 0.0 };
                    }
                }
            }
        }
    }
}

fn precisions_cholesky(covariances: &Array3<f64>) -> Result<Array3<f64>> {
    let n_features = covariances.shape()[1];
    let mut precisions_chol = Array3::zeros(covariances.raw_dim());
    for (k, covariance) in covariances.outer_iter().enumerate() {
        let sol = {
            let decomp = covariance.cholesky()?;
            decomp.solve_triangular_into(Array::eye(n_features), UPLO::Lower)?
        };
        precisions_chol.slice_mut(s![k, .., ..]).assign(&sol.t());
    }
    Ok(precisions_chol)
}

/// Half log determinants of the precision matrices, read off the Cholesky
/// diagonals.
fn log_det_cholesky(matrix_chol: &Array3<f64>, n_features: usize) -> Array1<f64> {
    let n_clusters = matrix_chol.shape()[0];
    matrix_chol
        .to_owned()
        .into_shape((n_clusters, n_features * n_features))
        .unwrap()
        .slice(s![.., ..; n_features + 1])
        .mapv(|v| v.ln())
        .sum_axis(Axis(1))
}

/// Squared Mahalanobis distances of every observation to every component.
fn mahalanobis_sq(
    observations: &ArrayView2<f64>,
    means: &Array2<f64>,
    precisions_chol: &Array3<f64>,
) -> Array2<f64> {
    let n_samples = observations.nrows();
    let n_clusters = means.nrows();
    let mut quad = Array2::zeros((n_samples, n_clusters));
    for k in 0..n_clusters {
        let diff = &observations.to_owned() - &means.row(k);
        let proj = diff.dot(&precisions_chol.index_axis(Axis(0), k));
        quad.slice_mut(s![.., k])
            .assign(&proj.mapv(|v| v * v).sum_axis(Axis(1)));
    }
    quad
}

fn logsumexp(row: ArrayView1<f64>) -> f64 {
    let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if !max.is_finite() {
        return max;
    }
    max + row.mapv(|v| (v - max).exp()).sum().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};
    use ndarray_rand::rand_distr::Normal;
    use rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    fn two_blobs(n_per: usize, rng: &mut Isaac64Rng) -> Array2<f64> {
        let left: Array2<f64> =
            Array::random_using((n_per, 1), Normal::new(-4.0, 0.3).unwrap(), rng);
        let right: Array2<f64> =
            Array::random_using((n_per, 1), Normal::new(4.0, 0.3).unwrap(), rng);
        ndarray::concatenate(Axis(0), &[left.view(), right.view()]).unwrap()
    }

    #[test]
    fn recovers_separated_blobs() {
        let mut rng = Isaac64Rng::seed_from_u64(7);
        let data = two_blobs(60, &mut rng);
        let weights = Array1::from_elem(120, 1.0 / 120.0);
        let gmm = BayesMixtureParams::new(2)
            .n_init(5)
            .fit(&data.view(), &weights.view())
            .unwrap();

        let mut centers: Vec<f64> = gmm.means().column(0).to_vec();
        centers.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_abs_diff_eq!(centers[0], -4.0, epsilon = 0.5);
        assert_abs_diff_eq!(centers[1], 4.0, epsilon = 0.5);
        assert_abs_diff_eq!(gmm.weights().sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn row_weights_steer_the_fit() {
        // all mass on the right blob: a one-component fit must land there
        let mut rng = Isaac64Rng::seed_from_u64(11);
        let data = two_blobs(40, &mut rng);
        let mut weights = Array1::zeros(80);
        weights.slice_mut(s![40..]).fill(1.0 / 40.0);
        let gmm = BayesMixtureParams::new(1)
            .n_init(3)
            .fit(&data.view(), &weights.view())
            .unwrap();
        assert_abs_diff_eq!(gmm.means()[[0, 0]], 4.0, epsilon = 0.5);
    }

    #[test]
    fn score_samples_peaks_at_the_data() {
        let mut rng = Isaac64Rng::seed_from_u64(3);
        let data = two_blobs(50, &mut rng);
        let weights = Array1::from_elem(100, 0.01);
        let gmm = BayesMixtureParams::new(2)
            .n_init(5)
            .fit(&data.view(), &weights.view())
            .unwrap();
        let probe = array![[4.0], [0.0]];
        let scores = gmm.score_samples(&probe.view());
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn draws_follow_the_mixture() {
        let mut rng = Isaac64Rng::seed_from_u64(19);
        let data = two_blobs(50, &mut rng);
        let weights = Array1::from_elem(100, 1.0);
        let gmm = BayesMixtureParams::new(2)
            .n_init(5)
            .fit(&data.view(), &weights.view())
            .unwrap();
        let draws = gmm.sample(400, &mut rng).unwrap();
        let near: usize = draws
            .column(0)
            .iter()
            .filter(|v| (v.abs() - 4.0).abs() < 2.0)
            .count();
        assert!(near > 350, "{} of 400 draws near the blobs", near);
    }

    #[test]
    fn persistence_round_trips() {
        let mut rng = Isaac64Rng::seed_from_u64(23);
        let data = two_blobs(30, &mut rng);
        let weights = Array1::from_elem(60, 1.0);
        let gmm = BayesMixtureParams::new(2)
            .n_init(3)
            .fit(&data.view(), &weights.view())
            .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gmm.json");
        gmm.save(&path).unwrap();
        let loaded = BayesMixture::load(&path).unwrap();
        assert_eq!(loaded.means(), gmm.means());
        assert_eq!(loaded.weights(), gmm.weights());

        let probe = array![[1.0], [-1.0]];
        assert_eq!(
            loaded.score_samples(&probe.view()),
            gmm.score_samples(&probe.view())
        );
    }

    #[test]
    fn degenerate_single_sample_fits() {
        let data = array![[0.5, 0.25]];
        let weights = array![1.0];
        let gmm = BayesMixtureParams::new(1)
            .n_init(2)
            .fit(&data.view(), &weights.view())
            .unwrap();
        assert_abs_diff_eq!(gmm.means()[[0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(gmm.means()[[0, 1]], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn rejects_mismatched_weights() {
        let data = array![[0.0], [1.0]];
        let weights = array![1.0];
        assert!(BayesMixtureParams::new(1)
            .fit(&data.view(), &weights.view())
            .is_err());
    }
}
