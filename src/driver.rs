//! The resumable iteration loop.
//!
//! Every state transition is predicated on a filesystem artifact, so the
//! driver is idempotent across process restarts: parameter tables gate the
//! iterations, simulation directories gate the scoring, and a missing
//! simulation directory is a normal pause while the external solver runs.
//!
//! Artifacts inside the work directory:
//!
//! - `Exp/data.txt`: flattened reference data, written before iteration 0
//! - `smc_table{k}.txt`: the parameter ensemble of iteration `k`
//! - `Sim{k}/`: merged per-sample solver output (written externally)
//! - `gmm{k}.json`: the proposal model that generated table `k`
//! - `sigma{k}.txt`: the committed noise scale of iteration `k`
//! - `samples.txt`, `ips.txt`, `weights.txt`: statistics of the latest
//!   scored iteration

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, Result};
use crate::filter::{reverse_time, EssSolver, UpdateInputs};
use crate::gateway::{PostHocReader, SimulatorGateway};
use crate::mixture::{BayesMixture, BayesMixtureParams};
use crate::observation::ObservationSet;
use crate::proposal::proposal_weights;
use crate::sampling::halton_ensemble;
use crate::table;

/// Interval tolerance of the noise-scale search.
const ESS_SEARCH_TOL: f64 = 1e-2;

/// What a driver invocation ended with.
#[derive(Debug)]
pub enum RunOutcome {
    /// The ensemble of `iteration` is written but its simulations are not on
    /// disk. Run the external solver over `table` into `sim_dir`, then
    /// invoke the driver again.
    NeedsSimulations {
        iteration: usize,
        table: PathBuf,
        sim_dir: PathBuf,
    },
    /// All iterations are scored.
    Completed(CalibrationResult),
}

/// Final statistics of a run.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// `P x T` ensemble mean per parameter and step, forward time order.
    pub ips: Array2<f64>,
    /// `P x T` coefficient of variation, forward time order.
    pub covs: Array2<f64>,
    /// Committed noise scale of the last iteration.
    pub sigma: f64,
    /// Normalized effective sample size at the last step.
    pub ess: f64,
}

impl CalibrationResult {
    /// Ensemble mean of parameter `p` at the last assimilation step.
    pub fn identified(&self, p: usize) -> f64 {
        self.ips[[p, self.ips.ncols() - 1]]
    }

    /// Coefficient of variation of parameter `p` at the last step.
    pub fn variation(&self, p: usize) -> f64 {
        self.covs[[p, self.covs.ncols() - 1]]
    }
}

/// The iteration driver. Holds the validated configuration and a gateway to
/// the external solver's output; all run state lives on disk.
pub struct Calibrator<G> {
    config: CalibrationConfig,
    gateway: G,
}

impl Calibrator<PostHocReader> {
    /// Driver over the standard post-hoc file reader.
    pub fn new(config: CalibrationConfig) -> Result<Self> {
        let gateway = PostHocReader::new(config.sim_name.clone(), config.extension.clone());
        Self::with_gateway(config, gateway)
    }
}

impl<G: SimulatorGateway> Calibrator<G> {
    pub fn with_gateway(config: CalibrationConfig, gateway: G) -> Result<Self> {
        config.validate()?;
        Ok(Calibrator { config, gateway })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Advance the run as far as the on-disk artifacts allow.
    ///
    /// Returns [`RunOutcome::NeedsSimulations`] as soon as an iteration is
    /// missing its solver output; re-invoking after the solver ran picks up
    /// exactly where this call left off.
    pub fn run(&self) -> Result<RunOutcome> {
        let cfg = &self.config;
        fs::create_dir_all(&cfg.work_dir)?;
        let observations = self.prepare_observations()?;
        let names: Vec<&str> = cfg.parameters.names().collect();

        let mut sigma_max = cfg.sigma_max;
        let mut last: Option<CalibrationResult> = None;

        for k in 0..cfg.n_iterations {
            let table_k = self.table_path(k);
            let table_next = self.table_path(k + 1);
            let sigma_file = cfg.work_dir.join(format!("sigma{}.txt", k));

            if !table_k.exists() {
                if k > 0 {
                    return Err(CalibrationError::InvalidSpec(format!(
                        "parameter table {:?} is missing mid-run; restore it or remove the later artifacts",
                        table_k
                    )));
                }
                let ensemble = halton_ensemble(&cfg.parameters, cfg.ensemble_size())?;
                table::write_table(&table_k, &ensemble, &names)?;
                info!("wrote initial parameter table {:?}", table_k);
            }

            if table_next.exists() && !cfg.analysis {
                // iteration already scored in a previous invocation; only
                // carry its committed noise scale forward
                if let Some(sigma) = read_sigma(&sigma_file) {
                    sigma_max = sigma_max.min(sigma);
                }
                continue;
            }

            let samples = table::read_table(&table_k, cfg.n_params())?;
            let n_samples = samples.nrows();

            let tensor =
                match self
                    .gateway
                    .load(&samples.view(), k, &cfg.work_dir, &observations)?
                {
                    Some(tensor) => tensor,
                    None => {
                        info!(
                            "no simulation output for iteration {}; run the solver over {:?}, then re-invoke",
                            k, table_k
                        );
                        return Ok(RunOutcome::NeedsSimulations {
                            iteration: k,
                            table: table_k,
                            sim_dir: PostHocReader::sim_dir(&cfg.work_dir, k),
                        });
                    }
                };

            // proposal of the ensemble: uniform unless a trained model
            // generated this table
            let gmm_file = self.gmm_path(k);
            let (proposal, informed) = if gmm_file.exists() {
                let model = BayesMixture::load(&gmm_file)?;
                (
                    proposal_weights(&model, &samples.view(), cfg.historical_normalization),
                    true,
                )
            } else {
                (Array1::from_elem(n_samples, 1.0 / n_samples as f64), false)
            };

            let reverse = cfg.alternate_direction && k % 2 == 1;
            let (obs_k, sim_k) = if reverse {
                (observations.reversed(), reverse_time(&tensor.view()))
            } else {
                (observations.clone(), tensor)
            };

            let inputs = UpdateInputs {
                samples: samples.view(),
                simulated: sim_k.view(),
                observations: &obs_k,
                proposal: proposal.view(),
                policy: cfg.covariance_policy,
            };
            let solver = EssSolver {
                target: cfg.ess_target,
                sigma_min: cfg.sigma_min,
                sigma_max,
                tolerance: ESS_SEARCH_TOL,
            };
            let (sigma, state) = solver.solve(&inputs, informed);
            // the committed scale bounds the next iteration's search
            sigma_max = sigma;
            fs::write(&sigma_file, sigma.to_string())?;
            info!(
                "iteration {}: sigma {:e}, normalized ESS {:.4}",
                k,
                sigma,
                state.final_ess()
            );

            // fit the resampling proposal on the final posterior and draw
            // the next ensemble
            let n_components = cfg.component_bound();
            let fit_rng = Isaac64Rng::seed_from_u64(cfg.seed.wrapping_add(2 * k as u64));
            let mut draw_rng =
                Isaac64Rng::seed_from_u64(cfg.seed.wrapping_add(2 * k as u64 + 1));
            let params = BayesMixtureParams::new_with_rng(n_components, fit_rng)
                .weight_concentration(
                    cfg.weight_concentration
                        .unwrap_or(1.0 / n_components as f64),
                )
                .covariance_type(cfg.covariance_type);
            let final_posterior = state.posterior.column(state.posterior.ncols() - 1).to_owned();
            let model = params.fit(&samples.view(), &final_posterior.view())?;
            let next_ensemble = model.sample(n_samples, &mut draw_rng)?;

            table::write_table(&table_next, &next_ensemble, &names)?;
            model.save(&self.gmm_path(k + 1))?;

            // persisted statistics, always in forward time order
            let (ips, covs, weights) = if reverse {
                (
                    reverse_columns(&state.ips),
                    reverse_columns(&state.covs),
                    reverse_columns(&state.posterior),
                )
            } else {
                (state.ips.clone(), state.covs.clone(), state.posterior.clone())
            };
            table::write_matrix(&cfg.work_dir.join("samples.txt"), &samples)?;
            table::write_matrix(&cfg.work_dir.join("ips.txt"), &ips.t().to_owned())?;
            table::write_matrix(&cfg.work_dir.join("weights.txt"), &weights)?;

            last = Some(CalibrationResult {
                ips,
                covs,
                sigma,
                ess: state.final_ess(),
            });
        }

        match last {
            Some(result) => Ok(RunOutcome::Completed(result)),
            // every iteration was already on disk; rebuild the result from
            // the persisted statistics without touching anything
            None => Ok(RunOutcome::Completed(self.reload_result()?)),
        }
    }

    fn prepare_observations(&self) -> Result<ObservationSet> {
        let cfg = &self.config;
        let exp_dir = cfg.work_dir.join("Exp");
        fs::create_dir_all(&exp_dir)?;
        let data_file = exp_dir.join("data.txt");
        if !data_file.exists() {
            table::write_row(&data_file, &Array1::from(cfg.flat_data()))?;
            info!("wrote reference data to {:?}", data_file);
        }
        ObservationSet::from_keyless_file(&data_file, &cfg.flat_weights())
    }

    fn table_path(&self, k: usize) -> PathBuf {
        self.config.work_dir.join(format!("smc_table{}.txt", k))
    }

    fn gmm_path(&self, k: usize) -> PathBuf {
        self.config.work_dir.join(format!("gmm{}.json", k))
    }

    fn reload_result(&self) -> Result<CalibrationResult> {
        let cfg = &self.config;
        let samples = table::read_matrix(&cfg.work_dir.join("samples.txt"))?;
        let ips = table::read_matrix(&cfg.work_dir.join("ips.txt"))?.t().to_owned();
        let weights = table::read_matrix(&cfg.work_dir.join("weights.txt"))?;
        let (n_samples, n_steps) = weights.dim();
        let last_sigma = read_sigma(
            &cfg.work_dir
                .join(format!("sigma{}.txt", cfg.n_iterations - 1)),
        )
        .ok_or_else(|| {
            CalibrationError::InvalidSpec(
                "run looks complete but its committed noise scales are missing".into(),
            )
        })?;

        let mut covs = Array2::zeros(ips.dim());
        for p in 0..ips.nrows() {
            for t in 0..n_steps {
                let mean = ips[[p, t]];
                let var: f64 = (0..n_samples)
                    .map(|i| weights[[i, t]] * (samples[[i, p]] - mean) * (samples[[i, p]] - mean))
                    .sum();
                covs[[p, t]] = var.sqrt() / mean;
            }
        }
        let last_weights = weights.column(n_steps - 1);
        let ess = 1.0 / (last_weights.mapv(|w| w * w).sum() * n_samples as f64);
        Ok(CalibrationResult {
            ips,
            covs,
            sigma: last_sigma,
            ess,
        })
    }
}

fn reverse_columns(m: &Array2<f64>) -> Array2<f64> {
    let mut m = m.clone();
    m.invert_axis(Axis(1));
    m
}

fn read_sigma(path: &Path) -> Option<f64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
