//! `calibra` calibrates the parameters of an external particle-dynamics
//! simulator against reference measurements with iterative sequential Monte
//! Carlo.
//!
//! Each iteration scores a parameter ensemble against the reference data
//! with a recursive Bayesian filter, tunes the observation-noise scale until
//! the posterior keeps a target effective sample size, fits a variational
//! Gaussian mixture on the weighted ensemble and draws the next generation
//! from it. The expensive simulations run out of process: the driver
//! exchanges parameter tables and output files with the solver through the
//! working directory and resumes from whatever is already on disk.
//!
//! | Module | Purpose |
//! | :--- | :--- |
//! | [`config`] | Parameter ranges, measurements and run options |
//! | [`sampling`] | Halton bootstrap of the initial ensemble |
//! | [`table`] | Parameter tables exchanged with the solver |
//! | [`observation`] | Reference data loading, control-channel handling |
//! | [`gateway`] | Reading per-sample solver output into the tensor |
//! | [`filter`] | Recursive Bayesian update and the noise-scale search |
//! | [`mixture`] | Weighted variational Bayesian Gaussian mixture |
//! | [`proposal`] | Proposal densities with Voronoi-volume weighting |
//! | [`driver`] | The resumable iteration loop |
//!
//! A minimal run over the standard file layout:
//!
//! ```no_run
//! use calibra::{CalibrationConfig, Calibrator, Measurement, ParameterSpec, RunOutcome};
//!
//! let config = CalibrationConfig::new(
//!     ParameterSpec::new().with("stiffness", 0.0, 1.0),
//!     vec![Measurement::scalar("contact_force", 1.0, 1.0)],
//!     "runs/contact",
//! )
//! .n_iterations(3)
//! .n_samples(30)
//! .ess_target(0.2);
//!
//! let calibrator = Calibrator::new(config)?;
//! match calibrator.run()? {
//!     RunOutcome::NeedsSimulations { table, sim_dir, .. } => {
//!         println!("run the solver over {:?} into {:?}", table, sim_dir);
//!     }
//!     RunOutcome::Completed(result) => {
//!         println!("identified {} +- {}", result.identified(0), result.variation(0));
//!     }
//! }
//! # Ok::<(), calibra::CalibrationError>(())
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod geometry;
pub mod mixture;
pub mod observation;
pub mod optimize;
pub mod proposal;
pub mod sampling;
pub mod table;

pub use config::{
    CalibrationConfig, CovariancePolicy, CovarianceType, Measurement, ParameterSpec,
};
pub use driver::{CalibrationResult, Calibrator, RunOutcome};
pub use error::{CalibrationError, Result};
pub use filter::{EssSolver, PosteriorState, UpdateInputs};
pub use gateway::{PostHocReader, SimulatorGateway};
pub use mixture::{BayesMixture, BayesMixtureParams};
pub use observation::ObservationSet;
