//! Error types in calibra
//!

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CalibrationError>;

/// Everything that can go wrong during a calibration run.
///
/// Absent simulation data is *not* represented here: the driver reports it
/// through [`RunOutcome::NeedsSimulations`](crate::driver::RunOutcome) so the
/// caller can run the external solver and re-invoke.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Malformed configuration: bad parameter ranges, empty parameter or
    /// measurement lists, invalid tolerances.
    #[error("invalid calibration setup: {0}")]
    InvalidSpec(String),

    /// A simulation directory holds output for some samples but not for the
    /// named one.
    #[error("no simulation output for sample {key} in {dir:?}")]
    MissingSample { key: usize, dir: PathBuf },

    /// A simulation file name decodes to parameter values that do not match
    /// the sample table.
    #[error("file {file:?} encodes parameters that do not match sample {key}")]
    SampleMismatch { key: usize, file: PathBuf },

    /// A parsed matrix has a shape incompatible with the observation layout.
    #[error("{context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// The mixture fit exhausted its restart and iteration budget without
    /// converging.
    #[error("Gaussian mixture fit did not converge; adjust max_components or weight_concentration")]
    FitFailure,

    /// A table or data file could not be parsed.
    #[error("failed to parse {file:?}: {reason}")]
    Parse { file: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Linalg(#[from] linfa_linalg::LinalgError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl CalibrationError {
    pub(crate) fn parse(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CalibrationError::Parse {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        CalibrationError::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
