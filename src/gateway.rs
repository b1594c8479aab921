//! Bridging the ensemble to the external solver.
//!
//! The calibrator never invokes the solver directly. It writes a parameter
//! table, and a [`SimulatorGateway`] turns the solver's per-sample output
//! into the `T x N x M` simulation tensor. The reference gateway is the
//! post-hoc reader: it scans the iteration's simulation directory for files
//! whose names encode the sample key and parameter values, which both pins
//! each file to its ensemble row and catches stale output from an earlier
//! table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::{Array3, ArrayView2};

use crate::error::{CalibrationError, Result};
use crate::observation::{self, ObservationSet};
use crate::table;

/// Maximum relative deviation between a file-name parameter and its table
/// value.
const NAME_MATCH_TOL: f64 = 1e-10;

/// Maps a parameter ensemble to the simulated observation tensor.
///
/// `Ok(None)` means the simulations have not been run yet, which is a normal
/// pause point rather than an error; every other failure is fatal for the
/// iteration.
pub trait SimulatorGateway {
    fn load(
        &self,
        samples: &ArrayView2<f64>,
        iteration: usize,
        work_dir: &Path,
        observations: &ObservationSet,
    ) -> Result<Option<Array3<f64>>>;
}

/// Reads simulation output produced out of process.
///
/// Files are named `<sim_name>_<key>_<p_1>_..._<p_P>.<extension>` inside
/// `work_dir/Sim<iteration>/`.
#[derive(Debug, Clone)]
pub struct PostHocReader {
    pub sim_name: String,
    pub extension: String,
}

impl PostHocReader {
    pub fn new(sim_name: impl Into<String>, extension: impl Into<String>) -> Self {
        PostHocReader {
            sim_name: sim_name.into(),
            extension: extension.into(),
        }
    }

    /// The simulation directory of one iteration.
    pub fn sim_dir(work_dir: &Path, iteration: usize) -> PathBuf {
        work_dir.join(format!("Sim{}", iteration))
    }

    /// File name for one sample row, shared with whatever writes the files.
    pub fn file_name(&self, key: usize, params: &[f64]) -> String {
        let mut name = format!("{}_{}", self.sim_name, key);
        for p in params {
            name.push('_');
            name.push_str(&p.to_string());
        }
        name.push('.');
        name.push_str(&self.extension);
        name
    }

    /// Decode `(key, parameters)` from a file name; `None` when the name
    /// does not follow the scheme.
    fn decode_name(&self, name: &str, n_params: usize) -> Option<(usize, Vec<f64>)> {
        let stem = name.strip_suffix(&format!(".{}", self.extension))?;
        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() < n_params + 2 {
            return None;
        }
        let params = fields[fields.len() - n_params..]
            .iter()
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .ok()?;
        let key = fields[fields.len() - n_params - 1].parse::<usize>().ok()?;
        Some((key, params))
    }

    fn scan(&self, dir: &Path, n_params: usize) -> Result<HashMap<usize, (PathBuf, Vec<f64>)>> {
        let mut found = HashMap::new();
        if !dir.is_dir() {
            return Ok(found);
        }
        let prefix = format!("{}_", self.sim_name);
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Some((key, params)) = self.decode_name(name, n_params) {
                if found.insert(key, (path.clone(), params)).is_some() {
                    return Err(CalibrationError::parse(
                        path,
                        format!("more than one output file for sample {}", key),
                    ));
                }
            }
        }
        Ok(found)
    }

    /// Parse one merged output file into a `T x M` matrix, matching keyed
    /// channels by name and broadcasting a single-channel file over all
    /// channels.
    fn parse_file(
        &self,
        path: &Path,
        observations: &ObservationSet,
    ) -> Result<ndarray::Array2<f64>> {
        let n_steps = observations.n_steps();
        let n_channels = observations.n_channels();
        let matrix = if observations.control.is_some() {
            let (names, columns) = observation::read_keyed(path)?;
            let mut matrix = ndarray::Array2::zeros((columns[0].len(), n_channels));
            for (j, channel) in observations.channels.iter().enumerate() {
                let col = names.iter().position(|n| n == channel).ok_or_else(|| {
                    CalibrationError::parse(path, format!("channel `{}` missing", channel))
                })?;
                for (t, &v) in columns[col].iter().enumerate() {
                    matrix[[t, j]] = v;
                }
            }
            matrix
        } else {
            let parsed = observation::interpret_keyless(table::read_rows(path)?)
                .ok_or_else(|| CalibrationError::parse(path, "no numeric data"))?;
            if parsed.ncols() == 1 && n_channels > 1 {
                let mut matrix = ndarray::Array2::zeros((parsed.nrows(), n_channels));
                for j in 0..n_channels {
                    matrix.column_mut(j).assign(&parsed.column(0));
                }
                matrix
            } else {
                parsed
            }
        };
        if matrix.dim() != (n_steps, n_channels) {
            return Err(CalibrationError::shape(
                format!("simulation file {:?}", path),
                format!("{} x {}", n_steps, n_channels),
                format!("{} x {}", matrix.nrows(), matrix.ncols()),
            ));
        }
        Ok(matrix)
    }
}

fn params_match(encoded: &[f64], expected: ndarray::ArrayView1<f64>) -> bool {
    encoded.iter().zip(expected.iter()).all(|(&enc, &exp)| {
        if exp == 0.0 {
            enc == 0.0
        } else {
            ((enc - exp) / exp).abs() < NAME_MATCH_TOL
        }
    })
}

impl SimulatorGateway for PostHocReader {
    fn load(
        &self,
        samples: &ArrayView2<f64>,
        iteration: usize,
        work_dir: &Path,
        observations: &ObservationSet,
    ) -> Result<Option<Array3<f64>>> {
        let n_samples = samples.nrows();
        let n_params = samples.ncols();
        let dir = Self::sim_dir(work_dir, iteration);
        let found = self.scan(&dir, n_params)?;
        if found.is_empty() {
            return Ok(None);
        }
        info!("found {} simulation files in {:?}", found.len(), dir);

        let mut tensor = Array3::zeros((
            observations.n_steps(),
            n_samples,
            observations.n_channels(),
        ));
        for key in 0..n_samples {
            let (path, encoded) = found.get(&key).ok_or_else(|| {
                CalibrationError::MissingSample {
                    key,
                    dir: dir.clone(),
                }
            })?;
            if !params_match(encoded, samples.row(key)) {
                return Err(CalibrationError::SampleMismatch {
                    key,
                    file: path.clone(),
                });
            }
            let matrix = self.parse_file(path, observations)?;
            for t in 0..matrix.nrows() {
                for j in 0..matrix.ncols() {
                    tensor[[t, key, j]] = matrix[[t, j]];
                }
            }
        }
        Ok(Some(tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};
    use tempfile::TempDir;

    fn keyless_observations(n_steps: usize) -> ObservationSet {
        ObservationSet {
            data: Array2::from_elem((n_steps, 1), 1.0),
            weights: Array2::from_elem((n_steps, 1), 1.0),
            control: None,
            channels: vec!["y0".into()],
        }
    }

    fn write_sim_files(
        dir: &Path,
        reader: &PostHocReader,
        samples: &Array2<f64>,
        rows_for: impl Fn(usize) -> String,
    ) {
        std::fs::create_dir_all(dir).unwrap();
        for (key, row) in samples.outer_iter().enumerate() {
            let name = reader.file_name(key, row.as_slice().unwrap());
            std::fs::write(dir.join(name), rows_for(key)).unwrap();
        }
    }

    #[test]
    fn absent_directory_is_a_pause_not_an_error() {
        let workspace = TempDir::new().unwrap();
        let reader = PostHocReader::new("data", "txt");
        let samples = array![[0.5], [1.5]];
        let tensor = reader
            .load(&samples.view(), 0, workspace.path(), &keyless_observations(1))
            .unwrap();
        assert!(tensor.is_none());
    }

    #[test]
    fn reads_matching_files_into_the_tensor() {
        let workspace = TempDir::new().unwrap();
        let reader = PostHocReader::new("data", "txt");
        let samples = array![[0.5], [1.5]];
        let dir = PostHocReader::sim_dir(workspace.path(), 0);
        write_sim_files(&dir, &reader, &samples, |key| {
            format!("{} {}", samples[[key, 0]], samples[[key, 0]])
        });

        let tensor = reader
            .load(&samples.view(), 0, workspace.path(), &keyless_observations(2))
            .unwrap()
            .unwrap();
        assert_eq!(tensor.dim(), (2, 2, 1));
        assert_eq!(tensor[[0, 0, 0]], 0.5);
        assert_eq!(tensor[[1, 1, 0]], 1.5);
    }

    #[test]
    fn partial_output_names_the_missing_sample() {
        let workspace = TempDir::new().unwrap();
        let reader = PostHocReader::new("data", "txt");
        let samples = array![[0.5], [1.5]];
        let dir = PostHocReader::sim_dir(workspace.path(), 0);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(reader.file_name(0, &[0.5])), "0.5").unwrap();

        let err = reader
            .load(&samples.view(), 0, workspace.path(), &keyless_observations(1))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::MissingSample { key: 1, .. }));
    }

    #[test]
    fn corrupted_name_is_a_sample_mismatch() {
        let workspace = TempDir::new().unwrap();
        let reader = PostHocReader::new("data", "txt");
        let samples = array![[0.5], [1.5]];
        let dir = PostHocReader::sim_dir(workspace.path(), 0);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(reader.file_name(0, &[0.5])), "0.5").unwrap();
        // one percent off the table value
        std::fs::write(dir.join(reader.file_name(1, &[1.515])), "1.5").unwrap();

        let err = reader
            .load(&samples.view(), 0, workspace.path(), &keyless_observations(1))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::SampleMismatch { key: 1, .. }));
    }

    #[test]
    fn wrong_step_count_is_a_shape_mismatch() {
        let workspace = TempDir::new().unwrap();
        let reader = PostHocReader::new("data", "txt");
        let samples = array![[0.5]];
        let dir = PostHocReader::sim_dir(workspace.path(), 0);
        write_sim_files(&dir, &reader, &samples, |_| "0.5 0.5 0.5".into());

        let err = reader
            .load(&samples.view(), 0, workspace.path(), &keyless_observations(2))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::ShapeMismatch { .. }));
    }

    #[test]
    fn keyed_files_match_channels_by_name() {
        let workspace = TempDir::new().unwrap();
        let reader = PostHocReader::new("sim", "txt");
        let samples = array![[2.0]];
        let dir = PostHocReader::sim_dir(workspace.path(), 1);
        std::fs::create_dir_all(&dir).unwrap();
        // channel order in the file differs from the observation order
        std::fs::write(
            dir.join(reader.file_name(0, &[2.0])),
            "e stress strain\n0.9 5.0 0.0\n0.8 6.0 0.1\n",
        )
        .unwrap();

        let observations = ObservationSet {
            data: array![[5.0, 0.9], [6.0, 0.8]],
            weights: Array2::from_elem((2, 2), 1.0),
            control: Some(Array1::from(vec![0.0, 0.1])),
            channels: vec!["stress".into(), "e".into()],
        };
        let tensor = reader
            .load(&samples.view(), 1, workspace.path(), &observations)
            .unwrap()
            .unwrap();
        assert_eq!(tensor.dim(), (2, 1, 2));
        assert_eq!(tensor[[0, 0, 0]], 5.0);
        assert_eq!(tensor[[0, 0, 1]], 0.9);
        assert_eq!(tensor[[1, 0, 0]], 6.0);
    }

    #[test]
    fn file_names_round_trip_through_the_decoder() {
        let reader = PostHocReader::new("data", "txt");
        let name = reader.file_name(7, &[0.30000000000000004, 2e-7]);
        let (key, params) = reader.decode_name(&name, 2).unwrap();
        assert_eq!(key, 7);
        assert_eq!(params, vec![0.30000000000000004, 2e-7]);
    }
}
