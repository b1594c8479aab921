//! Loading reference measurements into the dense observation layout.
//!
//! Two file shapes exist in the wild. A *keyless* file is a bare whitespace
//! matrix: a single scalar is one step of one channel, a flat list of values
//! is read as one channel over `T` steps. A *keyed* file carries a header of
//! channel names over equal-length columns; one named channel is the control
//! sequence (for instance the applied strain) and is split off rather than
//! scored.

use std::path::Path;

use ndarray::{Array1, Array2, Axis};

use crate::error::{CalibrationError, Result};
use crate::table;

/// Reference data, per-component weights and the optional control sequence.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    /// `T x M` reference values.
    pub data: Array2<f64>,
    /// `T x M` positive weights, same layout as `data`.
    pub weights: Array2<f64>,
    /// Control sequence of length `T`, keyed mode only.
    pub control: Option<Array1<f64>>,
    /// Channel names; synthesized as `y0..` in keyless mode.
    pub channels: Vec<String>,
}

impl ObservationSet {
    pub fn n_steps(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_channels(&self) -> usize {
        self.data.ncols()
    }

    /// Flip the time axis of data, weights and control.
    ///
    /// Used by the driver on alternating iterations; the update itself never
    /// reorders its inputs.
    pub fn reversed(&self) -> ObservationSet {
        ObservationSet {
            data: reverse_rows(&self.data),
            weights: reverse_rows(&self.weights),
            control: self.control.as_ref().map(|c| {
                let mut c = c.clone();
                c.invert_axis(Axis(0));
                c
            }),
            channels: self.channels.clone(),
        }
    }

    /// Keyless mode: parse the file as a numeric matrix.
    ///
    /// A scalar becomes `(1, 1)`; a flat list (one row or one column) becomes
    /// `(T, 1)`. `flat_weights` must hold one weight per matrix entry or a
    /// single weight to broadcast.
    pub fn from_keyless_file(path: &Path, flat_weights: &[f64]) -> Result<ObservationSet> {
        let rows = table::read_rows(path)?;
        let data = interpret_keyless(rows)
            .ok_or_else(|| CalibrationError::parse(path, "no numeric data"))?;
        let weights = broadcast_weights(flat_weights, data.dim()).ok_or_else(|| {
            CalibrationError::shape(
                "observation weights",
                format!("{} entries or 1", data.len()),
                format!("{}", flat_weights.len()),
            )
        })?;
        let channels = (0..data.ncols()).map(|j| format!("y{}", j)).collect();
        Ok(ObservationSet {
            data,
            weights,
            control: None,
            channels,
        })
    }

    /// Keyed mode: first line holds channel names, the rest equal-length
    /// columns. The `control` channel is removed from the matrix and returned
    /// separately; remaining columns keep file order.
    pub fn from_keyed_file(
        path: &Path,
        control: &str,
        channel_weights: &[f64],
    ) -> Result<ObservationSet> {
        let (names, columns) = read_keyed(path)?;
        let ctrl_idx = names.iter().position(|n| n == control).ok_or_else(|| {
            CalibrationError::parse(path, format!("control channel `{}` not found", control))
        })?;
        let n_steps = columns[0].len();
        let kept: Vec<usize> = (0..names.len()).filter(|&j| j != ctrl_idx).collect();
        if kept.is_empty() {
            return Err(CalibrationError::parse(
                path,
                "only the control channel is present",
            ));
        }
        let mut data = Array2::zeros((n_steps, kept.len()));
        for (col, &j) in kept.iter().enumerate() {
            for (t, &v) in columns[j].iter().enumerate() {
                data[[t, col]] = v;
            }
        }
        let weights = broadcast_weights(channel_weights, data.dim()).ok_or_else(|| {
            CalibrationError::shape(
                "observation weights",
                format!("{} channels, {} entries or 1", kept.len(), data.len()),
                format!("{}", channel_weights.len()),
            )
        })?;
        Ok(ObservationSet {
            data,
            weights,
            control: Some(Array1::from(columns[ctrl_idx].clone())),
            channels: kept.into_iter().map(|j| names[j].clone()).collect(),
        })
    }
}

pub(crate) fn reverse_rows(m: &Array2<f64>) -> Array2<f64> {
    let mut m = m.clone();
    m.invert_axis(Axis(0));
    m
}

/// Shape rules shared with simulation files: scalar -> (1,1), flat list ->
/// (T,1), anything else stays (T,M).
pub(crate) fn interpret_keyless(rows: Vec<Vec<f64>>) -> Option<Array2<f64>> {
    if rows.is_empty() || rows[0].is_empty() {
        return None;
    }
    let (r, c) = (rows.len(), rows[0].len());
    if r == 1 && c > 1 {
        // one long row of values: a single channel over c steps
        return Some(Array2::from_shape_vec((c, 1), rows.into_iter().next().unwrap()).ok()?);
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Some(Array2::from_shape_vec((r, c), flat).ok()?)
}

fn broadcast_weights(flat: &[f64], dim: (usize, usize)) -> Option<Array2<f64>> {
    let (t, m) = dim;
    match flat.len() {
        1 => Some(Array2::from_elem(dim, flat[0])),
        n if n == t * m => Array2::from_shape_vec(dim, flat.to_vec()).ok(),
        // one weight per channel, shared across steps
        n if n == m => {
            let mut w = Array2::zeros(dim);
            for j in 0..m {
                w.column_mut(j).fill(flat[j]);
            }
            Some(w)
        }
        _ => None,
    }
}

pub(crate) fn read_keyed(path: &Path) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines().filter(|l| {
        let l = l.trim();
        !l.is_empty() && !l.starts_with('!') && !l.starts_with('#')
    });
    let header = lines
        .next()
        .ok_or_else(|| CalibrationError::parse(path, "empty file"))?;
    let names: Vec<String> = header.split_whitespace().map(String::from).collect();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != names.len() {
            return Err(CalibrationError::parse(
                path,
                format!(
                    "row has {} fields but header names {} channels",
                    fields.len(),
                    names.len()
                ),
            ));
        }
        for (j, f) in fields.iter().enumerate() {
            columns[j].push(
                f.parse()
                    .map_err(|e: std::num::ParseFloatError| CalibrationError::parse(path, e.to_string()))?,
            );
        }
    }
    if columns[0].is_empty() {
        return Err(CalibrationError::parse(path, "no data rows"));
    }
    Ok((names, columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn scalar_file_becomes_one_by_one() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "1.0").unwrap();
        let obs = ObservationSet::from_keyless_file(&path, &[1.0]).unwrap();
        assert_eq!(obs.data, array![[1.0]]);
        assert_eq!(obs.n_steps(), 1);
        assert_eq!(obs.n_channels(), 1);
        assert!(obs.control.is_none());
    }

    #[test]
    fn flat_list_becomes_single_channel_series() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "1 2 3").unwrap();
        let obs = ObservationSet::from_keyless_file(&path, &[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(obs.data, array![[1.0], [2.0], [3.0]]);
        assert_eq!(obs.weights.dim(), (3, 1));
    }

    #[test]
    fn keyed_file_splits_control_channel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obs.txt");
        std::fs::write(&path, "strain stress e\n0.0 10 0.7\n0.1 20 0.6\n").unwrap();
        let obs = ObservationSet::from_keyed_file(&path, "strain", &[1.0, 0.5]).unwrap();
        assert_eq!(obs.channels, vec!["stress", "e"]);
        assert_eq!(obs.data, array![[10.0, 0.7], [20.0, 0.6]]);
        assert_eq!(obs.control.unwrap(), array![0.0, 0.1]);
        assert_eq!(obs.weights, array![[1.0, 0.5], [1.0, 0.5]]);
    }

    #[test]
    fn missing_control_channel_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obs.txt");
        std::fs::write(&path, "stress e\n10 0.7\n").unwrap();
        assert!(ObservationSet::from_keyed_file(&path, "strain", &[1.0]).is_err());
    }

    #[test]
    fn reversal_flips_all_sequences() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obs.txt");
        std::fs::write(&path, "strain stress\n0.0 10\n0.1 20\n0.2 30\n").unwrap();
        let obs = ObservationSet::from_keyed_file(&path, "strain", &[1.0]).unwrap();
        let rev = obs.reversed();
        assert_eq!(rev.data, array![[30.0], [20.0], [10.0]]);
        assert_eq!(rev.control.unwrap(), array![0.2, 0.1, 0.0]);
    }
}
