//! On-disk parameter tables and plain whitespace matrices.
//!
//! A parameter table is the contract between the calibrator and the external
//! solver: a comment header, then one line per sample holding the sample key
//! and the parameter values in canonical column order. Floats are written with
//! the shortest representation that round-trips exactly, so reading a table
//! and writing it back reproduces the file byte for byte.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2};

use crate::error::{CalibrationError, Result};

/// Write `samples` as a parameter table with keys `0..N` in row order.
pub fn write_table(path: &Path, samples: &Array2<f64>, names: &[&str]) -> Result<()> {
    let mut out = String::new();
    out.push_str("! key");
    for name in names {
        write!(out, " {}", name).expect("write to string");
    }
    out.push('\n');
    for (key, row) in samples.outer_iter().enumerate() {
        write!(out, "{}", key).expect("write to string");
        for v in row.iter() {
            write!(out, " {}", v).expect("write to string");
        }
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Read a parameter table back into an `N x P` matrix.
///
/// Lines starting with `!` are skipped. Rows are reordered by their key
/// column; keys must be exactly `0..N`.
pub fn read_table(path: &Path, n_params: usize) -> Result<Array2<f64>> {
    let content = fs::read_to_string(path)?;
    let mut rows: Vec<(usize, Vec<f64>)> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != n_params + 1 {
            return Err(CalibrationError::parse(
                path,
                format!(
                    "expected {} columns (key + {} parameters), got {}",
                    n_params + 1,
                    n_params,
                    fields.len()
                ),
            ));
        }
        let key: usize = fields[0]
            .parse()
            .map_err(|_| CalibrationError::parse(path, format!("bad sample key `{}`", fields[0])))?;
        let values = fields[1..]
            .iter()
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| CalibrationError::parse(path, e.to_string()))?;
        rows.push((key, values));
    }
    if rows.is_empty() {
        return Err(CalibrationError::parse(path, "no sample rows"));
    }
    rows.sort_by_key(|(key, _)| *key);
    for (i, (key, _)) in rows.iter().enumerate() {
        if *key != i {
            return Err(CalibrationError::parse(
                path,
                format!("sample keys are not contiguous: missing key {}", i),
            ));
        }
    }
    let n = rows.len();
    let mut samples = Array2::zeros((n, n_params));
    for (i, (_, values)) in rows.into_iter().enumerate() {
        for (j, v) in values.into_iter().enumerate() {
            samples[[i, j]] = v;
        }
    }
    Ok(samples)
}

/// Write a dense matrix as whitespace-separated rows.
pub fn write_matrix(path: &Path, matrix: &Array2<f64>) -> Result<()> {
    let mut out = String::new();
    for row in matrix.outer_iter() {
        let mut first = true;
        for v in row.iter() {
            if !first {
                out.push(' ');
            }
            write!(out, "{}", v).expect("write to string");
            first = false;
        }
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Write a vector as a single whitespace-separated line.
pub fn write_row(path: &Path, row: &Array1<f64>) -> Result<()> {
    let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
    fs::write(path, fields.join(" "))?;
    Ok(())
}

/// Read a whitespace-separated numeric file as a list of rows.
///
/// Shape interpretation is left to the caller; rows may be ragged only if the
/// caller tolerates it, so equal lengths are enforced here.
pub fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    let content = fs::read_to_string(path)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
            continue;
        }
        let values = line
            .split_whitespace()
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| CalibrationError::parse(path, e.to_string()))?;
        rows.push(values);
    }
    if let Some(width) = rows.first().map(|r| r.len()) {
        if rows.iter().any(|r| r.len() != width) {
            return Err(CalibrationError::parse(path, "rows have unequal lengths"));
        }
    }
    Ok(rows)
}

/// Read a whitespace matrix into an `R x C` array.
pub fn read_matrix(path: &Path) -> Result<Array2<f64>> {
    let rows = read_rows(path)?;
    let r = rows.len();
    let c = rows.first().map(|row| row.len()).unwrap_or(0);
    let mut matrix = Array2::zeros((r, c));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, v) in row.into_iter().enumerate() {
            matrix[[i, j]] = v;
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn table_round_trips_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("smc_table0.txt");
        let samples = array![[0.1, 2.0e-7], [0.30000000000000004, 4.5]];
        write_table(&path, &samples, &["young", "poisson"]).unwrap();

        let first = fs::read_to_string(&path).unwrap();
        let reread = read_table(&path, 2).unwrap();
        write_table(&path, &reread, &["young", "poisson"]).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(reread, samples);
    }

    #[test]
    fn rows_are_reordered_by_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.txt");
        fs::write(&path, "! key p\n1 20\n0 10\n").unwrap();
        let samples = read_table(&path, 1).unwrap();
        assert_eq!(samples, array![[10.0], [20.0]]);
    }

    #[test]
    fn gap_in_keys_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.txt");
        fs::write(&path, "! key p\n0 10\n2 20\n").unwrap();
        assert!(read_table(&path, 1).is_err());
    }

    #[test]
    fn comment_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.txt");
        fs::write(&path, "! key p\n! another note\n0 1.5\n").unwrap();
        let samples = read_table(&path, 1).unwrap();
        assert_eq!(samples, array![[1.5]]);
    }

    #[test]
    fn matrix_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ips.txt");
        let m = array![[1.0, 2.0], [3.0, 4.0]];
        write_matrix(&path, &m).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), m);
    }
}
