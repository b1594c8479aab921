//! Quasi-random generation of the initial parameter ensemble.
//!
//! Iteration zero has no posterior to resample from, so the ensemble is laid
//! out by a Halton sequence: one prime base per parameter dimension, the
//! degenerate all-zero first point skipped, every column affinely mapped into
//! its declared interval. The construction is fully deterministic in the
//! ensemble size and dimension count.

use ndarray::Array2;

use crate::config::ParameterSpec;
use crate::error::Result;

/// Radical inverse of `index` in the given base, the Halton workhorse.
fn radical_inverse(mut index: usize, base: usize) -> f64 {
    let mut fraction = 1.0;
    let mut value = 0.0;
    while index > 0 {
        fraction /= base as f64;
        value += fraction * (index % base) as f64;
        index /= base;
    }
    value
}

fn first_primes(count: usize) -> Vec<usize> {
    let mut primes = Vec::with_capacity(count);
    let mut candidate = 2usize;
    while primes.len() < count {
        if primes.iter().all(|&p| candidate % p != 0) {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

/// `n` Halton points in the unit hypercube of dimension `dims`, starting at
/// sequence index one.
pub fn halton(n: usize, dims: usize) -> Array2<f64> {
    let bases = first_primes(dims);
    Array2::from_shape_fn((n, dims), |(i, j)| radical_inverse(i + 1, bases[j]))
}

/// The iteration-zero ensemble: Halton points mapped into the parameter
/// ranges, one row per sample in canonical column order.
pub fn halton_ensemble(spec: &ParameterSpec, n_samples: usize) -> Result<Array2<f64>> {
    spec.validate()?;
    let mut points = halton(n_samples, spec.len());
    for (j, range) in spec.ranges().iter().enumerate() {
        let width = range.hi - range.lo;
        points
            .column_mut(j)
            .mapv_inplace(|u| range.lo + width * u);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn radical_inverse_base_two() {
        assert_abs_diff_eq!(radical_inverse(1, 2), 0.5);
        assert_abs_diff_eq!(radical_inverse(2, 2), 0.25);
        assert_abs_diff_eq!(radical_inverse(3, 2), 0.75);
        assert_abs_diff_eq!(radical_inverse(4, 2), 0.125);
    }

    #[test]
    fn first_point_is_not_the_origin() {
        let points = halton(4, 2);
        assert_abs_diff_eq!(points[[0, 0]], 0.5);
        assert_abs_diff_eq!(points[[0, 1]], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(halton(64, 5), halton(64, 5));
    }

    #[test]
    fn prefix_property_holds() {
        // the first n points do not depend on how many are requested
        let short = halton(8, 3);
        let long = halton(32, 3);
        for i in 0..8 {
            for j in 0..3 {
                assert_abs_diff_eq!(short[[i, j]], long[[i, j]]);
            }
        }
    }

    #[test]
    fn ensemble_respects_ranges() {
        let spec = ParameterSpec::new()
            .with("a", -2.0, -1.0)
            .with("b", 10.0, 30.0);
        let ensemble = halton_ensemble(&spec, 50).unwrap();
        for row in ensemble.outer_iter() {
            assert!(row[0] >= -2.0 && row[0] <= -1.0);
            assert!(row[1] >= 10.0 && row[1] <= 30.0);
        }
    }

    #[test]
    fn invalid_range_is_rejected() {
        let spec = ParameterSpec::new().with("a", 1.0, 0.0);
        assert!(halton_ensemble(&spec, 10).is_err());
    }
}
