//! Proposal probabilities of an ensemble under the mixture that generated it.
//!
//! From the second iteration on, the ensemble is not uniform: it was drawn
//! from the previous iteration's mixture, and the posterior update must
//! divide that density back out. The raw mixture density is additionally
//! weighted by each sample's Voronoi cell volume, crediting samples that
//! stand in for a larger region of parameter space.

use log::warn;
use ndarray::{Array1, Array2, ArrayView2};

use crate::geometry::voronoi_volumes;
use crate::mixture::BayesMixture;

/// Normalized proposal probabilities for `samples` under `model`.
///
/// Open Voronoi cells carry a `-1` sentinel volume; when every weighted
/// entry is negative (a degenerate cloud) the proposal degrades to uniform,
/// otherwise negative entries are clamped to the smallest positive one.
///
/// `historical_normalization` reproduces a legacy pipeline whose proposals
/// were trained on per-column max-normalized samples; it is only consulted
/// when all component mean magnitudes are below one. While it is engaged the
/// whole evaluation, Voronoi volumes included, runs in the normalized
/// coordinates.
pub fn proposal_weights(
    model: &BayesMixture,
    samples: &ArrayView2<f64>,
    historical_normalization: bool,
) -> Array1<f64> {
    let n_samples = samples.nrows();
    let uniform = || Array1::from_elem(n_samples, 1.0 / n_samples as f64);

    let scored: Array2<f64>;
    let scored_view = if historical_normalization && model.max_mean_magnitude() < 1.0 {
        warn!("scoring per-column max-normalized samples under the historical proposal shim");
        scored = max_normalized(samples);
        scored.view()
    } else {
        samples.view()
    };

    let mut q = model.score_samples(&scored_view).mapv(f64::exp);
    q *= &voronoi_volumes(&scored_view);

    if q.iter().all(|&v| v < 0.0) {
        warn!("every Voronoi cell is open; falling back to a uniform proposal");
        return uniform();
    }
    let min_positive = q
        .iter()
        .copied()
        .filter(|&v| v > 0.0)
        .fold(f64::INFINITY, f64::min);
    if !min_positive.is_finite() {
        return uniform();
    }
    q.mapv_inplace(|v| if v < 0.0 { min_positive } else { v });
    let total = q.sum();
    if !(total > 0.0) || !total.is_finite() {
        return uniform();
    }
    q / total
}

/// Each column divided by its maximum.
fn max_normalized(samples: &ArrayView2<f64>) -> Array2<f64> {
    let mut normalized = samples.to_owned();
    for mut column in normalized.columns_mut() {
        let max = column.iter().fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        if max != 0.0 && max.is_finite() {
            column.mapv_inplace(|v| v / max);
        }
    }
    normalized
}
