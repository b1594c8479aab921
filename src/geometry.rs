//! Voronoi cell volumes of a point cloud.
//!
//! The proposal reweighting needs, for every sample, the volume of its
//! Voronoi cell in parameter space, with open (unbounded) cells flagged by a
//! `-1` sentinel. In one dimension the cells are intervals and the volumes
//! are exact. In higher dimensions the volumes are estimated by a
//! deterministic quasi-Monte-Carlo sweep: Halton probe points are assigned to
//! their nearest site over a box inflated well beyond the cloud, a cell that
//! captures probes outside the core bounding box extends to the hull and is
//! open, and the remaining cells get the core-box volume apportioned by hit
//! count. A degenerate cloud (all sites collinear, or fewer sites than the
//! dimension needs) makes every cell open, which the caller turns into a
//! uniform proposal.

use ndarray::{Array1, ArrayView2};

use crate::sampling::halton;

/// Number of quasi-random probes per volume estimate.
const PROBES: usize = 1 << 14;

/// Per-site Voronoi cell volumes; open cells are `-1`.
pub fn voronoi_volumes(sites: &ArrayView2<f64>) -> Array1<f64> {
    let n = sites.nrows();
    let dims = sites.ncols();
    if dims == 1 {
        return line_volumes(sites);
    }
    if n < 2 {
        return Array1::from_elem(n, -1.0);
    }

    // core box hugging the cloud, margins inflating it by half the largest
    // extent per side so open cells have room to capture probes
    let mut lo = vec![f64::INFINITY; dims];
    let mut hi = vec![f64::NEG_INFINITY; dims];
    for row in sites.outer_iter() {
        for (j, &v) in row.iter().enumerate() {
            lo[j] = lo[j].min(v);
            hi[j] = hi[j].max(v);
        }
    }
    let largest = (0..dims).map(|j| hi[j] - lo[j]).fold(0.0f64, f64::max);
    let margin = if largest > 0.0 { 0.5 * largest } else { 1.0 };

    let probes = halton(PROBES, dims);
    let mut hits = vec![0usize; n];
    let mut open = vec![false; n];
    let mut core_probes = 0usize;
    for p in probes.outer_iter() {
        let mut point = vec![0.0; dims];
        let mut in_core = true;
        for j in 0..dims {
            let span = (hi[j] - lo[j]) + 2.0 * margin;
            point[j] = (lo[j] - margin) + span * p[j];
            if point[j] < lo[j] || point[j] > hi[j] {
                in_core = false;
            }
        }
        let nearest = nearest_site(sites, &point);
        if in_core {
            hits[nearest] += 1;
            core_probes += 1;
        } else {
            open[nearest] = true;
        }
    }

    let core_volume: f64 = (0..dims).map(|j| hi[j] - lo[j]).product();
    let mut volumes = Array1::zeros(n);
    for i in 0..n {
        volumes[i] = if open[i] || hits[i] == 0 || core_probes == 0 || core_volume == 0.0 {
            -1.0
        } else {
            core_volume * hits[i] as f64 / core_probes as f64
        };
    }
    volumes
}

fn nearest_site(sites: &ArrayView2<f64>, point: &[f64]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, row) in sites.outer_iter().enumerate() {
        let dist: f64 = row
            .iter()
            .zip(point)
            .map(|(&s, &p)| (s - p) * (s - p))
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best
}

/// Exact interval volumes in one dimension: half the gap to each neighbor,
/// the two extreme sites open.
fn line_volumes(sites: &ArrayView2<f64>) -> Array1<f64> {
    let n = sites.nrows();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        sites[[a, 0]]
            .partial_cmp(&sites[[b, 0]])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut volumes = Array1::from_elem(n, -1.0);
    for k in 1..n.saturating_sub(1) {
        let left = sites[[order[k - 1], 0]];
        let right = sites[[order[k + 1], 0]];
        volumes[order[k]] = 0.5 * (right - left);
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn line_cells_are_half_gaps() {
        let sites = array![[0.0], [1.0], [3.0], [10.0]];
        let vols = voronoi_volumes(&sites.view());
        assert_abs_diff_eq!(vols[1], 1.5);
        assert_abs_diff_eq!(vols[2], 4.5);
        assert_abs_diff_eq!(vols[0], -1.0);
        assert_abs_diff_eq!(vols[3], -1.0);
    }

    #[test]
    fn grid_interior_cell_volume_is_recovered() {
        // 3x3 unit grid: only the center cell is bounded, with volume 1
        let mut rows = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                rows.push([x as f64, y as f64]);
            }
        }
        let sites = ndarray::Array2::from_shape_vec(
            (9, 2),
            rows.into_iter().flatten().collect(),
        )
        .unwrap();
        let vols = voronoi_volumes(&sites.view());
        for (i, &v) in vols.iter().enumerate() {
            if i == 4 {
                assert_abs_diff_eq!(v, 1.0, epsilon = 0.1);
            } else {
                assert_abs_diff_eq!(v, -1.0);
            }
        }
    }

    #[test]
    fn collinear_cloud_has_only_open_cells() {
        let sites = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let vols = voronoi_volumes(&sites.view());
        assert!(vols.iter().all(|&v| v < 0.0));
    }

    #[test]
    fn single_site_is_open() {
        let sites = array![[1.0, 2.0]];
        let vols = voronoi_volumes(&sites.view());
        assert_eq!(vols.len(), 1);
        assert!(vols[0] < 0.0);
    }

    #[test]
    fn estimates_are_deterministic() {
        let sites = array![[0.0, 0.0], [1.0, 0.2], [0.4, 1.1], [2.0, 2.0], [1.2, 0.9]];
        let a = voronoi_volumes(&sites.view());
        let b = voronoi_volumes(&sites.view());
        assert_eq!(a, b);
    }
}
