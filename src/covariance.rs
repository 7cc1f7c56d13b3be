//! Per-cycle residual covariance of the processed intensities, and the
//! inverse covariance `Omega` the base caller scores against.

use crate::intensities::process_into;
use crate::matrix;
use crate::nuc::{NBASE, Nuc};
use crate::tile::Tile;
use ndarray::{Array1, Array2};

/// Result of the covariance sweep: one inverse covariance per cycle and
/// the per-cycle residual variance (the covariance trace).
#[derive(Debug)]
pub struct CycleCovariance {
    pub omega: Vec<Array2<f64>>,
    pub cycle_var: Array1<f64>,
}

/// Add one cluster's contribution to the per-cycle covariance sums.
///
/// Accumulates `we * R R^t` per cycle with `R = p - lambda e_b`, using
/// the expanded form so the rank-one updates touch only one row and
/// column. **Consumes** `processed`: on return it holds the residuals,
/// not the processed intensities. Ambiguous cycles contribute only the
/// `p p^t` term.
pub fn accumulate(
    we: f64,
    processed: &mut Array2<f64>,
    lambda: f64,
    bases: &[Nuc],
    v: &mut [Array2<f64>],
) {
    let ncycle = processed.ncols();
    debug_assert_eq!(processed.nrows(), NBASE);
    debug_assert_eq!(bases.len(), ncycle);
    debug_assert_eq!(v.len(), ncycle);
    debug_assert!(lambda >= 0.0);

    for cy in 0..ncycle {
        let vk = &mut v[cy];
        // p p^t
        for i in 0..NBASE {
            for j in 0..NBASE {
                vk[[i, j]] += we * processed[[i, cy]] * processed[[j, cy]];
            }
        }
        let Some(b) = bases[cy].index() else { continue };
        // - lambda (e_b p^t + p e_b^t)
        for i in 0..NBASE {
            let contrib = we * lambda * processed[[i, cy]];
            vk[[b, i]] -= contrib;
            vk[[i, b]] -= contrib;
        }
        // + lambda^2 e_b e_b^t
        vk[[b, b]] += we * lambda * lambda;
    }

    // Turn the processed intensities into residuals in place.
    for (cy, &base) in bases.iter().enumerate() {
        if let Some(b) = base.index() {
            processed[[b, cy]] -= lambda;
        }
    }
}

/// One forward sweep over the tile's clusters: per-cycle residual
/// covariance, its trace, and its inverse.
///
/// The caller supplies the transposed inverses of the current crosstalk
/// and phasing matrices, shared across clusters.
pub fn estimate(
    tile: &Tile,
    bases: &[Nuc],
    lambda: &Array1<f64>,
    we: &Array1<f64>,
    minv_t: &Array2<f64>,
    pinv_t: &Array2<f64>,
    noise: &Array2<f64>,
) -> CycleCovariance {
    let ncycle = pinv_t.nrows();
    let ncluster = tile.ncluster();
    debug_assert_eq!(bases.len(), ncluster * ncycle);

    let mut v: Vec<Array2<f64>> = (0..ncycle).map(|_| Array2::zeros((NBASE, NBASE))).collect();
    let mut processed = Array2::zeros((NBASE, ncycle));
    let mut wesum = 0.0;

    for (cl, cluster) in tile.clusters.iter().enumerate() {
        let cl_bases = &bases[cl * ncycle..(cl + 1) * ncycle];
        process_into(&cluster.signals, minv_t, pinv_t, noise, &mut processed);
        accumulate(we[cl], &mut processed, lambda[cl], cl_bases, &mut v);
        wesum += we[cl];
    }

    if wesum > 0.0 {
        for vk in &mut v {
            vk.mapv_inplace(|x| x / wesum);
        }
    }

    let cycle_var = Array1::from_iter(v.iter().map(|vk| vk.diag().sum()));
    let omega = v.iter().map(invert_covariance).collect();

    CycleCovariance { omega, cycle_var }
}

/// Invert a per-cycle covariance, falling back to an escalating
/// diagonal ridge when the accumulated matrix is rank deficient (a
/// handful of clusters, or residuals that vanish on noiseless data).
fn invert_covariance(v: &Array2<f64>) -> Array2<f64> {
    if let Ok(inv) = matrix::invert_spd(v) {
        return inv;
    }
    let scale = (v.diag().sum() / NBASE as f64).max(1.0);
    let mut ridge = 1e-6 * scale;
    for _ in 0..8 {
        let regularised = v + &(Array2::<f64>::eye(NBASE) * ridge);
        if let Ok(inv) = matrix::invert_spd(&regularised) {
            log::debug!("covariance inverted with ridge {ridge:e}");
            return inv;
        }
        ridge *= 10.0;
    }
    log::warn!("covariance irrecoverably degenerate, using scaled identity");
    Array2::eye(NBASE) / ridge
}
