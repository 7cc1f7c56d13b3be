//! Intensity-processing kernels.
//!
//! `process_into` maps raw channel intensities into base space,
//! `expected_into` predicts raw intensities from a call sequence. Both
//! write into a caller-owned buffer so the per-cluster loops reuse one
//! allocation.

use crate::nuc::{NBASE, Nuc};
use ndarray::Array2;

/// Compute `out = Minv (I - N) Pinv` for one cluster.
///
/// The caller supplies the *transposed inverses* `minv_t` and `pinv_t`,
/// computed once per tile and shared across clusters. Uses the identity
/// `vec(A B C) = (C^t (x) A) vec(B)`: for every input cycle the
/// crosstalk-corrected channel value is formed once and scattered across
/// the output cycles it influences.
pub fn process_into(
    intensities: &Array2<f64>,
    minv_t: &Array2<f64>,
    pinv_t: &Array2<f64>,
    noise: &Array2<f64>,
    out: &mut Array2<f64>,
) {
    let ncycle = pinv_t.nrows();
    assert_eq!(intensities.dim(), (NBASE, ncycle));
    assert_eq!(minv_t.dim(), (NBASE, NBASE));
    assert_eq!(pinv_t.dim(), (ncycle, ncycle));
    assert_eq!(noise.dim(), (NBASE, ncycle));
    assert_eq!(out.dim(), (NBASE, ncycle));

    out.fill(0.0);
    for icol in 0..ncycle {
        for base in 0..NBASE {
            let mut dp = 0.0;
            for chan in 0..NBASE {
                dp += minv_t[[chan, base]] * (intensities[[chan, icol]] - noise[[chan, icol]]);
            }
            for pcol in 0..ncycle {
                out[[base, pcol]] += pinv_t[[pcol, icol]] * dp;
            }
        }
    }
}

/// Compute the model prediction `out = lambda * M S P + N`, where `S` is
/// the indicator matrix of `bases`. Ambiguous calls contribute no signal.
pub fn expected_into(
    lambda: f64,
    bases: &[Nuc],
    m: &Array2<f64>,
    p: &Array2<f64>,
    noise: &Array2<f64>,
    out: &mut Array2<f64>,
) {
    let ncycle = p.nrows();
    assert_eq!(bases.len(), ncycle);
    assert_eq!(m.dim(), (NBASE, NBASE));
    assert_eq!(p.dim(), (ncycle, ncycle));
    assert_eq!(noise.dim(), (NBASE, ncycle));
    assert_eq!(out.dim(), (NBASE, ncycle));
    debug_assert!(lambda >= 0.0);

    out.fill(0.0);
    for cy_out in 0..ncycle {
        for (cy, &base) in bases.iter().enumerate() {
            let Some(b) = base.index() else { continue };
            let pw = p[[cy, cy_out]];
            for ch in 0..NBASE {
                out[[ch, cy_out]] += m[[ch, b]] * pw;
            }
        }
    }
    out.mapv_inplace(|v| v * lambda);
    *out += noise;
}
