//! Per-cluster brightness estimation.
//!
//! The brightness `lambda` scales the ideal indicator signal; both
//! estimators regress the processed intensities at the called channels
//! against that indicator. Ambiguous cycles carry no information and
//! are excluded.

use crate::nuc::Nuc;
use ndarray::Array2;

/// Ordinary least-squares brightness from processed intensities and the
/// current calls. Returns zero when no cycle is usable or the estimate
/// is negative or non-finite.
pub fn estimate_ols(processed: &Array2<f64>, bases: &[Nuc]) -> f64 {
    debug_assert_eq!(processed.ncols(), bases.len());
    let mut num = 0.0;
    let mut den = 0.0;
    for (cy, &base) in bases.iter().enumerate() {
        let Some(b) = base.index() else { continue };
        num += processed[[b, cy]];
        den += 1.0;
    }
    if den <= 0.0 {
        return 0.0;
    }
    let lambda = num / den;
    if lambda.is_finite() && lambda > 0.0 { lambda } else { 0.0 }
}

/// Weighted least-squares brightness, each cycle weighted by the
/// reciprocal of its residual variance. Cycles with non-positive
/// variance are excluded; a non-finite outcome falls back to
/// `lambda_prev`, and the result is clamped at zero.
pub fn estimate_wls(
    processed: &Array2<f64>,
    bases: &[Nuc],
    lambda_prev: f64,
    cycle_var: &[f64],
) -> f64 {
    debug_assert_eq!(processed.ncols(), bases.len());
    debug_assert_eq!(cycle_var.len(), bases.len());
    let mut num = 0.0;
    let mut den = 0.0;
    for (cy, &base) in bases.iter().enumerate() {
        let Some(b) = base.index() else { continue };
        let var = cycle_var[cy];
        if !(var > 0.0) || !var.is_finite() {
            continue;
        }
        let w = 1.0 / var;
        num += w * processed[[b, cy]];
        den += w;
    }
    if den <= 0.0 {
        return if lambda_prev.is_finite() { lambda_prev.max(0.0) } else { 0.0 };
    }
    let lambda = num / den;
    if !lambda.is_finite() {
        return if lambda_prev.is_finite() { lambda_prev.max(0.0) } else { 0.0 };
    }
    lambda.max(0.0)
}
