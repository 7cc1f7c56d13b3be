//! Per-cycle base calling.
//!
//! The production caller picks the base minimising a quadratic
//! least-squares statistic under the per-cycle inverse covariance and
//! converts the posterior probability of that minimum into a Phred
//! score. A plain argmax caller seeds the very first pass, before any
//! model has been fitted.

use crate::matrix;
use crate::nuc::{MIN_QUALITY, NBASE, Nuc, quality_from_prob};
use ndarray::{Array2, ArrayView1};

/// A base call paired with its Phred quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseQual {
    pub base: Nuc,
    pub qual: u8,
}

/// Call used when the cluster carries no usable signal.
fn call_null() -> BaseQual {
    BaseQual {
        base: Nuc::A,
        qual: MIN_QUALITY,
    }
}

/// Initial caller: the brightest channel wins. Returns `Ambig` when the
/// intensities are flat or contain non-finite values.
pub fn call_base_simple(p: ArrayView1<f64>) -> Nuc {
    debug_assert_eq!(p.len(), NBASE);
    if p.iter().any(|v| !v.is_finite()) {
        return Nuc::Ambig;
    }
    let mut best = 0;
    let mut max = p[0];
    let mut flat = true;
    for i in 1..NBASE {
        if p[i] != max {
            flat = false;
        }
        if p[i] > max {
            max = p[i];
            best = i;
        }
    }
    if flat { Nuc::Ambig } else { Nuc::from_index(best) }
}

/// Minimum-least-squares base call with posterior quality.
///
/// * `p` — processed intensities for one cycle.
/// * `lambda` — cluster brightness; zero short-circuits to a null call.
/// * `penalty` — optional per-base additive penalty on the statistic.
/// * `omega` — per-cycle inverse residual covariance.
/// * `mu` — tolerance selecting the numerically stable posterior branch.
pub fn call_base(
    p: ArrayView1<f64>,
    lambda: f64,
    penalty: Option<&[f64; NBASE]>,
    omega: &Array2<f64>,
    mu: f64,
) -> BaseQual {
    debug_assert_eq!(p.len(), NBASE);
    debug_assert_eq!(omega.dim(), (NBASE, NBASE));
    debug_assert!(mu > 0.0);

    if lambda == 0.0 {
        return call_null();
    }
    let zero = [0.0; NBASE];
    let penalty = penalty.unwrap_or(&zero);

    let mut call = 0;
    let mut minstat = f64::INFINITY;
    let mut stat = [0.0; NBASE];
    for i in 0..NBASE {
        let mut s = lambda * omega[[i, i]];
        for j in 0..NBASE {
            s -= 2.0 * p[j] * omega[[i, j]];
        }
        s *= lambda;
        s += penalty[i];
        stat[i] = s;
        if s < minstat {
            minstat = s;
            call = i;
        }
    }

    // Normalisation sum with the common factor exp(-(K + minstat)/2)
    // removed.
    let tot: f64 = stat.iter().map(|&s| (-0.5 * (s - minstat)).exp()).sum();

    let k = matrix::x_m_y(p, omega, p);
    let maxprob = (-0.5 * (k + minstat)).exp();

    // maxprob can underflow to essentially zero; branch so neither form
    // divides by it when it is small.
    let exp_pen = (-0.5 * penalty[call]).exp();
    let post_prob = if maxprob < mu {
        (exp_pen * mu + maxprob) / (4.0 * mu + maxprob * tot)
    } else {
        (exp_pen * mu / maxprob + 1.0) / (4.0 * mu / maxprob + tot)
    };

    BaseQual {
        base: Nuc::from_index(call),
        qual: quality_from_prob(post_prob),
    }
}
