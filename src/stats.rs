//! Small statistics helpers used by the robust-weighting and diagnostic
//! paths: moments, the Cauchy influence weight, ordinary least squares on
//! a line, and the Weibull distribution family.

/// Arithmetic mean; zero for an empty slice.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Unbiased sample variance; zero when fewer than two observations.
pub fn variance(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|&x| (x - m) * (x - m)).sum::<f64>() / (n - 1) as f64
}

/// Cauchy influence weight for a squared deviation `xsq` given a scale
/// `scale`. Equals one at the centre and decays towards zero in the
/// tails. A non-positive scale yields weight one (no discrimination
/// possible).
pub fn cauchy(xsq: f64, scale: f64) -> f64 {
    debug_assert!(xsq >= 0.0);
    if scale <= 0.0 || !scale.is_finite() {
        return 1.0;
    }
    1.0 / (1.0 + xsq / scale)
}

/// OLS fit of `y = intercept + slope * x`. Returns `(slope, intercept)`,
/// or `None` when the x values carry no spread or inputs are degenerate.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len();
    if n < 2 || y.len() != n {
        return None;
    }
    let mx = mean(x);
    let my = mean(y);
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        sxx += dx * dx;
        sxy += dx * (y[i] - my);
    }
    if sxx <= 0.0 || !sxx.is_finite() {
        return None;
    }
    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    if slope.is_finite() && intercept.is_finite() {
        Some((slope, intercept))
    } else {
        None
    }
}

/// Weibull cumulative density at `x >= 0` for strictly positive `shape`
/// and `scale`. `tail` requests the upper tail, `logp` the logarithm;
/// all four combinations are computed without catastrophic cancellation.
pub fn pweibull(x: f64, shape: f64, scale: f64, tail: bool, logp: bool) -> f64 {
    if !(x >= 0.0) || !(shape > 0.0) || !(scale > 0.0) {
        return f64::NAN;
    }
    let res = -(x / scale).powf(shape);
    match (tail, logp) {
        (true, true) => res,
        (false, false) => -res.exp_m1(),
        (true, false) => res.exp(),
        (false, true) => (-res.exp()).ln_1p(),
    }
}

/// Weibull quantile function, the inverse of [`pweibull`] under the same
/// `tail`/`logp` conventions.
pub fn qweibull(p: f64, shape: f64, scale: f64, tail: bool, logp: bool) -> f64 {
    if !(shape > 0.0) || !(scale > 0.0) {
        return f64::NAN;
    }
    if p.is_nan() {
        return f64::NAN;
    }
    if !logp {
        if !(0.0..=1.0).contains(&p) {
            return f64::NAN;
        }
        if p <= 0.0 {
            return if tail { f64::INFINITY } else { 0.0 };
        }
        if p >= 1.0 {
            return if tail { 0.0 } else { f64::INFINITY };
        }
    } else {
        if p > 0.0 {
            return f64::NAN;
        }
        if p == 0.0 {
            return if tail { 0.0 } else { f64::INFINITY };
        }
    }
    let res = if logp {
        if tail { -p } else { -(-p.exp_m1()).ln() }
    } else if tail {
        -p.ln()
    } else {
        -(-p).ln_1p()
    };
    scale * res.powf(1.0 / shape)
}

/// Weibull density at `x >= 0`; `logd` returns the log density.
pub fn dweibull(x: f64, shape: f64, scale: f64, logd: bool) -> f64 {
    if !(x >= 0.0) || !(shape > 0.0) || !(scale > 0.0) {
        return f64::NAN;
    }
    let scaled = x / scale;
    if logd {
        return (shape / scale).ln() + (shape - 1.0) * scaled.ln() - scaled.powf(shape);
    }
    let res = scaled.powf(shape - 1.0);
    (shape / scale) * res * (-res * scaled).exp()
}

/// Fit a Weibull distribution by median-rank regression.
///
/// The CDF linearises as `log(-log(1 - F)) = shape log x - shape log scale`,
/// so an OLS fit of the log empirical ranks against log-sorted data gives
/// both parameters. Returns `(shape, scale)`, or `None` when the data are
/// too few or contain non-positive values.
pub fn fit_weibull(xs: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len();
    if n < 3 || xs.iter().any(|&x| !(x > 0.0)) {
        return None;
    }
    let mut logx: Vec<f64> = xs.iter().map(|&x| x.ln()).collect();
    logx.sort_by(|a, b| a.partial_cmp(b).expect("log of positive data is finite"));
    let logr: Vec<f64> = (0..n)
        .map(|i| (-((n - i) as f64 / (n as f64 + 1.0)).ln()).ln())
        .collect();
    let (slope, intercept) = linear_regression(&logx, &logr)?;
    if !(slope > 0.0) {
        return None;
    }
    Some((slope, (-intercept / slope).exp()))
}
