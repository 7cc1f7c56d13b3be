//! Joint estimation of the crosstalk, phasing and noise matrices.
//!
//! The model predicts cluster intensities as `lambda M S P + N`. With
//! the base calls `S` and brightnesses fixed, the weighted least-squares
//! problem in `(M, P, N)` is bilinear, so the solver alternates two
//! linear halves: `(P, N)` with `M` held, then `(M, N)` with `P` held.
//! Both halves share a set of Kronecker-structured sufficient statistics
//! accumulated in a single pass over the clusters, and each half is
//! followed by a unit-determinant renormalisation whose scale is pushed
//! into the statistics and the brightness vector so the predicted
//! intensities are unchanged.
//!
//! Index conventions for the two big statistics, with `B` channels and
//! `K` cycles:
//!
//! * `J` is `B^2 x K^2`: `J[(a,b), (k,l)] = sum_i w_i lambda_i^2
//!   S_i[a,k] S_i[b,l]`, row `a*B + b`, column `k*K + l`.
//! * `Kmat` is `B^2 x K^2`: `Kmat[(b,a), (c,k)] = sum_i w_i lambda_i
//!   I_i[b,c] S_i[a,k]`, row `b*B + a`, column `c*K + k`.

use crate::intensities::expected_into;
use crate::nuc::{NBASE, Nuc};
use crate::stats::{cauchy, mean, variance};
use crate::tile::Tile;
use ndarray::{Array1, Array2, s};

/// Inner alternating-solve steps per parameter-estimation call.
pub const MPN_INNER_ITER: usize = 20;

/// Determinant-scale floor below which a renormalisation is refused.
pub const DET_FLOOR: f64 = 3e-8;

/// Sufficient statistics for one parameter-estimation call.
pub struct SufficientStats {
    pub j: Array2<f64>,
    pub kmat: Array2<f64>,
    pub sbar: Array2<f64>,
    pub ibar: Array2<f64>,
    pub wbar: f64,
    pub ncycle: usize,
}

/// Recompute the robustness weights from the current model fit.
///
/// The per-cluster residual sum of squares is scored against its own
/// spread with a Cauchy influence weight, so gross outliers stop
/// steering the parameter estimates. Returns the unweighted total
/// residual sum.
pub fn update_weights(
    tile: &Tile,
    bases: &[Nuc],
    lambda: &Array1<f64>,
    m: &Array2<f64>,
    p: &Array2<f64>,
    noise: &Array2<f64>,
    we: &mut Array1<f64>,
) -> f64 {
    let ncycle = p.nrows();
    let ncluster = tile.ncluster();
    let mut expected = Array2::zeros((NBASE, ncycle));
    let mut lss = vec![0.0; ncluster];
    let mut sum_lss = 0.0;

    for (cl, cluster) in tile.clusters.iter().enumerate() {
        let cl_bases = &bases[cl * ncycle..(cl + 1) * ncycle];
        expected_into(lambda[cl], cl_bases, m, p, noise, &mut expected);
        let mut acc = 0.0;
        for (obs, pred) in cluster.signals.iter().zip(expected.iter()) {
            let d = obs - pred;
            acc += d * d;
        }
        lss[cl] = acc;
        sum_lss += acc;
    }

    let centre = mean(&lss);
    let spread = variance(&lss);
    for cl in 0..ncluster {
        let d = lss[cl] - centre;
        we[cl] = cauchy(d * d, spread);
    }
    sum_lss
}

/// Accumulate the sufficient statistics in one pass over the clusters.
/// Ambiguous calls contribute nothing to `J`, `Kmat` or `Sbar`.
pub fn accumulate_stats(
    tile: &Tile,
    bases: &[Nuc],
    lambda: &Array1<f64>,
    we: &Array1<f64>,
    ncycle: usize,
) -> SufficientStats {
    let mut j = Array2::zeros((NBASE * NBASE, ncycle * ncycle));
    let mut kmat = Array2::zeros((NBASE * NBASE, ncycle * ncycle));
    let mut sbar = Array2::zeros((NBASE, ncycle));
    let mut ibar = Array2::zeros((NBASE, ncycle));
    let mut wbar = 0.0;

    for (cl, cluster) in tile.clusters.iter().enumerate() {
        let w = we[cl];
        let lam = lambda[cl];
        let wl = w * lam;
        let wl2 = w * lam * lam;
        let cl_bases = &bases[cl * ncycle..(cl + 1) * ncycle];

        for (k, &bk) in cl_bases.iter().enumerate() {
            let Some(a) = bk.index() else { continue };
            sbar[[a, k]] += wl;
            for (l, &bl) in cl_bases.iter().enumerate() {
                if let Some(b) = bl.index() {
                    j[[a * NBASE + b, k * ncycle + l]] += wl2;
                }
            }
            for b in 0..NBASE {
                for c in 0..ncycle {
                    kmat[[b * NBASE + a, c * ncycle + k]] += wl * cluster.signals[[b, c]];
                }
            }
        }
        for b in 0..NBASE {
            for c in 0..ncycle {
                ibar[[b, c]] += w * cluster.signals[[b, c]];
            }
        }
        wbar += w;
    }

    SufficientStats {
        j,
        kmat,
        sbar,
        ibar,
        wbar,
        ncycle,
    }
}

impl SufficientStats {
    /// `K x K` contraction of `J` against a channel-space matrix:
    /// `out[k,l] = sum_{a,b} J[(a,b),(k,l)] q[a,b]` — the matrix
    /// `sum_i w_i lambda_i^2 S_i^t Q S_i` for `Q = q`.
    pub fn contract_channels(&self, q: &Array2<f64>) -> Array2<f64> {
        let k = self.ncycle;
        let mut out = Array2::zeros((k, k));
        for a in 0..NBASE {
            for b in 0..NBASE {
                let qab = q[[a, b]];
                if qab == 0.0 {
                    continue;
                }
                let row = self.j.slice(s![a * NBASE + b, ..]);
                for kk in 0..k {
                    for ll in 0..k {
                        out[[kk, ll]] += qab * row[kk * k + ll];
                    }
                }
            }
        }
        out
    }

    /// `B x B` contraction of `J` against a cycle-space matrix:
    /// `out[a,b] = sum_{k,l} J[(a,b),(k,l)] q[k,l]` — the matrix
    /// `sum_i w_i lambda_i^2 S_i Q S_i^t`.
    pub fn contract_cycles(&self, q: &Array2<f64>) -> Array2<f64> {
        let k = self.ncycle;
        let mut out = Array2::zeros((NBASE, NBASE));
        for a in 0..NBASE {
            for b in 0..NBASE {
                let row = self.j.slice(s![a * NBASE + b, ..]);
                let mut acc = 0.0;
                for kk in 0..k {
                    for ll in 0..k {
                        acc += row[kk * k + ll] * q[[kk, ll]];
                    }
                }
                out[[a, b]] = acc;
            }
        }
        out
    }

    /// Right-hand side for the phasing half:
    /// `out[k,c] = sum_i w_i lambda_i (S_i^t M^t I_i)[k,c]`.
    pub fn krhs_phasing(&self, m: &Array2<f64>) -> Array2<f64> {
        let k = self.ncycle;
        let mut out = Array2::zeros((k, k));
        for b in 0..NBASE {
            for a in 0..NBASE {
                let mba = m[[b, a]];
                if mba == 0.0 {
                    continue;
                }
                let row = self.kmat.slice(s![b * NBASE + a, ..]);
                for c in 0..k {
                    for kk in 0..k {
                        out[[kk, c]] += mba * row[c * k + kk];
                    }
                }
            }
        }
        out
    }

    /// Right-hand side for the crosstalk half:
    /// `out[a,r] = sum_i w_i lambda_i (S_i P I_i^t)[a,r]`.
    pub fn krhs_crosstalk(&self, p: &Array2<f64>) -> Array2<f64> {
        let k = self.ncycle;
        let mut out = Array2::zeros((NBASE, NBASE));
        for r in 0..NBASE {
            for a in 0..NBASE {
                let row = self.kmat.slice(s![r * NBASE + a, ..]);
                let mut acc = 0.0;
                for kk in 0..k {
                    for ll in 0..k {
                        // row index (c, k') = (kk, ll) pairs with P[l, c].
                        acc += row[kk * k + ll] * p[[ll, kk]];
                    }
                }
                out[[a, r]] = acc;
            }
        }
        out
    }

    /// Push a determinant-normalisation scale into the statistics so the
    /// predicted intensities are invariant under the coupled rescaling.
    pub fn rescale(&mut self, det: f64) {
        self.j.mapv_inplace(|v| v * det * det);
        self.kmat.mapv_inplace(|v| v * det);
        self.sbar.mapv_inplace(|v| v * det);
    }

    /// Closed-form weighted least-squares improvement of the current
    /// `(M, P, N)` over the zero model, from the statistics alone.
    pub fn delta_lse(&self, m: &Array2<f64>, p: &Array2<f64>, noise: &Array2<f64>) -> f64 {
        let k = self.ncycle;
        // 2 <Kmat, M (x) P>
        let mut cross = 0.0;
        for b in 0..NBASE {
            for a in 0..NBASE {
                let mba = m[[b, a]];
                if mba == 0.0 {
                    continue;
                }
                let row = self.kmat.slice(s![b * NBASE + a, ..]);
                for c in 0..k {
                    for kk in 0..k {
                        cross += mba * row[c * k + kk] * p[[kk, c]];
                    }
                }
            }
        }
        // <J, (M^t M) (x) (P P^t)>
        let mtm = m.t().dot(m);
        let ppt = p.dot(&p.t());
        let mut quad = 0.0;
        for a in 0..NBASE {
            for b in 0..NBASE {
                let row = self.j.slice(s![a * NBASE + b, ..]);
                for kk in 0..k {
                    for ll in 0..k {
                        quad += row[kk * k + ll] * mtm[[a, b]] * ppt[[kk, ll]];
                    }
                }
            }
        }
        let msp = m.dot(&self.sbar).dot(p);
        let noise_cross: f64 = msp.iter().zip(noise.iter()).map(|(a, b)| a * b).sum();
        let ibar_n: f64 = self.ibar.iter().zip(noise.iter()).map(|(a, b)| a * b).sum();
        let n_sq: f64 = noise.iter().map(|v| v * v).sum();

        2.0 * cross + 2.0 * ibar_n - quad - 2.0 * noise_cross - self.wbar * n_sq
    }
}
