//! The per-sub-tile model state and the driver that runs base calling
//! to completion over every data block of a tile.

use crate::blockspec::total_cycles;
use crate::calling::{call_base, call_base_simple};
use crate::config::AybConfig;
use crate::covariance;
use crate::intensities::process_into;
use crate::lambda::{estimate_ols, estimate_wls};
use crate::linalg;
use crate::matrix;
use crate::mpn::{self, DET_FLOOR, MPN_INNER_ITER};
use crate::nuc::{MIN_QUALITY, NBASE, Nuc};
use crate::stats;
use crate::tile::{Tile, TileError};
use ndarray::{Array1, Array2, s};
use thiserror::Error;

/// Built-in crosstalk prior: fixed values of approximately the right
/// shape for the standard two-laser, four-filter channel layout. Used
/// whenever no external crosstalk matrix is supplied.
#[rustfmt::skip]
const INITIAL_CROSSTALK: [f64; NBASE * NBASE] = [
    2.011_430_0, 0.691_931_9, 0.273_554_5, 0.289_645_9,
    1.721_784_1, 1.802_241_3, 0.225_280_2, 0.241_371_6,
    0.064_365_76, 0.064_365_76, 1.399_955_31, 0.112_640_08,
    0.112_640_1, 0.080_457_2, 0.997_669_3, 1.319_498_1,
];

/// The built-in crosstalk prior as a matrix.
pub fn crosstalk_prior() -> Array2<f64> {
    Array2::from_shape_vec((NBASE, NBASE), INITIAL_CROSSTALK.to_vec())
        .expect("prior layout is 4x4")
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("parameter estimation failed to converge for this data block")]
    EstimateNonConvergent,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("input tile has {found} cycles but the block specification needs {required}")]
    InsufficientCycles { required: usize, found: usize },
    #[error(
        "seed {name} matrix is {found_rows}x{found_cols}, expected {expected_rows}x{expected_cols}"
    )]
    SeedDimMismatch {
        name: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },
    #[error(transparent)]
    Tile(#[from] TileError),
}

/// Finished calls for one data block, with the fitted model matrices.
#[derive(Debug)]
pub struct BlockFit {
    pub block: usize,
    pub ncluster: usize,
    pub ncycle: usize,
    pub bases: Vec<Nuc>,
    pub quals: Vec<u8>,
    pub crosstalk: Array2<f64>,
    pub phasing: Array2<f64>,
    pub noise: Array2<f64>,
}

/// Model state for one sub-tile: the instrument matrices, per-cluster
/// brightness and weight, per-cycle residual variance, and the current
/// calls.
pub struct Ayb {
    ncluster: usize,
    ncycle: usize,
    tile: Tile,
    m: Array2<f64>,
    p: Array2<f64>,
    n: Array2<f64>,
    lambda: Array1<f64>,
    we: Array1<f64>,
    cycle_var: Array1<f64>,
    bases: Vec<Nuc>,
    quals: Vec<u8>,
}

impl Ayb {
    /// Allocate and initialise the model for one sub-tile: seed the
    /// instrument matrices, process every cluster once, make the first
    /// (argmax) calls and the first brightness estimates.
    pub fn new(tile: Tile, config: &AybConfig) -> Result<Self, ModelError> {
        let ncluster = tile.ncluster();
        let ncycle = tile.ncycle();

        let m = match &config.crosstalk {
            Some(seed) => seed.clone(),
            None => crosstalk_prior(),
        };
        let p = match &config.phasing {
            Some(seed) => seed.clone(),
            None => Array2::eye(ncycle),
        };
        let n = match &config.noise {
            Some(seed) => seed.clone(),
            None => Array2::zeros((NBASE, ncycle)),
        };

        let mut ayb = Ayb {
            ncluster,
            ncycle,
            tile,
            m,
            p,
            n,
            lambda: Array1::zeros(ncluster),
            we: Array1::ones(ncluster),
            cycle_var: Array1::ones(ncycle),
            bases: vec![Nuc::Ambig; ncluster * ncycle],
            quals: vec![MIN_QUALITY; ncluster * ncycle],
        };
        ayb.initial_calls()?;
        Ok(ayb)
    }

    pub fn ncluster(&self) -> usize {
        self.ncluster
    }

    pub fn ncycle(&self) -> usize {
        self.ncycle
    }

    /// Transposed inverses of the current crosstalk and phasing
    /// matrices; a singular matrix means the model cannot continue.
    fn inverses(&self) -> Result<(Array2<f64>, Array2<f64>), ModelError> {
        let minv_t = matrix::invert(&self.m)
            .map_err(|_| ModelError::EstimateNonConvergent)?
            .t()
            .to_owned();
        let pinv_t = matrix::invert(&self.p)
            .map_err(|_| ModelError::EstimateNonConvergent)?
            .t()
            .to_owned();
        Ok((minv_t, pinv_t))
    }

    fn initial_calls(&mut self) -> Result<(), ModelError> {
        let (minv_t, pinv_t) = self.inverses()?;
        let mut processed = Array2::zeros((NBASE, self.ncycle));
        for (cl, cluster) in self.tile.clusters.iter().enumerate() {
            process_into(&cluster.signals, &minv_t, &pinv_t, &self.n, &mut processed);
            let offset = cl * self.ncycle;
            for cy in 0..self.ncycle {
                self.bases[offset + cy] = call_base_simple(processed.column(cy));
                self.quals[offset + cy] = MIN_QUALITY;
            }
            self.lambda[cl] =
                estimate_ols(&processed, &self.bases[offset..offset + self.ncycle]);
        }
        Ok(())
    }

    /// One parameter-estimation pass: refresh the robustness weights,
    /// accumulate the sufficient statistics and run the alternating
    /// `(P, N)` / `(M, N)` least-squares updates with unit-determinant
    /// renormalisation. Returns the monitored residual value, NaN when
    /// both halves of an inner pass fail.
    fn estimate_parameters(&mut self) -> f64 {
        let k = self.ncycle;
        let sum_lss = mpn::update_weights(
            &self.tile,
            &self.bases,
            &self.lambda,
            &self.m,
            &self.p,
            &self.n,
            &mut self.we,
        );
        let mut stats =
            mpn::accumulate_stats(&self.tile, &self.bases, &self.lambda, &self.we, k);
        let mut lambda_factor = 1.0;

        for pass in 0..MPN_INNER_ITER {
            // Phasing and noise with the crosstalk held fixed.
            let p_ok = self.update_phasing(&mut stats, &mut lambda_factor);
            // Crosstalk and noise with the phasing held fixed.
            let m_ok = self.update_crosstalk(&mut stats, &mut lambda_factor);
            if !p_ok && !m_ok {
                log::debug!("both half-updates failed in pass {pass}");
                return f64::NAN;
            }
        }

        self.lambda.mapv_inplace(|v| v * lambda_factor);
        let delta = stats.delta_lse(&self.m, &self.p, &self.n);
        sum_lss - delta
    }

    /// Solve the `(P, N)` block system. Commits the new matrices only
    /// when both the solve and the determinant normalisation succeed.
    fn update_phasing(&mut self, stats: &mut mpn::SufficientStats, lambda_factor: &mut f64) -> bool {
        let k = self.ncycle;
        let b = NBASE;
        let mtm = self.m.t().dot(&self.m);
        let msbar = self.m.dot(&stats.sbar);

        let mut lhs = Array2::zeros((k + b, k + b));
        lhs.slice_mut(s![..k, ..k])
            .assign(&stats.contract_channels(&mtm));
        lhs.slice_mut(s![..k, k..]).assign(&msbar.t());
        lhs.slice_mut(s![k.., ..k]).assign(&msbar);
        for i in 0..b {
            lhs[[k + i, k + i]] = stats.wbar;
        }
        let mut rhs = Array2::zeros((k + b, k));
        rhs.slice_mut(s![..k, ..]).assign(&stats.krhs_phasing(&self.m));
        rhs.slice_mut(s![k.., ..]).assign(&stats.ibar);

        let solution = match linalg::least_squares_solve(&lhs, &rhs) {
            Ok(x) => x,
            Err(e) => {
                log::debug!("phasing half-update solve failed: {e}");
                return false;
            }
        };
        let mut p_new = solution.slice(s![..k, ..]).to_owned();
        match matrix::normalise_to_unit_det(&mut p_new, DET_FLOOR) {
            Ok(det) => {
                self.p = p_new;
                self.n.assign(&solution.slice(s![k.., ..]));
                stats.rescale(det);
                *lambda_factor *= det;
                true
            }
            Err(e) => {
                log::debug!("phasing normalisation failed: {e}");
                false
            }
        }
    }

    /// Solve the `(M, N)` block system, the symmetric mirror of the
    /// phasing half: the solution columns carry rows of `M` and `N`.
    fn update_crosstalk(
        &mut self,
        stats: &mut mpn::SufficientStats,
        lambda_factor: &mut f64,
    ) -> bool {
        let k = self.ncycle;
        let b = NBASE;
        let ppt = self.p.dot(&self.p.t());
        let sbar_p = stats.sbar.dot(&self.p);

        let mut lhs = Array2::zeros((b + k, b + k));
        lhs.slice_mut(s![..b, ..b])
            .assign(&stats.contract_cycles(&ppt));
        lhs.slice_mut(s![..b, b..]).assign(&sbar_p);
        lhs.slice_mut(s![b.., ..b]).assign(&sbar_p.t());
        for i in 0..k {
            lhs[[b + i, b + i]] = stats.wbar;
        }
        let mut rhs = Array2::zeros((b + k, b));
        rhs.slice_mut(s![..b, ..])
            .assign(&stats.krhs_crosstalk(&self.p));
        rhs.slice_mut(s![b.., ..]).assign(&stats.ibar.t());

        let solution = match linalg::least_squares_solve(&lhs, &rhs) {
            Ok(x) => x,
            Err(e) => {
                log::debug!("crosstalk half-update solve failed: {e}");
                return false;
            }
        };
        let mut m_new = solution.slice(s![..b, ..]).t().to_owned();
        match matrix::normalise_to_unit_det(&mut m_new, DET_FLOOR) {
            Ok(det) => {
                self.m = m_new;
                self.n.assign(&solution.slice(s![b.., ..]).t());
                stats.rescale(det);
                *lambda_factor *= det;
                true
            }
            Err(e) => {
                log::debug!("crosstalk normalisation failed: {e}");
                false
            }
        }
    }

    /// Re-call every base: per-cycle covariance and `Omega`, brightness
    /// by weighted least squares, the minimum-LS call, and a final
    /// brightness pass against the new calls.
    fn estimate_bases(&mut self, mu: f64) -> Result<(), ModelError> {
        let (minv_t, pinv_t) = self.inverses()?;
        let cov = covariance::estimate(
            &self.tile,
            &self.bases,
            &self.lambda,
            &self.we,
            &minv_t,
            &pinv_t,
            &self.n,
        );
        self.cycle_var = cov.cycle_var;
        let cycle_var = self
            .cycle_var
            .as_slice()
            .expect("cycle_var is freshly allocated and contiguous");

        let mut processed = Array2::zeros((NBASE, self.ncycle));
        for (cl, cluster) in self.tile.clusters.iter().enumerate() {
            process_into(&cluster.signals, &minv_t, &pinv_t, &self.n, &mut processed);
            let offset = cl * self.ncycle;

            self.lambda[cl] = estimate_wls(
                &processed,
                &self.bases[offset..offset + self.ncycle],
                self.lambda[cl],
                cycle_var,
            );
            for cy in 0..self.ncycle {
                let bq = call_base(
                    processed.column(cy),
                    self.lambda[cl],
                    None,
                    &cov.omega[cy],
                    mu,
                );
                self.bases[offset + cy] = bq.base;
                self.quals[offset + cy] = bq.qual;
            }
            self.lambda[cl] = estimate_wls(
                &processed,
                &self.bases[offset..offset + self.ncycle],
                self.lambda[cl],
                cycle_var,
            );
        }
        Ok(())
    }

    /// Run the base-calling loop to completion.
    pub fn run(&mut self, config: &AybConfig) -> Result<(), ModelError> {
        for iteration in 0..config.n_iter {
            let lse = self.estimate_parameters();
            if !lse.is_finite() {
                return Err(ModelError::EstimateNonConvergent);
            }
            self.estimate_bases(config.mu)?;
            log::info!(
                "iteration {}/{}: residual {lse:.6e}",
                iteration + 1,
                config.n_iter
            );
        }

        if let Some(lambdas) = self.lambda.as_slice() {
            if let Some((shape, scale)) = stats::fit_weibull(lambdas) {
                log::debug!(
                    "brightness distribution: weibull shape {shape:.3} scale {scale:.3} median {:.3}",
                    stats::qweibull(0.5, shape, scale, false, false)
                );
            }
        }
        Ok(())
    }

    /// Surrender the finished calls and fitted matrices.
    pub fn into_fit(self, block: usize) -> BlockFit {
        BlockFit {
            block,
            ncluster: self.ncluster,
            ncycle: self.ncycle,
            bases: self.bases,
            quals: self.quals,
            crosstalk: self.m,
            phasing: self.p,
            noise: self.n,
        }
    }
}

fn check_seed_dims(
    name: &'static str,
    seed: Option<&Array2<f64>>,
    expected: (usize, usize),
) -> Result<(), DriverError> {
    if let Some(seed) = seed {
        if seed.dim() != expected {
            return Err(DriverError::SeedDimMismatch {
                name,
                expected_rows: expected.0,
                expected_cols: expected.1,
                found_rows: seed.nrows(),
                found_cols: seed.ncols(),
            });
        }
    }
    Ok(())
}

/// Analyse a whole tile: split it into data blocks and run the model on
/// each block independently. A block that fails to converge is reported
/// in its slot without disturbing the others; conditions that invalidate
/// the whole run (too few cycles, seed matrices of the wrong shape)
/// fail the outer result before any block is attempted.
pub fn process_tile(
    tile: &Tile,
    config: &AybConfig,
) -> Result<Vec<Result<BlockFit, ModelError>>, DriverError> {
    let required = total_cycles(&config.blocks) as usize;
    if tile.ncycle() < required {
        return Err(DriverError::InsufficientCycles {
            required,
            found: tile.ncycle(),
        });
    }

    let subtiles = tile.split_blocks(&config.blocks)?;

    check_seed_dims("crosstalk", config.crosstalk.as_ref(), (NBASE, NBASE))?;
    for sub in &subtiles {
        let k = sub.ncycle();
        check_seed_dims("phasing", config.phasing.as_ref(), (k, k))?;
        check_seed_dims("noise", config.noise.as_ref(), (NBASE, k))?;
    }

    let mut results = Vec::with_capacity(subtiles.len());
    for (blk, sub) in subtiles.into_iter().enumerate() {
        log::info!(
            "processing block {} ({} clusters, {} cycles)",
            blk + 1,
            sub.ncluster(),
            sub.ncycle()
        );
        let outcome = Ayb::new(sub, config).and_then(|mut ayb| {
            ayb.run(config)?;
            Ok(ayb.into_fit(blk))
        });
        if let Err(e) = &outcome {
            log::error!("block {} failed: {e}", blk + 1);
        }
        results.push(outcome);
    }
    Ok(results)
}
