//! End-to-end scenarios for the base-calling driver: clean single
//! clusters, simulated tiles with known instrument matrices, block
//! splitting, and the run-fatal error paths.

use ayb::blockspec::parse_blockspec;
use ayb::config::AybConfig;
use ayb::matrix;
use ayb::model::{DriverError, ModelError, crosstalk_prior, process_tile};
use ayb::nuc::{NBASE, Nuc};
use ayb::tile::{Cluster, Tile};
use ndarray::{Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Phasing with a superdiagonal bleed: each cycle leaks a fraction of
/// its signal into the next one.
fn shifted_phasing(ncycle: usize, bleed: f64) -> Array2<f64> {
    let mut p = Array2::eye(ncycle);
    for k in 0..ncycle.saturating_sub(1) {
        p[[k, k + 1]] = bleed;
    }
    p
}

/// Simulate a tile from known instrument matrices, brightnesses and
/// base sequences, with additive Gaussian noise.
fn simulate_tile(
    rng: &mut StdRng,
    ncluster: usize,
    m: &Array2<f64>,
    p: &Array2<f64>,
    n: &Array2<f64>,
    sigma: f64,
) -> (Tile, Vec<Nuc>, Vec<f64>) {
    let ncycle = p.nrows();
    let normal = Normal::new(0.0, sigma).unwrap();
    let mut truth = Vec::with_capacity(ncluster * ncycle);
    let mut lambdas = Vec::with_capacity(ncluster);
    let clusters = (0..ncluster)
        .map(|cl| {
            let lambda: f64 = rng.random_range(0.5..1.5);
            lambdas.push(lambda);
            let mut s = Array2::zeros((NBASE, ncycle));
            for cy in 0..ncycle {
                let base = rng.random_range(0..NBASE);
                truth.push(Nuc::from_index(base));
                s[[base, cy]] = 1.0;
            }
            let mut signals = m.dot(&s).dot(p) * lambda + n;
            signals.mapv_inplace(|v| v + normal.sample(rng));
            Cluster::new(cl as u32, cl as u32, signals)
        })
        .collect();
    (Tile::new(1, 1, clusters).unwrap(), truth, lambdas)
}

/// Relative Frobenius distance after aligning `got` to `want` with the
/// optimal global scale (covers the sign/scale ambiguity of the fit).
fn aligned_distance(got: &Array2<f64>, want: &Array2<f64>) -> f64 {
    let dot: f64 = got.iter().zip(want.iter()).map(|(a, b)| a * b).sum();
    let norm_got: f64 = got.iter().map(|v| v * v).sum();
    let scale = dot / norm_got;
    let mut diff = 0.0;
    let mut norm_want = 0.0;
    for (g, w) in got.iter().zip(want.iter()) {
        diff += (scale * g - w) * (scale * g - w);
        norm_want += w * w;
    }
    (diff / norm_want).sqrt()
}

#[test]
fn clean_diagonal_cluster_calls_all_four_bases() {
    // One cluster, one strong channel per cycle, identity instrument.
    let signals = array![
        [10.0, 0.0, 0.0, 0.0],
        [0.0, 10.0, 0.0, 0.0],
        [0.0, 0.0, 10.0, 0.0],
        [0.0, 0.0, 0.0, 10.0]
    ];
    let tile = Tile::new(1, 1, vec![Cluster::new(0, 0, signals)]).unwrap();
    let mut config = AybConfig::new(parse_blockspec("4R").unwrap());
    config.crosstalk = Some(Array2::eye(NBASE));
    config.phasing = Some(Array2::eye(4));
    config.noise = Some(Array2::zeros((NBASE, 4)));
    config.mu = 1e-5;
    config.n_iter = 3;

    let results = process_tile(&tile, &config).unwrap();
    assert_eq!(results.len(), 1);
    let fit = results.into_iter().next().unwrap().unwrap();
    assert_eq!(fit.bases, vec![Nuc::A, Nuc::C, Nuc::G, Nuc::T]);
    assert!(
        fit.quals.iter().all(|&q| q >= 30),
        "qualities {:?}",
        fit.quals
    );
}

#[test]
fn simulated_tile_agrees_with_truth() {
    let mut rng = StdRng::seed_from_u64(2010);
    let ncycle = 5;
    let m = crosstalk_prior();
    let p = shifted_phasing(ncycle, 0.1);
    let n = Array2::zeros((NBASE, ncycle));
    let (tile, truth, _) = simulate_tile(&mut rng, 500, &m, &p, &n, 0.02);

    let config = AybConfig::new(parse_blockspec("5R").unwrap());
    let results = process_tile(&tile, &config).unwrap();
    let fit = results.into_iter().next().unwrap().unwrap();

    let agree = fit
        .bases
        .iter()
        .zip(truth.iter())
        .filter(|(a, b)| a == b)
        .count();
    let rate = agree as f64 / truth.len() as f64;
    assert!(rate >= 0.98, "agreement {rate}");
}

#[test]
fn recovers_instrument_matrices_from_simulation() {
    let mut rng = StdRng::seed_from_u64(41);
    let ncycle = 5;
    let m_true = crosstalk_prior();
    let p_true = shifted_phasing(ncycle, 0.1);
    let n_true = Array2::from_shape_fn((NBASE, ncycle), |(ch, cy)| {
        0.2 + 0.1 * ch as f64 + 0.02 * cy as f64
    });
    let (tile, _, _) = simulate_tile(&mut rng, 400, &m_true, &p_true, &n_true, 0.01);

    let config = AybConfig::new(parse_blockspec("5R").unwrap());
    let results = process_tile(&tile, &config).unwrap();
    let fit = results.into_iter().next().unwrap().unwrap();

    // The fitted matrices are determinant-normalised; compare up to a
    // global scale.
    let m_err = aligned_distance(&fit.crosstalk, &m_true);
    assert!(m_err < 0.05, "crosstalk error {m_err}");
    let p_err = aligned_distance(&fit.phasing, &p_true);
    assert!(p_err < 0.05, "phasing error {p_err}");
    let n_norm: f64 = n_true.iter().map(|v| v * v).sum::<f64>().sqrt();
    let n_err: f64 = fit
        .noise
        .iter()
        .zip(n_true.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
        / n_norm;
    assert!(n_err < 0.05, "noise error {n_err}");
}

#[test]
fn driver_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(77);
    let ncycle = 4;
    let m = crosstalk_prior();
    let p = shifted_phasing(ncycle, 0.08);
    let n = Array2::zeros((NBASE, ncycle));
    let (tile, _, _) = simulate_tile(&mut rng, 60, &m, &p, &n, 0.05);
    let config = AybConfig::new(parse_blockspec("4R").unwrap());

    let first = process_tile(&tile, &config).unwrap();
    let second = process_tile(&tile, &config).unwrap();
    let a = first.into_iter().next().unwrap().unwrap();
    let b = second.into_iter().next().unwrap().unwrap();
    assert_eq!(a.bases, b.bases);
    assert_eq!(a.quals, b.quals);
}

#[test]
fn blockspec_splits_into_reads_of_expected_length() {
    let mut rng = StdRng::seed_from_u64(8);
    let ncycle = 8;
    let m = crosstalk_prior();
    let p = Array2::eye(ncycle);
    let n = Array2::zeros((NBASE, ncycle));
    let (tile, truth, _) = simulate_tile(&mut rng, 40, &m, &p, &n, 0.01);

    let config = AybConfig::new(parse_blockspec("2R,3I,3R").unwrap());
    let results = process_tile(&tile, &config).unwrap();
    assert_eq!(results.len(), 2);
    let fits: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(fits[0].ncycle, 2);
    assert_eq!(fits[1].ncycle, 3);
    assert_eq!(fits[0].bases.len(), 40 * 2);
    assert_eq!(fits[1].bases.len(), 40 * 3);

    // The second read starts after the ignored cycles: check a sample of
    // calls against the truth of cycles 5..8.
    let mut agree = 0usize;
    for cl in 0..40 {
        for cy in 0..3 {
            if fits[1].bases[cl * 3 + cy] == truth[cl * ncycle + 5 + cy] {
                agree += 1;
            }
        }
    }
    assert!(agree as f64 / 120.0 > 0.95, "second read agreement {agree}/120");
}

#[test]
fn degenerate_phasing_seed_isolates_block_failures() {
    let mut rng = StdRng::seed_from_u64(13);
    let ncycle = 6;
    let m = crosstalk_prior();
    let p = Array2::eye(ncycle);
    let n = Array2::zeros((NBASE, ncycle));
    let (tile, _, _) = simulate_tile(&mut rng, 30, &m, &p, &n, 0.02);

    let mut config = AybConfig::new(parse_blockspec("3R,3R").unwrap());
    config.phasing = Some(Array2::zeros((3, 3)));
    let results = process_tile(&tile, &config).unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert!(matches!(result, Err(ModelError::EstimateNonConvergent)));
    }
}

#[test]
fn short_tile_fails_before_any_block() {
    let signals = Array2::from_elem((NBASE, 3), 1.0);
    let tile = Tile::new(1, 1, vec![Cluster::new(0, 0, signals)]).unwrap();
    let config = AybConfig::new(parse_blockspec("4R").unwrap());
    assert!(matches!(
        process_tile(&tile, &config),
        Err(DriverError::InsufficientCycles {
            required: 4,
            found: 3
        })
    ));
}

#[test]
fn misshapen_crosstalk_seed_fails_before_any_block() {
    let signals = Array2::from_elem((NBASE, 4), 1.0);
    let tile = Tile::new(1, 1, vec![Cluster::new(0, 0, signals)]).unwrap();
    let mut config = AybConfig::new(parse_blockspec("4R").unwrap());
    config.crosstalk = Some(Array2::eye(3));
    assert!(matches!(
        process_tile(&tile, &config),
        Err(DriverError::SeedDimMismatch {
            name: "crosstalk",
            ..
        })
    ));
}

#[test]
fn misshapen_phasing_seed_fails_for_any_block() {
    let signals = Array2::from_elem((NBASE, 6), 1.0);
    let tile = Tile::new(1, 1, vec![Cluster::new(0, 0, signals)]).unwrap();
    // The second block has 4 cycles, so a 2x2 phasing seed cannot serve
    // the whole run even though it fits the first block.
    let mut config = AybConfig::new(parse_blockspec("2R,4R").unwrap());
    config.phasing = Some(Array2::eye(2));
    assert!(matches!(
        process_tile(&tile, &config),
        Err(DriverError::SeedDimMismatch { name: "phasing", .. })
    ));
}

#[test]
fn unit_determinant_invariant_holds_after_fitting() {
    let mut rng = StdRng::seed_from_u64(19);
    let ncycle = 4;
    let m = crosstalk_prior();
    let p = shifted_phasing(ncycle, 0.05);
    let n = Array2::zeros((NBASE, ncycle));
    let (tile, _, _) = simulate_tile(&mut rng, 80, &m, &p, &n, 0.02);

    let config = AybConfig::new(parse_blockspec("4R").unwrap());
    let results = process_tile(&tile, &config).unwrap();
    let fit = results.into_iter().next().unwrap().unwrap();
    let det_m = matrix::determinant(&fit.crosstalk).unwrap();
    let det_p = matrix::determinant(&fit.phasing).unwrap();
    assert!((det_m.abs() - 1.0).abs() < 1e-8, "det(M) {det_m}");
    assert!((det_p.abs() - 1.0).abs() < 1e-8, "det(P) {det_p}");
}
