//! Bridge between `ndarray` storage and `faer` factorisations.
//!
//! The model core keeps everything in `ndarray` types; the two heavy
//! factorisations it needs — a full SVD for least-squares solves and an
//! LLT for symmetric positive-definite inversion — are delegated to
//! `faer` through borrowing views so standard-layout arrays cross the
//! boundary without a copy.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: matrix is not positive definite")]
    NotPositiveDefinite(solvers::LltError),
    #[error("least-squares system is rank zero")]
    RankZero,
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// A `faer` view over an `ndarray` array, borrowing when the layout
/// allows and copying otherwise.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        } else {
            let (rows, cols) = array.dim();
            FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Full SVD of an `ndarray` matrix: `(U, singular values, V^t)`.
pub trait FaerSvd {
    fn svd_full(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn svd_full(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();
        let (rows, cols) = faer_mat.shape();

        let mut singular = Diag::<f64>::zeros(rows.min(cols));
        let mut u_storage = Mat::<f64>::zeros(rows, rows);
        let mut v_storage = Mat::<f64>::zeros(cols, cols);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Full,
            ComputeSvdVectors::Full,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        svd::svd(
            faer_mat,
            singular.as_mut(),
            Some(u_storage.as_mut()),
            Some(v_storage.as_mut()),
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| LinalgError::SvdNoConvergence)?;

        let singular_values = diag_to_array(singular.as_ref());
        let u = mat_to_array(u_storage.as_ref());
        let v_ref = v_storage.as_ref();
        let vt = Array2::from_shape_fn((v_ref.ncols(), v_ref.nrows()), |(i, j)| v_ref[(j, i)]);
        Ok((u, singular_values, vt))
    }
}

/// Cholesky factorisation of an SPD `ndarray` matrix.
pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError>;
}

pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    /// Lower-triangular factor `L` with `A = L L^t`.
    pub fn lower(&self) -> Array2<f64> {
        let l = self.factor.L();
        let n = l.nrows();
        Array2::from_shape_fn((n, n), |(i, j)| if j <= i { l[(i, j)] } else { 0.0 })
    }
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(LinalgError::NotPositiveDefinite)?;
        Ok(CholeskyFactor { factor })
    }
}

/// Inverse of a symmetric positive-definite matrix via its LLT factor.
pub fn spd_inverse(a: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
    let factor = a.cholesky(Side::Lower)?;
    Ok(factor.solve_mat(&Array2::eye(a.nrows())))
}

/// Minimum-norm least-squares solution of `lhs * X = rhs` via the SVD
/// pseudo-inverse. Singular values below `max_sv * eps * max(dim)` are
/// treated as zero; a system with no usable singular value is reported
/// as [`LinalgError::RankZero`].
pub fn least_squares_solve(
    lhs: &Array2<f64>,
    rhs: &Array2<f64>,
) -> Result<Array2<f64>, LinalgError> {
    assert_eq!(
        lhs.nrows(),
        rhs.nrows(),
        "left and right sides must agree on rows"
    );
    let (u, s, vt) = lhs.svd_full()?;
    let max_sv = s.iter().cloned().fold(0.0_f64, f64::max);
    if !(max_sv > 0.0) || !max_sv.is_finite() {
        return Err(LinalgError::RankZero);
    }
    let tol = max_sv * f64::EPSILON * lhs.nrows().max(lhs.ncols()) as f64;

    // X = V S^+ U^t rhs
    let utb = u.t().dot(rhs);
    let mut scaled = Array2::zeros((lhs.ncols(), rhs.ncols()));
    for (k, &sv) in s.iter().enumerate() {
        if sv > tol {
            let inv = 1.0 / sv;
            for j in 0..rhs.ncols() {
                scaled[[k, j]] = utb[[k, j]] * inv;
            }
        }
    }
    Ok(vt.t().dot(&scaled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn svd_reconstructs_matrix() {
        let a = array![[3.0, 1.0, 0.5], [1.0, 4.0, -2.0]];
        let (u, s, vt) = a.svd_full().unwrap();
        let mut sigma = Array2::zeros((2, 3));
        for (i, &sv) in s.iter().enumerate() {
            sigma[[i, i]] = sv;
        }
        let back = u.dot(&sigma).dot(&vt);
        for (x, y) in a.iter().zip(back.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn least_squares_matches_exact_solution() {
        let a = array![[2.0, 0.0], [0.0, 4.0], [0.0, 0.0]];
        let b = array![[2.0], [8.0], [1.0]];
        let x = least_squares_solve(&a, &b).unwrap();
        assert!((x[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((x[[1, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn least_squares_minimum_norm_on_singular_system() {
        // Rank-one system: rows proportional, infinitely many solutions.
        let a = array![[10.0, 1.0], [100.0, 10.0]];
        let b = array![[10.0], [100.0]];
        let x = least_squares_solve(&a, &b).unwrap();
        // Residual of the consistent system is zero.
        let r = &a.dot(&x) - &b;
        assert!(r.iter().all(|v| v.abs() < 1e-9));
        // Minimum-norm solution lies along (10, 1).
        assert!((x[[0, 0]] / x[[1, 0]] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_system_is_rank_zero() {
        let a = Array2::<f64>::zeros((3, 3));
        let b = Array2::<f64>::ones((3, 1));
        assert!(matches!(
            least_squares_solve(&a, &b),
            Err(LinalgError::RankZero)
        ));
    }

    #[test]
    fn spd_inverse_round_trip() {
        let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 2.0]];
        let inv = spd_inverse(&a).unwrap();
        let prod = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((prod[[i, j]] - expect).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(a.cholesky(Side::Lower).is_err());
    }

    #[test]
    fn cholesky_lower_factor() {
        let a = array![[4.0, 2.0], [2.0, 5.0]];
        let l = a.cholesky(Side::Lower).unwrap().lower();
        let back = l.dot(&l.t());
        for (x, y) in a.iter().zip(back.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}
