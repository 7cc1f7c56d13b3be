//! Dense-kernel helpers layered over `ndarray`.
//!
//! Allocation, copying, transposition and scaling come straight from
//! `ndarray`; this module adds the operations the calling core needs on
//! top: LU determinant and inverse, unit-determinant normalisation,
//! inclusive column appends, block-diagonal extraction, the bilinear
//! form, and the column-major text format used for seed matrices.

use crate::linalg::{self, LinalgError};
use ndarray::{Array2, ArrayView1};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix shape {rows}x{cols} is invalid for {op}")]
    InvalidDim {
        op: &'static str,
        rows: usize,
        cols: usize,
    },
    #[error("matrix is singular")]
    Singular,
    #[error("matrix is near-singular: determinant scale {0:e} below tolerance")]
    NearSingular(f64),
    #[error("malformed matrix text: {0}")]
    Parse(String),
}

impl From<LinalgError> for MatrixError {
    fn from(_: LinalgError) -> Self {
        MatrixError::Singular
    }
}

fn require_square(a: &Array2<f64>, op: &'static str) -> Result<usize, MatrixError> {
    let (r, c) = a.dim();
    if r == 0 || r != c {
        return Err(MatrixError::InvalidDim {
            op,
            rows: r,
            cols: c,
        });
    }
    Ok(r)
}

/// LU factorisation with partial pivoting, in place.
///
/// Returns the permutation sign, or `None` when a pivot collapses to an
/// (effectively) zero value.
fn lu_in_place(a: &mut Array2<f64>) -> Option<(Vec<usize>, f64)> {
    let n = a.nrows();
    let mut perm: Vec<usize> = (0..n).collect();
    let mut sign = 1.0;
    for k in 0..n {
        let mut pivot_row = k;
        let mut pivot_val = a[[k, k]].abs();
        for r in (k + 1)..n {
            let v = a[[r, k]].abs();
            if v > pivot_val {
                pivot_val = v;
                pivot_row = r;
            }
        }
        if !(pivot_val > f64::MIN_POSITIVE) || !pivot_val.is_finite() {
            return None;
        }
        if pivot_row != k {
            for c in 0..n {
                let tmp = a[[k, c]];
                a[[k, c]] = a[[pivot_row, c]];
                a[[pivot_row, c]] = tmp;
            }
            perm.swap(k, pivot_row);
            sign = -sign;
        }
        let pivot = a[[k, k]];
        for r in (k + 1)..n {
            let factor = a[[r, k]] / pivot;
            a[[r, k]] = factor;
            for c in (k + 1)..n {
                a[[r, c]] -= factor * a[[k, c]];
            }
        }
    }
    Some((perm, sign))
}

/// Determinant of a square matrix via LU with partial pivoting.
pub fn determinant(a: &Array2<f64>) -> Result<f64, MatrixError> {
    let n = require_square(a, "determinant")?;
    let mut lu = a.clone();
    match lu_in_place(&mut lu) {
        None => Ok(0.0),
        Some((_, sign)) => {
            let mut det = sign;
            for k in 0..n {
                det *= lu[[k, k]];
            }
            Ok(det)
        }
    }
}

/// General inverse of a square matrix via LU solves against the identity.
pub fn invert(a: &Array2<f64>) -> Result<Array2<f64>, MatrixError> {
    let n = require_square(a, "invert")?;
    let mut lu = a.clone();
    let (perm, _) = lu_in_place(&mut lu).ok_or(MatrixError::Singular)?;
    let mut inv = Array2::zeros((n, n));
    let mut col = vec![0.0; n];
    for j in 0..n {
        // Forward substitution on the permuted unit column.
        for i in 0..n {
            let mut sum = if perm[i] == j { 1.0 } else { 0.0 };
            for k in 0..i {
                sum -= lu[[i, k]] * col[k];
            }
            col[i] = sum;
        }
        // Back substitution.
        for i in (0..n).rev() {
            let mut sum = col[i];
            for k in (i + 1)..n {
                sum -= lu[[i, k]] * col[k];
            }
            col[i] = sum / lu[[i, i]];
        }
        for i in 0..n {
            inv[[i, j]] = col[i];
        }
    }
    if inv.iter().any(|v| !v.is_finite()) {
        return Err(MatrixError::Singular);
    }
    Ok(inv)
}

/// Inverse of a symmetric positive-definite matrix via Cholesky.
pub fn invert_spd(a: &Array2<f64>) -> Result<Array2<f64>, MatrixError> {
    require_square(a, "invert_spd")?;
    Ok(linalg::spd_inverse(a)?)
}

/// Scale a square matrix in place so its determinant has modulus one.
///
/// Returns the applied scale `d = |det|^(1/n)`. When `d < eps` the
/// matrix is left untouched and `NearSingular` is reported.
pub fn normalise_to_unit_det(a: &mut Array2<f64>, eps: f64) -> Result<f64, MatrixError> {
    let n = require_square(a, "normalise_to_unit_det")?;
    let det = determinant(a)?;
    let d = det.abs().powf(1.0 / n as f64);
    if !(d >= eps) || !d.is_finite() {
        return Err(MatrixError::NearSingular(if d.is_finite() { d } else { 0.0 }));
    }
    a.mapv_inplace(|v| v / d);
    Ok(d)
}

/// Append the inclusive column range `[col_start, col_end]` of `src` to
/// `dst`, creating `dst` when absent.
pub fn append_columns(
    dst: Option<Array2<f64>>,
    src: &Array2<f64>,
    col_start: usize,
    col_end: usize,
) -> Result<Array2<f64>, MatrixError> {
    let (rows, cols) = src.dim();
    if col_start > col_end || col_end >= cols || rows == 0 {
        return Err(MatrixError::InvalidDim {
            op: "append_columns",
            rows,
            cols,
        });
    }
    let added = col_end - col_start + 1;
    let (mut out, offset) = match dst {
        None => (Array2::zeros((rows, added)), 0),
        Some(existing) => {
            if existing.nrows() != rows {
                return Err(MatrixError::InvalidDim {
                    op: "append_columns",
                    rows: existing.nrows(),
                    cols: existing.ncols(),
                });
            }
            let old = existing.ncols();
            let mut grown = Array2::zeros((rows, old + added));
            grown.slice_mut(ndarray::s![.., ..old]).assign(&existing);
            (grown, old)
        }
    };
    out.slice_mut(ndarray::s![.., offset..])
        .assign(&src.slice(ndarray::s![.., col_start..=col_end]));
    Ok(out)
}

/// The `dim/b` diagonal `b x b` blocks of a square matrix.
pub fn block_diagonal(a: &Array2<f64>, b: usize) -> Result<Vec<Array2<f64>>, MatrixError> {
    let n = require_square(a, "block_diagonal")?;
    if b == 0 || n % b != 0 {
        return Err(MatrixError::InvalidDim {
            op: "block_diagonal",
            rows: n,
            cols: b,
        });
    }
    let nblock = n / b;
    let mut blocks = Vec::with_capacity(nblock);
    for blk in 0..nblock {
        let off = blk * b;
        blocks.push(
            a.slice(ndarray::s![off..off + b, off..off + b])
                .to_owned(),
        );
    }
    Ok(blocks)
}

/// Bilinear form `x^t M y`.
pub fn x_m_y(x: ArrayView1<f64>, m: &Array2<f64>, y: ArrayView1<f64>) -> f64 {
    debug_assert_eq!(m.nrows(), x.len());
    debug_assert_eq!(m.ncols(), y.len());
    let mut total = 0.0;
    for (i, &xi) in x.iter().enumerate() {
        let mut row = 0.0;
        for (j, &yj) in y.iter().enumerate() {
            row += m[[i, j]] * yj;
        }
        total += xi * row;
    }
    total
}

/// Parse a matrix from the seed-file text format: two leading integers
/// `nrow ncol`, then `nrow * ncol` reals in column-major order, all
/// whitespace separated.
pub fn parse_column_major(text: &str) -> Result<Array2<f64>, MatrixError> {
    let mut tokens = text.split_whitespace();
    let nrow: usize = tokens
        .next()
        .ok_or_else(|| MatrixError::Parse("missing row count".into()))?
        .parse()
        .map_err(|_| MatrixError::Parse("row count is not an integer".into()))?;
    let ncol: usize = tokens
        .next()
        .ok_or_else(|| MatrixError::Parse("missing column count".into()))?
        .parse()
        .map_err(|_| MatrixError::Parse("column count is not an integer".into()))?;
    if nrow == 0 || ncol == 0 {
        return Err(MatrixError::Parse("matrix dimensions must be positive".into()));
    }
    let mut out = Array2::zeros((nrow, ncol));
    for c in 0..ncol {
        for r in 0..nrow {
            let tok = tokens.next().ok_or_else(|| {
                MatrixError::Parse(format!(
                    "expected {} values, file ends at column {c}",
                    nrow * ncol
                ))
            })?;
            out[[r, c]] = tok
                .parse()
                .map_err(|_| MatrixError::Parse(format!("bad value '{tok}'")))?;
        }
    }
    Ok(out)
}

/// Render a matrix in the same column-major text format, so fitted
/// matrices can seed later runs.
pub fn write_column_major(a: &Array2<f64>) -> String {
    let (nrow, ncol) = a.dim();
    let mut out = String::new();
    let _ = writeln!(out, "{nrow} {ncol}");
    for c in 0..ncol {
        for r in 0..nrow {
            if r > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{:.6}", a[[r, c]]);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn determinant_known_values() {
        let a = array![[2.0, 0.0], [0.0, 3.0]];
        assert!((determinant(&a).unwrap() - 6.0).abs() < 1e-12);
        let b = array![[0.0, 1.0], [1.0, 0.0]];
        assert!((determinant(&b).unwrap() + 1.0).abs() < 1e-12);
        let s = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(determinant(&s).unwrap().abs() < 1e-12);
    }

    #[test]
    fn inverse_round_trip() {
        let a = array![
            [2.0, 1.0, 0.0, 0.1],
            [0.5, 3.0, 0.2, 0.0],
            [0.0, 0.3, 1.5, 0.4],
            [0.2, 0.0, 0.6, 2.5]
        ];
        let inv = invert(&a).unwrap();
        let prod = a.dot(&inv);
        for i in 0..4 {
            for j in 0..4 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((prod[[i, j]] - expect).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn singular_inverse_is_rejected() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(matches!(invert(&a), Err(MatrixError::Singular)));
        let z = Array2::<f64>::zeros((3, 3));
        assert!(matches!(invert(&z), Err(MatrixError::Singular)));
    }

    #[test]
    fn normalise_scales_det_to_one() {
        let mut a = array![[3.0, 1.0], [0.5, 2.0]];
        let d = normalise_to_unit_det(&mut a, 3e-8).unwrap();
        assert!(d > 0.0);
        assert!((determinant(&a).unwrap().abs() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn normalise_rejects_near_singular() {
        let mut z = Array2::<f64>::zeros((4, 4));
        let before = z.clone();
        assert!(matches!(
            normalise_to_unit_det(&mut z, 3e-8),
            Err(MatrixError::NearSingular(_))
        ));
        assert_eq!(z, before);
    }

    #[test]
    fn append_columns_grows_and_creates() {
        let src = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let first = append_columns(None, &src, 0, 1).unwrap();
        assert_eq!(first.dim(), (2, 2));
        assert_eq!(first[[1, 1]], 5.0);
        let grown = append_columns(Some(first), &src, 2, 2).unwrap();
        assert_eq!(grown.dim(), (2, 3));
        assert_eq!(grown[[0, 2]], 3.0);
        assert!(append_columns(None, &src, 2, 1).is_err());
        assert!(append_columns(None, &src, 0, 3).is_err());
    }

    #[test]
    fn block_diagonal_extracts_blocks() {
        let mut a = Array2::<f64>::zeros((6, 6));
        for i in 0..6 {
            for j in 0..6 {
                a[[i, j]] = (10 * i + j) as f64;
            }
        }
        let blocks = block_diagonal(&a, 2).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1][[0, 0]], a[[2, 2]]);
        assert_eq!(blocks[2][[1, 0]], a[[5, 4]]);
        assert!(block_diagonal(&a, 4).is_err());
    }

    #[test]
    fn bilinear_form() {
        let m = array![[1.0, 2.0], [3.0, 4.0]];
        let x = array![1.0, 1.0];
        let y = array![1.0, -1.0];
        // (1,1) M (1,-1)^t = (4, 6) . (1, -1) = -2
        assert!((x_m_y(x.view(), &m, y.view()) + 2.0).abs() < 1e-12);
    }

    #[test]
    fn column_major_text_round_trip() {
        let a = array![[1.5, -2.0], [0.25, 4.0], [3.0, 0.0]];
        let text = write_column_major(&a);
        let back = parse_column_major(&text).unwrap();
        assert_eq!(back.dim(), (3, 2));
        for (x, y) in a.iter().zip(back.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
        assert!(parse_column_major("2 2 1.0 2.0 3.0").is_err());
        assert!(parse_column_major("x 2").is_err());
    }
}
