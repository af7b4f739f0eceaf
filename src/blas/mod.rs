#![allow(clippy::cast_sign_loss)]

//! The BLAS-like surface.
//!
//! Every routine comes in two forms: `try_<name>` returns the error, and `<name>`
//! reports it through [`Context::fatal`](crate::runtime::Context::fatal). Parameter
//! positions in validation errors follow the CBLAS argument order.

pub mod level1;
pub mod level2;
pub mod level3;

pub use level1::*;
pub use level2::*;
pub use level3::*;

use crate::error::{BlasError, BlasResult};

/// Storage order of a matrix argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColMajor,
}

/// Whether a matrix argument is used as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    NoTrans,
    Trans,
}

impl Transpose {
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            Self::NoTrans => Self::Trans,
            Self::Trans => Self::NoTrans,
        }
    }

    /// Rows and columns of the stored matrix for an operand used as `rows × cols`.
    const fn stored(self, rows: usize, cols: usize) -> (usize, usize) {
        match self {
            Self::NoTrans => (rows, cols),
            Self::Trans => (cols, rows),
        }
    }
}

// ===============================================================================================
// Argument Validation
// ===============================================================================================

const MUST_BE_POSITIVE: &str = "must be greater than zero";

/// A length or dimension, which must be positive.
pub(crate) fn check_dim(position: i32, name: &'static str, value: i32) -> BlasResult<usize> {
    if value > 0 {
        Ok(value as usize)
    } else {
        Err(BlasError::invalid(position, name, format!("{MUST_BE_POSITIVE}, got {value}")))
    }
}

/// A vector stride, which must be positive.
pub(crate) fn check_inc(position: i32, name: &'static str, inc: i32) -> BlasResult<usize> {
    check_dim(position, name, inc)
}

/// Elements spanned by `n` entries `inc` apart.
fn span(n: usize, inc: usize) -> Option<usize> {
    (n - 1).checked_mul(inc)?.checked_add(1)
}

/// Whether `len` elements hold `n` entries `inc` apart.
pub(crate) fn check_vector(
    position: i32,
    name: &'static str,
    len: usize,
    n: usize,
    inc: usize,
) -> BlasResult<()> {
    match span(n, inc) {
        Some(needed) if needed <= len => Ok(()),
        Some(needed) => Err(BlasError::invalid(
            position,
            name,
            format!("holds {len} elements, {needed} needed"),
        )),
        None => Err(BlasError::invalid(position, name, "span overflows")),
    }
}

/// Validate a stored `rows × cols` matrix of `len` elements with leading dimension `ld`.
pub(crate) fn check_matrix(
    positions: (i32, i32),
    names: (&'static str, &'static str),
    len: usize,
    layout: Layout,
    (rows, cols): (usize, usize),
    ld: i32,
) -> BlasResult<usize> {
    let (major, minor) = match layout {
        Layout::RowMajor => (cols, rows),
        Layout::ColMajor => (rows, cols),
    };

    let ld = check_dim(positions.1, names.1, ld)?;
    if ld < major {
        return Err(BlasError::invalid(
            positions.1,
            names.1,
            format!("{ld} is less than {major}"),
        ));
    }
    match (minor - 1).checked_mul(ld).and_then(|n| n.checked_add(major)) {
        Some(needed) if needed <= len => Ok(ld),
        Some(needed) => Err(BlasError::invalid(
            positions.0,
            names.0,
            format!("holds {len} elements, {needed} needed"),
        )),
        None => Err(BlasError::invalid(positions.0, names.0, "span overflows")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn dimensions_must_be_positive() {
        assert_eq!(check_dim(1, "n", 5).unwrap(), 5);
        let err = check_dim(1, "n", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.info(), 1);
        assert_eq!(check_inc(4, "incx", -1).unwrap_err().info(), 4);
    }

    #[test]
    fn strided_vectors_need_their_full_span() {
        assert!(check_vector(3, "x", 7, 4, 2).is_ok());
        assert!(check_vector(3, "x", 6, 4, 2).is_err());
        assert!(check_vector(3, "x", 1, 1, 100).is_ok());
    }

    #[test]
    fn matrices_check_leading_dimension_and_length() {
        // 3 × 4 row-major with padding: last row needs only 4 of its 6 slots.
        assert_eq!(
            check_matrix((6, 7), ("a", "lda"), 16, Layout::RowMajor, (3, 4), 6).unwrap(),
            6
        );
        assert_eq!(
            check_matrix((6, 7), ("a", "lda"), 15, Layout::RowMajor, (3, 4), 6)
                .unwrap_err()
                .info(),
            6
        );
        assert_eq!(
            check_matrix((6, 7), ("a", "lda"), 100, Layout::RowMajor, (3, 4), 3)
                .unwrap_err()
                .info(),
            7
        );
        assert!(check_matrix((6, 7), ("a", "lda"), 12, Layout::ColMajor, (3, 4), 3).is_ok());
    }

    #[test]
    fn transposition_swaps_stored_shape() {
        assert_eq!(Transpose::NoTrans.stored(2, 5), (2, 5));
        assert_eq!(Transpose::Trans.stored(2, 5), (5, 2));
        assert_eq!(Transpose::Trans.flip(), Transpose::NoTrans);
    }
}
