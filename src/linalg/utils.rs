use super::faer_ndarray::FaerLinalgError;
use ndarray::{Array2, ArrayBase, Data, Ix2};

#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = KahanSum::default();
        for value in iter {
            acc.add(value);
        }
        acc
    }
}

/// `(A + Aᵀ) / 2`.
pub(crate) fn symmetrize<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let t = matrix.t();
    let mut out = matrix.to_owned();
    out += &t;
    out.mapv_inplace(|v| 0.5 * v);
    out
}

/// Solve `R X = B` for upper-triangular `R` by back substitution.
pub(crate) fn solve_upper_triangular<S1, S2>(
    r: &ArrayBase<S1, Ix2>,
    rhs: &ArrayBase<S2, Ix2>,
) -> Result<Array2<f64>, FaerLinalgError>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (rows, cols) = r.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }
    let mut x = rhs.to_owned();
    for col in 0..x.ncols() {
        for i in (0..rows).rev() {
            let pivot = r[[i, i]];
            if pivot == 0.0 || !pivot.is_finite() {
                return Err(FaerLinalgError::SingularTriangular { row: i });
            }
            let mut acc = x[[i, col]];
            for k in (i + 1)..rows {
                acc -= r[[i, k]] * x[[k, col]];
            }
            x[[i, col]] = acc / pivot;
        }
    }
    Ok(x)
}
