//! Dense linear algebra on parameter tensors
//!
//! Tensors with two or more dimensions are viewed as a `shape[0] × rest`
//! row-major matrix and handled in `f64` through nalgebra. All
//! decompositions go through [`Svd::compute`], which sorts singular values in
//! descending order and reports non-convergence as
//! [`MergeError::DegenerateSubspace`].

use crate::{MergeError, Result, WeightTensor};
use nalgebra::DMatrix;

/// Singular values at or below `RANK_RTOL * σ_max` count as zero
pub const RANK_RTOL: f64 = 1e-5;

/// Implicit-shift iterations allowed per retained dimension before an SVD is
/// declared non-convergent
const SVD_ITERATIONS_PER_DIM: usize = 100;

/// Matrix view `(rows, cols)` of a tensor, if it has one
pub fn matrix_dims(tensor: &WeightTensor) -> Option<(usize, usize)> {
    if tensor.ndim() < 2 {
        return None;
    }
    let rows = tensor.shape[0];
    if rows == 0 || tensor.numel() == 0 {
        return None;
    }
    Some((rows, tensor.numel() / rows))
}

/// Copy a tensor into an `f64` matrix
pub fn to_matrix(tensor: &WeightTensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = matrix_dims(tensor).ok_or_else(|| {
        MergeError::InvalidWeights(format!(
            "'{}' with shape {:?} has no matrix view",
            tensor.name, tensor.shape
        ))
    })?;
    Ok(DMatrix::from_row_iterator(
        rows,
        cols,
        tensor.data.iter().map(|&x| f64::from(x)),
    ))
}

/// Write a matrix back into a tensor shaped like `like`
pub fn from_matrix(matrix: &DMatrix<f64>, like: &WeightTensor) -> WeightTensor {
    // nalgebra stores column-major; the transpose's storage is row-major
    let data: Vec<f32> = matrix.transpose().iter().map(|&x| x as f32).collect();
    WeightTensor {
        name: like.name.clone(),
        shape: like.shape.clone(),
        data,
    }
}

/// Thin singular value decomposition with descending singular values
#[derive(Debug, Clone)]
pub struct Svd {
    /// Left singular vectors, `m × k`
    pub u: DMatrix<f64>,
    /// Singular values, `k`, descending
    pub singular_values: Vec<f64>,
    /// Right singular vectors transposed, `k × n`
    pub v_t: DMatrix<f64>,
}

impl Svd {
    /// Decompose `matrix`
    pub fn compute(matrix: &DMatrix<f64>) -> Result<Self> {
        let max_iterations = SVD_ITERATIONS_PER_DIM * matrix.nrows().min(matrix.ncols()).max(1);
        Self::compute_with_limit(matrix, max_iterations)
    }

    fn compute_with_limit(matrix: &DMatrix<f64>, max_iterations: usize) -> Result<Self> {
        if matrix.iter().any(|x| !x.is_finite()) {
            return Err(MergeError::DegenerateSubspace(
                "matrix contains non-finite values".into(),
            ));
        }

        let svd = matrix
            .clone()
            .try_svd(true, true, f64::EPSILON, max_iterations)
            .ok_or_else(|| MergeError::DegenerateSubspace("SVD did not converge".into()))?;
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => {
                return Err(MergeError::DegenerateSubspace(
                    "SVD returned no singular vectors".into(),
                ));
            }
        };

        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

        Ok(Self {
            u: u.select_columns(order.iter()),
            singular_values: order.iter().map(|&i| svd.singular_values[i]).collect(),
            v_t: v_t.select_rows(order.iter()),
        })
    }

    /// Largest singular value, zero for an empty spectrum
    pub fn max_singular_value(&self) -> f64 {
        self.singular_values.first().copied().unwrap_or(0.0)
    }

    /// Number of singular values strictly above `tol`
    pub fn rank(&self, tol: f64) -> usize {
        self.singular_values
            .iter()
            .take_while(|&&s| s > tol)
            .count()
    }

    /// Rank relative to the largest singular value
    pub fn relative_rank(&self) -> usize {
        self.rank(self.max_singular_value() * RANK_RTOL)
    }

    /// First `k` left singular vectors
    pub fn leading_left(&self, k: usize) -> DMatrix<f64> {
        self.u.columns(0, k.min(self.u.ncols())).into_owned()
    }

    /// Reconstruct from the first `k` directions with every singular value
    /// replaced by their mean
    pub fn isotropic(&self, k: usize) -> DMatrix<f64> {
        let k = k.min(self.singular_values.len());
        if k == 0 {
            return DMatrix::zeros(self.u.nrows(), self.v_t.ncols());
        }
        let mean = self.singular_values[..k].iter().sum::<f64>() / k as f64;
        (self.u.columns(0, k) * self.v_t.rows(0, k)) * mean
    }
}

/// Isotropic reconstruction of `matrix` over the directions whose singular
/// value exceeds `tol`
pub fn isotropic_reconstruct(matrix: &DMatrix<f64>, tol: f64) -> Result<DMatrix<f64>> {
    let svd = Svd::compute(matrix)?;
    Ok(svd.isotropic(svd.rank(tol)))
}

/// Orthonormal basis for the column space of `matrix`, ignoring directions
/// with singular value at or below `tol`. Returns an `m × 0` matrix when
/// nothing survives.
pub fn orthonormal_basis(matrix: &DMatrix<f64>, tol: f64) -> Result<DMatrix<f64>> {
    if matrix.ncols() == 0 {
        return Ok(DMatrix::zeros(matrix.nrows(), 0));
    }
    let svd = Svd::compute(matrix)?;
    Ok(svd.leading_left(svd.rank(tol)))
}

/// `basis · basisᵀ · matrix`; zero when the basis is empty
pub fn project(basis: &DMatrix<f64>, matrix: &DMatrix<f64>) -> DMatrix<f64> {
    if basis.ncols() == 0 {
        return DMatrix::zeros(matrix.nrows(), matrix.ncols());
    }
    basis * (basis.transpose() * matrix)
}

/// Place the columns of `a` and `b` side by side
pub fn hstack(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(a.nrows(), a.ncols() + b.ncols());
    out.columns_mut(0, a.ncols()).copy_from(a);
    out.columns_mut(a.ncols(), b.ncols()).copy_from(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn assert_close(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        let diff = (a - b).abs().max();
        assert!(diff < tol, "max abs diff {diff} >= {tol}");
    }

    #[test]
    fn test_matrix_roundtrip_keeps_row_major_layout() {
        let tensor =
            WeightTensor::new("w", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let m = to_matrix(&tensor).unwrap();
        assert_eq!(m[(0, 2)], 3.0);
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(from_matrix(&m, &tensor), tensor);
    }

    #[test]
    fn test_higher_rank_tensor_is_flattened() {
        let tensor = WeightTensor::zeros("conv", vec![4, 3, 2, 2]);
        assert_eq!(matrix_dims(&tensor), Some((4, 12)));
        assert_eq!(matrix_dims(&WeightTensor::zeros("bias", vec![4])), None);
        assert_eq!(matrix_dims(&WeightTensor::zeros("empty", vec![0, 4])), None);
    }

    #[test]
    fn test_svd_sorted_and_reconstructs() {
        let m = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 5.0, 0.0, 0.0]);
        let svd = Svd::compute(&m).unwrap();
        assert!((svd.singular_values[0] - 5.0).abs() < 1e-12);
        assert!((svd.singular_values[1] - 1.0).abs() < 1e-12);

        let sigma = DMatrix::from_diagonal(&DVector::from_vec(svd.singular_values.clone()));
        assert_close(&(&svd.u * sigma * &svd.v_t), &m, 1e-12);
    }

    #[test]
    fn test_isotropic_flattens_spectrum() {
        let m = DMatrix::from_row_slice(2, 2, &[3.0, 0.0, 0.0, 1.0]);
        let iso = isotropic_reconstruct(&m, 1e-9).unwrap();
        let expected = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]);
        assert_close(&iso, &expected, 1e-12);
    }

    #[test]
    fn test_isotropic_rank_one_unchanged() {
        let u = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, -1.0]);
        let v = DMatrix::from_row_slice(1, 4, &[0.5, 0.0, 2.0, 1.0]);
        let m = &u * &v;
        let svd = Svd::compute(&m).unwrap();
        assert_eq!(svd.relative_rank(), 1);
        assert_close(&svd.isotropic(svd.relative_rank()), &m, 1e-10);
    }

    #[test]
    fn test_zero_matrix_has_rank_zero() {
        let m = DMatrix::<f64>::zeros(3, 3);
        let svd = Svd::compute(&m).unwrap();
        assert_eq!(svd.relative_rank(), 0);
        assert_close(&svd.isotropic(0), &m, f64::EPSILON);
    }

    #[test]
    fn test_non_finite_is_degenerate() {
        let m = DMatrix::from_row_slice(1, 2, &[f64::NAN, 1.0]);
        assert!(matches!(
            Svd::compute(&m),
            Err(MergeError::DegenerateSubspace(_))
        ));
    }

    #[test]
    fn test_iteration_cap_reports_non_convergence() {
        let m = DMatrix::from_fn(6, 5, |i, j| ((i * 5 + j) as f64 + 1.0).sin());
        assert!(matches!(
            Svd::compute_with_limit(&m, 1),
            Err(MergeError::DegenerateSubspace(_))
        ));
        assert_eq!(Svd::compute(&m).unwrap().singular_values.len(), 5);
    }

    #[test]
    fn test_orthonormal_basis_and_projection() {
        // two parallel columns and one independent one
        let m = DMatrix::from_column_slice(3, 3, &[1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let q = orthonormal_basis(&m, 1e-9).unwrap();
        assert_eq!(q.ncols(), 2);
        assert_close(&(q.transpose() * &q), &DMatrix::identity(2, 2), 1e-12);

        let x = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 3.0]);
        let p = project(&q, &x);
        let expected = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 0.0]);
        assert_close(&p, &expected, 1e-12);

        let empty = DMatrix::<f64>::zeros(3, 0);
        assert_eq!(orthonormal_basis(&empty, 1e-9).unwrap().ncols(), 0);
        assert_close(&project(&empty, &x), &DMatrix::zeros(3, 1), f64::EPSILON);
    }

    #[test]
    fn test_hstack() {
        let a = DMatrix::from_column_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_column_slice(2, 2, &[3.0, 4.0, 5.0, 6.0]);
        let c = hstack(&a, &b);
        assert_eq!(c.shape(), (2, 3));
        assert_eq!(c[(1, 2)], 6.0);
        assert_eq!(hstack(&DMatrix::zeros(2, 0), &a), a);
    }
}
