use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::QR;
use thiserror::Error;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be less than or equal to end ({1}).")]
    InvalidRange(f64, f64),

    #[error("Knot vector of length {knots} is too short for a degree {degree} spline.")]
    KnotVectorTooShort { knots: usize, degree: usize },

    #[error("Knot vector must be non-decreasing; knot {index} is smaller than its predecessor.")]
    UnsortedKnots { index: usize },

    #[error("Non-finite value {value} at row {row} cannot be expanded into a spline basis.")]
    NonFiniteInput { row: usize, value: f64 },

    #[error("Cannot constrain a basis whose columns all sum to zero.")]
    DegenerateConstraint,

    #[error("QR decomposition failed while applying constraints: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Builds the clamped knot vector for a spline with uniformly spaced internal knots.
///
/// The returned vector repeats each boundary `degree + 1` times, so the basis has
/// `num_internal_knots + degree + 1` functions.
pub fn uniform_knot_vector(
    data_range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
) -> Result<Array1<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    let (min_val, max_val) = data_range;
    if !(min_val <= max_val) {
        return Err(BasisError::InvalidRange(min_val, max_val));
    }

    let internal_knots = if num_internal_knots == 0 {
        Array1::from_vec(vec![])
    } else {
        let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
        Array::from_iter((1..=num_internal_knots).map(|i| min_val + i as f64 * h))
    };

    let min_knots = Array1::from_elem(degree + 1, min_val);
    let max_knots = Array1::from_elem(degree + 1, max_val);

    let mut knots = Vec::with_capacity(internal_knots.len() + 2 * (degree + 1));
    knots.extend(min_knots.iter());
    knots.extend(internal_knots.iter());
    knots.extend(max_knots.iter());
    Ok(Array1::from_vec(knots))
}

/// Number of basis functions a knot vector of this length supports at `degree`.
pub fn num_basis_functions(knots: usize, degree: usize) -> usize {
    knots.saturating_sub(degree + 1)
}

/// Evaluates a B-spline basis at `data` using a knot vector saved at fit time.
///
/// Inputs outside the boundary knots are clamped to the nearest boundary, so a
/// prediction never extrapolates beyond the region the expert was fit on.
///
/// # Returns
/// The basis matrix with shape `[data.len(), knots.len() - degree - 1]`.
pub fn create_bspline_basis_with_knots(
    data: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if knots.len() < 2 * (degree + 1) {
        return Err(BasisError::KnotVectorTooShort {
            knots: knots.len(),
            degree,
        });
    }
    if let Some(index) = (1..knots.len()).find(|&i| knots[i] < knots[i - 1]) {
        return Err(BasisError::UnsortedKnots { index });
    }

    let num_basis = num_basis_functions(knots.len(), degree);
    let lower = knots[degree];
    let upper = knots[num_basis];

    let mut basis_matrix = Array2::zeros((data.len(), num_basis));
    for (i, &x) in data.iter().enumerate() {
        if !x.is_finite() {
            return Err(BasisError::NonFiniteInput { row: i, value: x });
        }
        let clamped = x.clamp(lower, upper);
        let basis_row = internal::evaluate_splines_at_point(clamped, degree, knots);
        basis_matrix.row_mut(i).assign(&basis_row);
    }

    Ok(basis_matrix)
}

/// Reparameterizes a basis so its columns sum to zero over `basis_matrix`'s rows.
///
/// # Returns
/// The constrained basis (one fewer column) and the transformation `Z` with
/// `B_constrained = B Z`. `Z` is what an expert stores for prediction.
pub fn apply_sum_to_zero_constraint(
    basis_matrix: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let n_basis = basis_matrix.ncols();

    // c = B' 1
    let c = basis_matrix.sum_axis(Axis(0));
    if n_basis < 2 || c.iter().all(|v| *v == 0.0) {
        return Err(BasisError::DegenerateConstraint);
    }

    // QR of the square matrix [c | 0] returns the full orthogonal Q. Its first
    // column spans c and the remaining columns span the null space of c'.
    let mut padded = Array2::<f64>::zeros((n_basis, n_basis));
    padded.column_mut(0).assign(&c);
    let (q, _) = padded.qr()?;
    let z_transform = q.slice(s![.., 1..]).to_owned();

    let constrained_basis = basis_matrix.dot(&z_transform);
    Ok((constrained_basis, z_transform))
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Evaluates all B-spline basis functions at a single point `x` with the
    /// Cox-de Boor recurrence. `x` must already lie inside the boundary knots.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_basis = knots.len() - degree - 1;

        // Knot span with knots[span] <= x < knots[span + 1]; the right boundary
        // belongs to the last non-empty span.
        let mut span = degree;
        while span < num_basis - 1 && knots[span + 1] <= x {
            span += 1;
        }

        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        let mut local = vec![0.0; degree + 1];
        local[0] = 1.0;

        for j in 1..=degree {
            left[j] = x - knots[span + 1 - j];
            right[j] = knots[span + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom.abs() > 1e-12 {
                    local[r] / denom
                } else {
                    0.0
                };
                local[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            local[j] = saved;
        }

        let mut basis_values = Array1::zeros(num_basis);
        let start_index = span - degree;
        for (i, value) in local.into_iter().enumerate() {
            basis_values[start_index + i] = value;
        }
        basis_values
    }
}
