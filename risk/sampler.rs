//! Seeded posterior sampling from an expert.
//!
//! Coefficient draws come from the multivariate normal `N(beta_hat, V)`. The
//! covariance is factored with a symmetric eigendecomposition, `L = U sqrt(max(lambda, 0))`,
//! so semi-definite matrices (as produced by Rubin pooling) are accepted while a
//! clearly indefinite matrix is rejected. Draws are `beta = beta_hat + L z`.
//!
//! Every call builds its own `ChaCha20Rng` from the seed. All standard-normal
//! coefficient draws are taken first, row by row; response noise, when requested,
//! follows from the same stream. Identical `(expert, rows, quantity, n_draws, seed)`
//! therefore always produce identical output.

use crate::model::{Distribution, Expert, ModelError};
use crate::schema::FeatureFrame;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use std::fmt;
use thiserror::Error;

/// Relative tolerance for negative eigenvalues of the coefficient covariance.
pub const PSD_TOLERANCE: f64 = 1e-8;

/// What a draw represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Coefficient vectors, `[n_draws x p]`.
    Coefficients,
    /// The mean response `g^-1(X beta)`, `[n_draws x n_rows]`.
    Mean,
    /// A new observation: the mean plus outcome noise, `[n_draws x n_rows]`.
    Response,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Coefficients => f.write_str("coefficients"),
            Quantity::Mean => f.write_str("mean"),
            Quantity::Response => f.write_str("response"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Coefficient covariance is not positive semi-definite: smallest eigenvalue {min_eigenvalue:.3e} (largest {max_eigenvalue:.3e}).")]
    NotPositiveSemiDefinite {
        min_eigenvalue: f64,
        max_eigenvalue: f64,
    },

    #[error("Cannot draw the {quantity} quantity from a {distribution} expert.")]
    UnsupportedQuantity {
        quantity: Quantity,
        distribution: Distribution,
    },

    #[error("At least one draw must be requested.")]
    NoDraws,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Eigendecomposition of the coefficient covariance failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// Draws `n_draws` samples of `quantity` at `at_rows`.
///
/// Shapes: `[n_draws x p]` for `Quantity::Coefficients`, `[n_draws x n_rows]` otherwise.
pub fn sample<E: Expert + ?Sized>(
    expert: &E,
    at_rows: &FeatureFrame,
    quantity: Quantity,
    n_draws: usize,
    seed: u64,
) -> Result<Array2<f64>, SamplingError> {
    if n_draws == 0 {
        return Err(SamplingError::NoDraws);
    }
    if quantity == Quantity::Response && expert.distribution() != Distribution::Gaussian {
        return Err(SamplingError::UnsupportedQuantity {
            quantity,
            distribution: expert.distribution(),
        });
    }

    expert.validate()?;

    // Expand the rows before any random numbers are consumed so that a schema
    // failure never depends on the seed.
    let design = match quantity {
        Quantity::Coefficients => None,
        Quantity::Mean | Quantity::Response => Some(expert.design_matrix(at_rows)?),
    };

    let factor = covariance_factor(expert.covariance())?;
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let p = expert.coefficients().len();
    let z = Array2::from_shape_simple_fn((n_draws, p), || rng.sample::<f64, _>(StandardNormal));
    // Row d is beta_hat + L z_d.
    let mut draws = z.dot(&factor.t());
    draws += &expert.coefficients().as_view().insert_axis(Axis(0));

    let Some(x) = design else {
        return Ok(draws);
    };

    let link = expert.link();
    let mut mean = draws.dot(&x.t());
    mean.mapv_inplace(|eta| link.inverse(eta));

    if quantity == Quantity::Response {
        let sd = noise_sd(expert.scale());
        for value in mean.iter_mut() {
            let noise: f64 = rng.sample(StandardNormal);
            *value += sd * noise;
        }
    }

    log::trace!(
        "Drew {n_draws} {quantity} samples over {} rows (seed {seed})",
        at_rows.nrows()
    );
    Ok(mean)
}

/// The posterior-mode mean `g^-1(X beta_hat)`, one value per row. No sampling.
pub fn predict_mean<E: Expert + ?Sized>(
    expert: &E,
    at_rows: &FeatureFrame,
) -> Result<Array1<f64>, SamplingError> {
    expert.validate()?;
    let x = expert.design_matrix(at_rows)?;
    let link = expert.link();
    Ok(x.dot(&expert.coefficients().as_view()).mapv(|eta| link.inverse(eta)))
}

/// Standard deviation of Gaussian outcome noise: `sqrt(scale)`, or one when no
/// usable scale was estimated.
fn noise_sd(scale: Option<f64>) -> f64 {
    match scale {
        Some(s) if s > 0.0 => s.sqrt(),
        _ => 1.0,
    }
}

/// Factor `L` with `L L^T = V`, from the eigendecomposition of `V`.
fn covariance_factor(covariance: &Array2<f64>) -> Result<Array2<f64>, SamplingError> {
    if covariance.is_empty() {
        return Ok(covariance.clone());
    }
    let (eigenvalues, eigenvectors) = covariance.eigh(UPLO::Lower)?;
    let max_eigenvalue = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min_eigenvalue < -PSD_TOLERANCE * max_eigenvalue.max(1.0) {
        return Err(SamplingError::NotPositiveSemiDefinite {
            min_eigenvalue,
            max_eigenvalue,
        });
    }
    let root = eigenvalues.mapv(|l| l.max(0.0).sqrt());
    Ok(eigenvectors * &root.insert_axis(Axis(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DesignSpec, FittedExpert, LinkFunction, Term};
    use crate::schema::owned_columns;
    use crate::types::Coefficients;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn expert(distribution: Distribution, covariance: Array2<f64>) -> FittedExpert {
        FittedExpert {
            design: DesignSpec {
                features: owned_columns(&["x"]),
                terms: vec![
                    Term::Intercept,
                    Term::Linear {
                        feature: "x".to_string(),
                    },
                ],
            },
            coefficients: Coefficients::new(array![0.5, -1.0]),
            covariance,
            link: LinkFunction::canonical_for(distribution),
            distribution,
            scale: Some(0.25),
        }
    }

    fn rows() -> FeatureFrame {
        FeatureFrame::new(owned_columns(&["x"]), array![[0.0], [1.0], [2.0]]).unwrap()
    }

    #[test]
    fn same_seed_gives_identical_draws() {
        let e = expert(Distribution::Bernoulli, array![[0.04, 0.01], [0.01, 0.09]]);
        let a = sample(&e, &rows(), Quantity::Mean, 50, 42).unwrap();
        let b = sample(&e, &rows(), Quantity::Mean, 50, 42).unwrap();
        assert_eq!(a.shape(), &[50, 3]);
        assert_eq!(a, b);
        let c = sample(&e, &rows(), Quantity::Mean, 50, 43).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn coefficient_draws_are_reproducible_per_seed() {
        let e = expert(Distribution::Bernoulli, array![[0.04, 0.01], [0.01, 0.09]]);
        let a = sample(&e, &rows(), Quantity::Coefficients, 25, 42).unwrap();
        let b = sample(&e, &rows(), Quantity::Coefficients, 25, 42).unwrap();
        assert_eq!(a.shape(), &[25, 2]);
        assert_eq!(a, b);
        let c = sample(&e, &rows(), Quantity::Coefficients, 25, 43).unwrap();
        assert!(a.iter().zip(c.iter()).all(|(x, y)| x != y));
    }

    #[test]
    fn malformed_experts_are_rejected_instead_of_sampled() {
        let mut e = expert(Distribution::Bernoulli, Array2::eye(2));
        e.coefficients = Coefficients::new(array![0.5, -1.0, 2.0]);
        e.covariance = Array2::eye(3);
        assert!(matches!(
            sample(&e, &rows(), Quantity::Mean, 10, 1),
            Err(SamplingError::Model(ModelError::CoefficientCount {
                coefficients: 3,
                design: 2
            }))
        ));
        assert!(matches!(
            predict_mean(&e, &rows()),
            Err(SamplingError::Model(ModelError::CoefficientCount { .. }))
        ));
    }

    #[test]
    fn coefficient_draws_match_the_posterior_moments() {
        let covariance = array![[0.04, 0.01], [0.01, 0.09]];
        let e = expert(Distribution::Bernoulli, covariance.clone());
        let draws = sample(&e, &rows(), Quantity::Coefficients, 20_000, 7).unwrap();
        assert_eq!(draws.shape(), &[20_000, 2]);
        let mean = draws.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.5, epsilon = 0.01);
        assert_abs_diff_eq!(mean[1], -1.0, epsilon = 0.01);
        let centered = &draws - &mean.insert_axis(Axis(0));
        let empirical = centered.t().dot(&centered) / (draws.nrows() as f64 - 1.0);
        for (got, want) in empirical.iter().zip(covariance.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 0.005);
        }
    }

    #[test]
    fn zero_covariance_reproduces_the_point_prediction() {
        let e = expert(Distribution::Bernoulli, Array2::zeros((2, 2)));
        let draws = sample(&e, &rows(), Quantity::Mean, 4, 1).unwrap();
        let point = predict_mean(&e, &rows()).unwrap();
        for row in draws.rows() {
            for (a, b) in row.iter().zip(point.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(point[0], LinkFunction::Logit.inverse(0.5), epsilon = 1e-12);
    }

    #[test]
    fn response_noise_uses_the_scale() {
        let e = expert(Distribution::Gaussian, Array2::zeros((2, 2)));
        let draws = sample(&e, &rows(), Quantity::Response, 20_000, 3).unwrap();
        let column = draws.column(1);
        let mean = column.mean().unwrap();
        let var = column.mapv(|v| (v - mean).powi(2)).sum() / (column.len() as f64 - 1.0);
        assert_abs_diff_eq!(mean, -0.5, epsilon = 0.02);
        assert_abs_diff_eq!(var, 0.25, epsilon = 0.02);
    }

    #[test]
    fn missing_scale_falls_back_to_unit_noise() {
        assert_eq!(noise_sd(None), 1.0);
        assert_eq!(noise_sd(Some(0.0)), 1.0);
        assert_eq!(noise_sd(Some(4.0)), 2.0);
    }

    #[test]
    fn response_draws_are_rejected_for_bernoulli_experts() {
        let e = expert(Distribution::Bernoulli, Array2::eye(2));
        match sample(&e, &rows(), Quantity::Response, 10, 1).unwrap_err() {
            SamplingError::UnsupportedQuantity { quantity, .. } => {
                assert_eq!(quantity, Quantity::Response)
            }
            other => panic!("Expected UnsupportedQuantity, got {other:?}"),
        }
    }

    #[test]
    fn indefinite_covariance_is_rejected() {
        let e = expert(Distribution::Bernoulli, array![[1.0, 2.0], [2.0, 1.0]]);
        assert!(matches!(
            sample(&e, &rows(), Quantity::Mean, 10, 1),
            Err(SamplingError::NotPositiveSemiDefinite { .. })
        ));
    }

    #[test]
    fn tiny_negative_eigenvalues_are_tolerated() {
        // Rank-one matrix with rounding noise on the null direction.
        let covariance = array![[1.0, 1.0], [1.0, 1.0 - 1e-12]];
        let factor = covariance_factor(&covariance).unwrap();
        let rebuilt = factor.dot(&factor.t());
        for (a, b) in rebuilt.iter().zip(covariance.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_draws_is_an_error() {
        let e = expert(Distribution::Bernoulli, Array2::eye(2));
        assert!(matches!(
            sample(&e, &rows(), Quantity::Mean, 0, 1),
            Err(SamplingError::NoDraws)
        ));
    }
}
