//! Combines experts fit on separately imputed copies of the training data.
//!
//! Rubin's rules: the pooled coefficients are the mean over imputations and the
//! pooled covariance adds the between-imputation spread to the average
//! within-imputation covariance, `T = W + (1 + 1/k) B`.

use crate::model::{DesignSpec, Distribution, Expert, FittedExpert, LinkFunction, ModelError};
use crate::types::Coefficients;
use ndarray::{Array1, Array2, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Cannot pool an empty set of experts.")]
    Empty,

    #[error("Expert {index} is not a valid fitted expert: {source}")]
    InvalidExpert {
        index: usize,
        #[source]
        source: ModelError,
    },

    #[error("Expert {index} has a different design (features or terms) from the first expert.")]
    IncompatibleDesign { index: usize },

    #[error("Expert {index} uses the {found:?} link but the first expert uses {expected:?}.")]
    IncompatibleLink {
        index: usize,
        expected: LinkFunction,
        found: LinkFunction,
    },

    #[error("Expert {index} was fit under the {found} distribution but the first expert under {expected}.")]
    IncompatibleDistribution {
        index: usize,
        expected: Distribution,
        found: Distribution,
    },

    #[error("Expert {index} disagrees with the first expert on whether a dispersion scale was estimated.")]
    IncompatibleScale { index: usize },
}

/// An expert assembled from `k` imputation-specific fits.
#[derive(Debug, Clone)]
pub struct PooledExpert {
    design: DesignSpec,
    coefficients: Coefficients,
    covariance: Array2<f64>,
    link: LinkFunction,
    distribution: Distribution,
    scale: Option<f64>,
    within: Array2<f64>,
    between: Array2<f64>,
    n_imputations: usize,
}

impl PooledExpert {
    /// Mean within-imputation covariance `W`.
    pub fn within(&self) -> &Array2<f64> {
        &self.within
    }

    /// Between-imputation covariance `B` of the coefficient vectors.
    pub fn between(&self) -> &Array2<f64> {
        &self.between
    }

    pub fn n_imputations(&self) -> usize {
        self.n_imputations
    }

    /// Share of each coefficient's total variance due to missing data,
    /// `(1 + 1/k) B_jj / T_jj`. Zero where the total variance is zero.
    pub fn between_fraction(&self) -> Array1<f64> {
        let inflation = 1.0 + 1.0 / self.n_imputations as f64;
        Array1::from_iter((0..self.covariance.nrows()).map(|j| {
            let total = self.covariance[[j, j]];
            if total > 0.0 {
                inflation * self.between[[j, j]] / total
            } else {
                0.0
            }
        }))
    }
}

impl Expert for PooledExpert {
    fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    fn design(&self) -> &DesignSpec {
        &self.design
    }

    fn link(&self) -> LinkFunction {
        self.link
    }

    fn distribution(&self) -> Distribution {
        self.distribution
    }

    fn scale(&self) -> Option<f64> {
        self.scale
    }
}

/// Pools `k >= 1` experts that share a design, link and distribution.
///
/// The design, link, distribution and scale are taken from the first expert. Scales
/// must be present on all experts or none; differing values are logged and the
/// first is kept.
pub fn pool(mut experts: Vec<FittedExpert>) -> Result<PooledExpert, PoolError> {
    let first = experts.first().ok_or(PoolError::Empty)?;
    check_compatible(first, &experts)?;

    let k = experts.len();
    let p = first.coefficients.len();
    let mut stacked = Array2::<f64>::zeros((k, p));
    let mut within = Array2::<f64>::zeros((p, p));
    for (i, expert) in experts.iter().enumerate() {
        stacked.row_mut(i).assign(&expert.coefficients.as_view());
        within += &expert.covariance;
    }
    within /= k as f64;

    let mean = stacked
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(p));
    let between = if k > 1 {
        let centered = &stacked - &mean.view().insert_axis(Axis(0));
        centered.t().dot(&centered) / (k as f64 - 1.0)
    } else {
        Array2::zeros((p, p))
    };
    let covariance = &within + &(&between * (1.0 + 1.0 / k as f64));

    log::info!("Pooled {k} imputation experts with {p} coefficients each");

    let head = experts.swap_remove(0);
    Ok(PooledExpert {
        design: head.design,
        coefficients: Coefficients::new(mean),
        covariance,
        link: head.link,
        distribution: head.distribution,
        scale: head.scale,
        within,
        between,
        n_imputations: k,
    })
}

fn check_compatible(first: &FittedExpert, experts: &[FittedExpert]) -> Result<(), PoolError> {
    for (index, expert) in experts.iter().enumerate() {
        expert
            .validate()
            .map_err(|source| PoolError::InvalidExpert { index, source })?;
        if index == 0 {
            continue;
        }
        if expert.design != first.design {
            return Err(PoolError::IncompatibleDesign { index });
        }
        if expert.link != first.link {
            return Err(PoolError::IncompatibleLink {
                index,
                expected: first.link,
                found: expert.link,
            });
        }
        if expert.distribution != first.distribution {
            return Err(PoolError::IncompatibleDistribution {
                index,
                expected: first.distribution,
                found: expert.distribution,
            });
        }
        match (first.scale, expert.scale) {
            (Some(a), Some(b)) if a != b => log::warn!(
                "Expert {index} has dispersion scale {b} but the first expert has {a}; keeping {a}"
            ),
            (Some(_), None) | (None, Some(_)) => {
                return Err(PoolError::IncompatibleScale { index });
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Term;
    use crate::schema::owned_columns;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn expert(coefficients: Array1<f64>, covariance: Array2<f64>) -> FittedExpert {
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
            coefficients: Coefficients::new(coefficients),
            covariance,
            link: LinkFunction::Logit,
            distribution: Distribution::Bernoulli,
            scale: None,
        }
    }

    #[test]
    fn single_expert_keeps_its_covariance() {
        let covariance = array![[0.2, 0.05], [0.05, 0.1]];
        let pooled = pool(vec![expert(array![1.0, 2.0], covariance.clone())]).unwrap();
        assert_eq!(pooled.covariance(), &covariance);
        assert_eq!(pooled.coefficients().as_view(), array![1.0, 2.0].view());
        assert_eq!(pooled.between(), &Array2::<f64>::zeros((2, 2)));
        assert_eq!(pooled.n_imputations(), 1);
        assert_eq!(pooled.between_fraction(), array![0.0, 0.0]);
    }

    #[test]
    fn rubin_rules_combine_within_and_between() {
        let experts = vec![
            expert(array![1.0, 0.0], array![[0.1, 0.0], [0.0, 0.2]]),
            expert(array![3.0, 0.0], array![[0.3, 0.0], [0.0, 0.4]]),
        ];
        let pooled = pool(experts).unwrap();
        assert_eq!(pooled.coefficients().as_view(), array![2.0, 0.0].view());
        // W = diag(0.2, 0.3); B = diag(2, 0); T = W + 1.5 B.
        assert_abs_diff_eq!(pooled.within()[[0, 0]], 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.within()[[1, 1]], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.between()[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.covariance()[[0, 0]], 3.2, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.covariance()[[1, 1]], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.covariance()[[0, 1]], 0.0, epsilon = 1e-12);
        let fraction = pooled.between_fraction();
        assert_abs_diff_eq!(fraction[0], 3.0 / 3.2, epsilon = 1e-12);
        assert_abs_diff_eq!(fraction[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pooling_rejects_mismatched_experts() {
        assert!(matches!(pool(Vec::new()), Err(PoolError::Empty)));

        let a = expert(array![1.0, 0.0], Array2::eye(2));
        let mut b = a.clone();
        b.link = LinkFunction::Identity;
        assert!(matches!(
            pool(vec![a.clone(), b]),
            Err(PoolError::IncompatibleLink { index: 1, .. })
        ));

        let mut c = a.clone();
        c.design.features = owned_columns(&["x", "y"]);
        assert!(matches!(
            pool(vec![a.clone(), c]),
            Err(PoolError::IncompatibleDesign { index: 1 })
        ));

        let mut d = a.clone();
        d.distribution = Distribution::Gaussian;
        assert!(matches!(
            pool(vec![a.clone(), d]),
            Err(PoolError::IncompatibleDistribution { index: 1, .. })
        ));

        let mut e = a.clone();
        e.scale = Some(1.0);
        assert!(matches!(
            pool(vec![a, e]),
            Err(PoolError::IncompatibleScale { index: 1 })
        ));
    }

    #[test]
    fn first_scale_wins_when_values_differ() {
        let mut a = expert(array![1.0, 0.0], Array2::eye(2));
        a.link = LinkFunction::Identity;
        a.distribution = Distribution::Gaussian;
        a.scale = Some(2.0);
        let mut b = a.clone();
        b.scale = Some(3.0);
        let pooled = pool(vec![a, b]).unwrap();
        assert_eq!(pooled.scale(), Some(2.0));
    }
}
