//! Imputation of an absent laboratory marker from the other covariates.
//!
//! Each marker has its own expert, fit on the quantile-normal transform of the
//! observed values. Draws are made on that scale and mapped back to clinical units.

use crate::model::Expert;
use crate::sampler::{self, Quantity, SamplingError};
use crate::schema::{self, FeatureFrame, FeatureRow, Marker, SchemaError};
use crate::transform::{QuantileTransform, TransformError};
use thiserror::Error;

/// How a missing value is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImputationMode {
    /// `n_draws` plausible values from the posterior predictive distribution.
    Probabilistic { n_draws: usize },
    /// A single value at the posterior mode, with no randomness.
    PointEstimate,
}

#[derive(Error, Debug)]
pub enum ImputationError {
    #[error("{marker} imputation row does not match its expert: {source}")]
    Schema {
        marker: Marker,
        #[source]
        source: SchemaError,
    },

    #[error("Sampling the {marker} imputation expert failed: {source}")]
    Sampling {
        marker: Marker,
        #[source]
        source: SamplingError,
    },

    #[error("Mapping imputed {marker} back to clinical units failed: {source}")]
    Transform {
        marker: Marker,
        #[source]
        source: TransformError,
    },
}

/// The expert and transform that together impute one marker.
pub struct MarkerModel {
    marker: Marker,
    expert: Box<dyn Expert>,
    transform: QuantileTransform,
}

impl MarkerModel {
    pub fn new(marker: Marker, expert: Box<dyn Expert>, transform: QuantileTransform) -> Self {
        Self {
            marker,
            expert,
            transform,
        }
    }

    pub fn marker(&self) -> Marker {
        self.marker
    }

    pub fn expert(&self) -> &dyn Expert {
        self.expert.as_ref()
    }

    pub fn transform(&self) -> &QuantileTransform {
        &self.transform
    }

    /// Fills the marker for one case. `partial_row` must carry exactly the
    /// expert's feature schema, fully populated.
    ///
    /// Returns `n_draws` values in probabilistic mode and one value in point mode.
    pub fn impute(
        &self,
        partial_row: &FeatureRow,
        mode: ImputationMode,
        seed: u64,
    ) -> Result<Vec<f64>, ImputationError> {
        let marker = self.marker;
        let schema_error = |source| ImputationError::Schema { marker, source };
        let sampling_error = |source| ImputationError::Sampling { marker, source };

        schema::ensure_schema(self.expert.features(), partial_row.columns())
            .map_err(schema_error)?;
        let frame = FeatureFrame::from_rows(std::slice::from_ref(partial_row))
            .map_err(schema_error)?;

        let scores: Vec<f64> = match mode {
            ImputationMode::Probabilistic { n_draws } => {
                sampler::sample(self.expert.as_ref(), &frame, Quantity::Response, n_draws, seed)
                    .map_err(sampling_error)?
                    .column(0)
                    .to_vec()
            }
            ImputationMode::PointEstimate => {
                sampler::predict_mean(self.expert.as_ref(), &frame)
                    .map_err(sampling_error)?
                    .to_vec()
            }
        };

        let values = self
            .transform
            .invert(&scores)
            .map_err(|source| ImputationError::Transform { marker, source })?;
        log::debug!("Imputed {} value(s) for {marker}", values.len());
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DesignSpec, Distribution, FittedExpert, LinkFunction, Term};
    use crate::schema::owned_columns;
    use crate::types::Coefficients;
    use ndarray::{Array2, array};

    fn lactate_model(covariance: Array2<f64>) -> MarkerModel {
        let expert = FittedExpert {
            design: DesignSpec {
                features: owned_columns(&["age", "pulse"]),
                terms: vec![
                    Term::Intercept,
                    Term::Linear {
                        feature: "age".to_string(),
                    },
                ],
            },
            coefficients: Coefficients::new(array![-1.0, 0.02]),
            covariance,
            link: LinkFunction::Identity,
            distribution: Distribution::Gaussian,
            scale: Some(0.5),
        };
        let observed: Vec<f64> = (1..=200).map(|i| 0.3 + i as f64 * 0.09).collect();
        let transform = QuantileTransform::fit(&observed, 100).unwrap();
        MarkerModel::new(Marker::Lactate, Box::new(expert), transform)
    }

    fn partial_row() -> FeatureRow {
        FeatureRow::new(owned_columns(&["age", "pulse"]), vec![Some(50.0), Some(90.0)]).unwrap()
    }

    #[test]
    fn probabilistic_mode_returns_one_value_per_draw() {
        let model = lactate_model(Array2::eye(2) * 1e-4);
        let mode = ImputationMode::Probabilistic { n_draws: 10 };
        let values = model.impute(&partial_row(), mode, 11).unwrap();
        assert_eq!(values.len(), 10);
        let lower = model.transform().quantiles()[0];
        let upper = *model.transform().quantiles().last().unwrap();
        assert!(values.iter().all(|v| (lower..=upper).contains(v)));
        assert_eq!(values, model.impute(&partial_row(), mode, 11).unwrap());
        assert_ne!(values, model.impute(&partial_row(), mode, 12).unwrap());
    }

    #[test]
    fn point_mode_inverts_the_posterior_mode() {
        let model = lactate_model(Array2::eye(2));
        let values = model
            .impute(&partial_row(), ImputationMode::PointEstimate, 0)
            .unwrap();
        assert_eq!(values.len(), 1);
        // eta = -1 + 0.02 * 50 = 0, the transform's median.
        let median = model.transform().invert(&[0.0]).unwrap()[0];
        assert!((values[0] - median).abs() < 1e-12);
    }

    #[test]
    fn reordered_row_is_a_schema_mismatch() {
        let model = lactate_model(Array2::eye(2));
        let row = FeatureRow::new(owned_columns(&["pulse", "age"]), vec![Some(90.0), Some(50.0)])
            .unwrap();
        match model
            .impute(&row, ImputationMode::PointEstimate, 0)
            .unwrap_err()
        {
            ImputationError::Schema { marker, source } => {
                assert_eq!(marker, Marker::Lactate);
                assert!(matches!(source, SchemaError::Mismatch { .. }));
            }
            other => panic!("Expected a schema error, got {other:?}"),
        }
    }

    #[test]
    fn unpopulated_covariate_is_rejected() {
        let model = lactate_model(Array2::eye(2));
        let row = FeatureRow::new(owned_columns(&["age", "pulse"]), vec![Some(50.0), None])
            .unwrap();
        assert!(matches!(
            model.impute(&row, ImputationMode::PointEstimate, 0),
            Err(ImputationError::Schema {
                source: SchemaError::MissingValue { .. },
                ..
            })
        ));
    }
}
