//! Clamping of continuous covariates to the bounds used when the experts were fit.

use crate::schema::{self, FeatureRow};
use crate::transform::quantile_sorted;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WinsorError {
    #[error("Winsorization bounds for '{column}' are unusable: low {low}, high {high}.")]
    InvalidBounds { column: String, low: f64, high: f64 },

    #[error("Quantiles must satisfy 0 <= lower <= upper <= 1, got {lower} and {upper}.")]
    InvalidQuantiles { lower: f64, upper: f64 },

    #[error("Cannot learn winsorization bounds without finite observations.")]
    NoObservations,
}

pub type BoundsTable = BTreeMap<String, [f64; 2]>;

/// Per-column `[low, high]` clamping bounds. Deserialized tables are validated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "BoundsTable", into = "BoundsTable")]
pub struct WinsorThresholds(BoundsTable);

impl TryFrom<BoundsTable> for WinsorThresholds {
    type Error = WinsorError;

    fn try_from(bounds: BoundsTable) -> Result<Self, Self::Error> {
        Self::new(bounds)
    }
}

impl From<WinsorThresholds> for BoundsTable {
    fn from(thresholds: WinsorThresholds) -> Self {
        thresholds.0
    }
}

impl WinsorThresholds {
    pub fn new(bounds: BoundsTable) -> Result<Self, WinsorError> {
        let thresholds = Self(bounds);
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Bounds applied to the reference mortality model's continuous covariates.
    pub fn reference_table() -> Self {
        let table = [
            (schema::AGE, [18.0, 96.0]),
            (schema::CREATININE, [20.0, 758.775]),
            (schema::SODIUM, [115.0, 157.0]),
            (schema::POTASSIUM, [2.3, 7.0]),
            (schema::UREA, [1.0, 49.4452]),
            (schema::WHITE_CELL_COUNT, [0.7, 143.0]),
            (schema::PULSE, [45.0, 173.259]),
            (schema::SYSTOLIC_BP, [60.0, 214.0]),
            (schema::ALBUMIN, [3.9712, 73.0]),
            (schema::LACTATE, [0.3, 19.0]),
        ];
        Self(
            table
                .into_iter()
                .map(|(column, bounds)| (column.to_string(), bounds))
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<(), WinsorError> {
        for (column, &[low, high]) in &self.0 {
            if !low.is_finite() || !high.is_finite() || low > high {
                return Err(WinsorError::InvalidBounds {
                    column: column.clone(),
                    low,
                    high,
                });
            }
        }
        Ok(())
    }

    pub fn bounds(&self, column: &str) -> Option<(f64, f64)> {
        self.0.get(column).map(|&[low, high]| (low, high))
    }

    pub fn insert(&mut self, column: &str, low: f64, high: f64) -> Result<(), WinsorError> {
        if !low.is_finite() || !high.is_finite() || low > high {
            return Err(WinsorError::InvalidBounds {
                column: column.to_string(),
                low,
                high,
            });
        }
        self.0.insert(column.to_string(), [low, high]);
        Ok(())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    /// Clamps every present value that has bounds. Absent values and unlisted
    /// columns pass through untouched.
    pub fn winsorize(&self, row: &FeatureRow) -> FeatureRow {
        row.map_values(|column, value| match (value, self.bounds(column)) {
            (Some(v), Some((low, high))) => {
                let bounded = v.clamp(low, high);
                if bounded != v {
                    log::debug!("Winsorized {column} from {v} to {bounded}");
                }
                Some(bounded)
            }
            _ => value,
        })
    }
}

/// Learns `(low, high)` bounds from training values at the given quantiles.
/// Non-finite values are ignored.
pub fn fit_bounds(
    values: &[f64],
    lower_quantile: f64,
    upper_quantile: f64,
) -> Result<(f64, f64), WinsorError> {
    if !(0.0..=1.0).contains(&lower_quantile)
        || !(0.0..=1.0).contains(&upper_quantile)
        || lower_quantile > upper_quantile
    {
        return Err(WinsorError::InvalidQuantiles {
            lower: lower_quantile,
            upper: upper_quantile,
        });
    }
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Err(WinsorError::NoObservations);
    }
    sorted.sort_by(f64::total_cmp);
    Ok((
        quantile_sorted(&sorted, lower_quantile),
        quantile_sorted(&sorted, upper_quantile),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AGE, ALBUMIN, ASA, CREATININE, owned_columns};

    fn row(creatinine: f64, albumin: Option<f64>) -> FeatureRow {
        FeatureRow::new(
            owned_columns(&[AGE, CREATININE, ASA, ALBUMIN]),
            vec![Some(12.0), Some(creatinine), Some(3.0), albumin],
        )
        .unwrap()
    }

    #[test]
    fn values_clamp_to_their_bounds() {
        let thresholds = WinsorThresholds::reference_table();
        let clamped = thresholds.winsorize(&row(5000.0, Some(30.0)));
        assert_eq!(clamped.get(AGE), Some(18.0));
        assert_eq!(clamped.get(CREATININE), Some(758.775));
        assert_eq!(clamped.get(ASA), Some(3.0));
        assert_eq!(clamped.get(ALBUMIN), Some(30.0));
    }

    #[test]
    fn absent_values_pass_through() {
        let thresholds = WinsorThresholds::reference_table();
        let clamped = thresholds.winsorize(&row(80.0, None));
        assert!(clamped.is_missing(ALBUMIN));
    }

    #[test]
    fn winsorize_is_idempotent() {
        let thresholds = WinsorThresholds::reference_table();
        for creatinine in [-10.0, 20.0, 300.0, 758.775, 1e9] {
            let once = thresholds.winsorize(&row(creatinine, Some(100.0)));
            let twice = thresholds.winsorize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let thresholds = WinsorThresholds::reference_table();
        let clamped = thresholds.winsorize(&row(20.0, Some(73.0)));
        assert_eq!(clamped.get(CREATININE), Some(20.0));
        assert_eq!(clamped.get(ALBUMIN), Some(73.0));
    }

    #[test]
    fn learned_bounds_follow_the_quantiles() {
        let values: Vec<f64> = (0..=100).map(f64::from).chain([f64::NAN]).collect();
        let (low, high) = fit_bounds(&values, 0.01, 0.99).unwrap();
        assert!((low - 1.0).abs() < 1e-9);
        assert!((high - 99.0).abs() < 1e-9);
        assert!(matches!(
            fit_bounds(&values, 0.9, 0.1),
            Err(WinsorError::InvalidQuantiles { .. })
        ));
        assert!(matches!(
            fit_bounds(&[f64::NAN], 0.1, 0.9),
            Err(WinsorError::NoObservations)
        ));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let mut bounds = BTreeMap::new();
        bounds.insert(AGE.to_string(), [96.0, 18.0]);
        assert!(matches!(
            WinsorThresholds::new(bounds),
            Err(WinsorError::InvalidBounds { .. })
        ));
        let mut thresholds = WinsorThresholds::default();
        assert!(thresholds.insert(AGE, 18.0, f64::INFINITY).is_err());
        thresholds.insert(AGE, 18.0, 96.0).unwrap();
        assert_eq!(thresholds.bounds(AGE), Some((18.0, 96.0)));
        assert_eq!(thresholds.columns().collect::<Vec<_>>(), vec![AGE]);
    }
}
