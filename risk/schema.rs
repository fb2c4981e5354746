//! # Covariate Schema and Input Validation
//!
//! Every expert is fit against a fixed, named, ordered set of columns. This module
//! owns that contract:
//!
//! - `FeatureRow` is a single case whose optional markers may be absent.
//! - `FeatureFrame` is a complete numeric block handed to a design function. It can
//!   only be built from rows that share one schema and have no absent values.
//! - `CategoryAllowList` checks categorical codes against their declared sets and
//!   reports violations as a structured `ValidationError`.
//!
//! Columns are never reordered or dropped implicitly. Callers that need a subset
//! use `FeatureRow::select`, which fails on unknown names.

use itertools::Itertools;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const CT_PERFORMED: &str = "S02PreOpCTPerformed";
pub const SINUS_RHYTHM: &str = "S03ECG";
pub const AGE: &str = "S01AgeOnArrival";
pub const CREATININE: &str = "S03SerumCreatinine";
pub const SODIUM: &str = "S03Sodium";
pub const POTASSIUM: &str = "S03Potassium";
pub const UREA: &str = "S03Urea";
pub const WHITE_CELL_COUNT: &str = "S03WhiteCellCount";
pub const PULSE: &str = "S03Pulse";
pub const SYSTOLIC_BP: &str = "S03SystolicBloodPressure";
pub const GCS: &str = "S03GlasgowComaScore";
pub const ASA: &str = "S03ASAScore";
pub const CARDIAC: &str = "S03CardiacSigns";
pub const RESPIRATORY: &str = "S03RespiratorySigns";
pub const MALIGNANCY: &str = "S03DiagnosedMalignancy";
pub const SOILING: &str = "S03Pred_Peritsoil";
pub const INDICATION: &str = "Indication";
pub const ALBUMIN: &str = "S03PreOpLowestAlbumin";
pub const ALBUMIN_MISSING: &str = "S03PreOpLowestAlbumin_missing";
pub const LACTATE: &str = "S03PreOpArterialBloodLactate";
pub const LACTATE_MISSING: &str = "S03PreOpArterialBloodLactate_missing";

/// Predictors of the lactate and albumin imputation experts, in fitted order.
pub const IMPUTATION_COVARIATES: [&str; 17] = [
    CT_PERFORMED,
    SINUS_RHYTHM,
    AGE,
    CREATININE,
    SODIUM,
    POTASSIUM,
    UREA,
    WHITE_CELL_COUNT,
    PULSE,
    SYSTOLIC_BP,
    GCS,
    ASA,
    CARDIAC,
    RESPIRATORY,
    MALIGNANCY,
    SOILING,
    INDICATION,
];

/// Predictors of the mortality expert, in fitted order. The imputation covariates
/// come first, followed by each marker and its missingness indicator.
pub const MORTALITY_COVARIATES: [&str; 21] = [
    CT_PERFORMED,
    SINUS_RHYTHM,
    AGE,
    CREATININE,
    SODIUM,
    POTASSIUM,
    UREA,
    WHITE_CELL_COUNT,
    PULSE,
    SYSTOLIC_BP,
    GCS,
    ASA,
    CARDIAC,
    RESPIRATORY,
    MALIGNANCY,
    SOILING,
    INDICATION,
    ALBUMIN,
    ALBUMIN_MISSING,
    LACTATE,
    LACTATE_MISSING,
];

/// Converts a fixed column list into owned names, the form experts store.
pub fn owned_columns(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| (*c).to_string()).collect()
}

/// Human-readable label used in validation messages.
pub fn column_label(column: &str) -> &str {
    match column {
        ASA => "ASA",
        CARDIAC => "Cardiac Status",
        RESPIRATORY => "Respiratory Status",
        MALIGNANCY => "Malignancy",
        SOILING => "Peritoneal Soiling",
        GCS => "GCS",
        INDICATION => "Indication",
        ALBUMIN => "Albumin",
        LACTATE => "Lactate",
        other => other,
    }
}

/// One of the two covariates that may be absent at prediction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    Lactate,
    Albumin,
}

impl Marker {
    pub fn value_column(self) -> &'static str {
        match self {
            Marker::Lactate => LACTATE,
            Marker::Albumin => ALBUMIN,
        }
    }

    pub fn indicator_column(self) -> &'static str {
        match self {
            Marker::Lactate => LACTATE_MISSING,
            Marker::Albumin => ALBUMIN_MISSING,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(column_label(self.value_column()))
    }
}

/// Failures to line a row up with the schema an expert was fit on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Row has {columns} column names but {values} values.")]
    LengthMismatch { columns: usize, values: usize },

    #[error("Column '{0}' appears more than once in the row schema.")]
    DuplicateColumn(String),

    #[error("Column '{0}' is not part of the row schema.")]
    UnknownColumn(String),

    #[error("Column '{column}' has no value in row {row}; every column handed to an expert must be populated.")]
    MissingValue { column: String, row: usize },

    #[error(
        "Feature schema mismatch: expected [{}] but found [{}].",
        .expected.join(", "),
        .found.join(", ")
    )]
    Mismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Column '{column}' holds the non-finite value {value} in row {row}.")]
    NonFiniteValue {
        column: String,
        row: usize,
        value: f64,
    },

    #[error("Row {row} does not share the schema of the first row in the frame.")]
    InconsistentRows { row: usize },

    #[error("A feature frame needs at least one row.")]
    EmptyFrame,

    #[error("Feature matrix has {found} columns but the schema names {expected}.")]
    WidthMismatch { expected: usize, found: usize },
}

/// Checks that `found` is exactly `expected`, names and order.
pub fn ensure_schema(expected: &[String], found: &[String]) -> Result<(), SchemaError> {
    if expected == found {
        Ok(())
    } else {
        Err(SchemaError::Mismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}

/// A single case in a named column order. `None` marks an absent value.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    columns: Vec<String>,
    values: Vec<Option<f64>>,
}

impl FeatureRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<f64>>) -> Result<Self, SchemaError> {
        if columns.len() != values.len() {
            return Err(SchemaError::LengthMismatch {
                columns: columns.len(),
                values: values.len(),
            });
        }
        if let Some(duplicate) = columns.iter().duplicates().next() {
            return Err(SchemaError::DuplicateColumn(duplicate.clone()));
        }
        Ok(Self { columns, values })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// The value in `column`, or `None` when the column is absent or unknown.
    pub fn get(&self, column: &str) -> Option<f64> {
        self.position(column).and_then(|i| self.values[i])
    }

    pub fn is_missing(&self, column: &str) -> bool {
        self.get(column).is_none()
    }

    /// Fails on the first present value that is NaN or infinite.
    pub fn ensure_finite(&self) -> Result<(), SchemaError> {
        match self.iter().find(|(_, v)| v.is_some_and(|v| !v.is_finite())) {
            Some((column, Some(value))) => Err(SchemaError::NonFiniteValue {
                column: column.to_string(),
                row: 0,
                value,
            }),
            _ => Ok(()),
        }
    }

    pub fn set(&mut self, column: &str, value: Option<f64>) -> Result<(), SchemaError> {
        let idx = self
            .position(column)
            .ok_or_else(|| SchemaError::UnknownColumn(column.to_string()))?;
        self.values[idx] = value;
        Ok(())
    }

    /// Builds a row holding exactly `columns`, in that order.
    pub fn select(&self, columns: &[&str]) -> Result<FeatureRow, SchemaError> {
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let idx = self
                .position(column)
                .ok_or_else(|| SchemaError::UnknownColumn((*column).to_string()))?;
            values.push(self.values[idx]);
        }
        FeatureRow::new(owned_columns(columns), values)
    }

    /// A row with the same schema whose values are `f(column, value)`.
    pub fn map_values<F>(&self, mut f: F) -> FeatureRow
    where
        F: FnMut(&str, Option<f64>) -> Option<f64>,
    {
        let values = self.iter().map(|(column, value)| f(column, value)).collect();
        FeatureRow {
            columns: self.columns.clone(),
            values,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> + '_ {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// A complete block of rows sharing one schema, ready for a design function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureFrame {
    columns: Vec<String>,
    data: Array2<f64>,
}

impl FeatureFrame {
    pub fn new(columns: Vec<String>, data: Array2<f64>) -> Result<Self, SchemaError> {
        if data.ncols() != columns.len() {
            return Err(SchemaError::WidthMismatch {
                expected: columns.len(),
                found: data.ncols(),
            });
        }
        Ok(Self { columns, data })
    }

    /// Stacks rows into a frame. Every row must carry the first row's schema and
    /// every value must be present and finite.
    pub fn from_rows(rows: &[FeatureRow]) -> Result<Self, SchemaError> {
        let first = rows.first().ok_or(SchemaError::EmptyFrame)?;
        let columns = first.columns.clone();
        let mut data = Array2::zeros((rows.len(), columns.len()));
        for (i, row) in rows.iter().enumerate() {
            if row.columns != columns {
                return Err(SchemaError::InconsistentRows { row: i });
            }
            for (j, value) in row.values.iter().enumerate() {
                let value = value.ok_or_else(|| SchemaError::MissingValue {
                    column: columns[j].clone(),
                    row: i,
                })?;
                if !value.is_finite() {
                    return Err(SchemaError::NonFiniteValue {
                        column: columns[j].clone(),
                        row: i,
                        value,
                    });
                }
                data[[i, j]] = value;
            }
        }
        Ok(Self { columns, data })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, SchemaError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.to_string()))?;
        Ok(self.data.column(idx))
    }
}

/// A case as supplied by a caller, with clinical field names.
///
/// Categorical covariates are carried as their numeric codes so that the allow-list
/// check can report the offending value verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseInput {
    pub ct_performed: bool,
    pub sinus_rhythm: bool,
    pub age: f64,
    pub creatinine: f64,
    pub sodium: f64,
    pub potassium: f64,
    pub urea: f64,
    pub white_cell_count: f64,
    pub heart_rate: f64,
    pub systolic_bp: f64,
    pub gcs: f64,
    pub asa: f64,
    pub cardiac: f64,
    pub respiratory: f64,
    pub malignancy: f64,
    pub soiling: f64,
    pub indication: f64,
    #[serde(default)]
    pub albumin: Option<f64>,
    #[serde(default)]
    pub lactate: Option<f64>,
}

impl CaseInput {
    /// Lays the case out in mortality-schema order. Each missingness indicator is
    /// derived from whether its marker was supplied; non-finite markers count as absent.
    pub fn to_feature_row(&self) -> FeatureRow {
        let flag = |present: bool| if present { 1.0 } else { 0.0 };
        let albumin = self.albumin.filter(|v| v.is_finite());
        let lactate = self.lactate.filter(|v| v.is_finite());
        let values = vec![
            Some(flag(self.ct_performed)),
            Some(flag(self.sinus_rhythm)),
            Some(self.age),
            Some(self.creatinine),
            Some(self.sodium),
            Some(self.potassium),
            Some(self.urea),
            Some(self.white_cell_count),
            Some(self.heart_rate),
            Some(self.systolic_bp),
            Some(self.gcs),
            Some(self.asa),
            Some(self.cardiac),
            Some(self.respiratory),
            Some(self.malignancy),
            Some(self.soiling),
            Some(self.indication),
            albumin,
            Some(flag(albumin.is_none())),
            lactate,
            Some(flag(lactate.is_none())),
        ];
        FeatureRow {
            columns: owned_columns(&MORTALITY_COVARIATES),
            values,
        }
    }
}

/// How a validation failure should be surfaced by a request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorStatus {
    /// A required field was not supplied.
    BadRequest,
    /// A field was supplied but its code is not in the declared set.
    Unprocessable,
}

impl ErrorStatus {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorStatus::BadRequest => 400,
            ErrorStatus::Unprocessable => 422,
        }
    }
}

/// A categorical covariate failed its allow-list check. No prediction is made.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ValidationError {
    pub field: String,
    pub value: Option<f64>,
    pub allowed: Vec<f64>,
    pub status: ErrorStatus,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, value: Option<f64>, allowed: &[f64]) -> Self {
        let allowed_text = allowed.iter().map(|code| format_code(*code)).join(", ");
        let (status, message) = match value {
            Some(v) => (
                ErrorStatus::Unprocessable,
                format!(
                    "Invalid {} : {}. Must be one of ({allowed_text})",
                    column_label(field),
                    format_code(v)
                ),
            ),
            None => (
                ErrorStatus::BadRequest,
                format!(
                    "Missing {}. Must be one of ({allowed_text})",
                    column_label(field)
                ),
            ),
        };
        Self {
            field: field.to_string(),
            value,
            allowed: allowed.to_vec(),
            status,
            message,
        }
    }
}

fn format_code(code: f64) -> String {
    if code.fract() == 0.0 && code.abs() < 1e15 {
        format!("{}", code as i64)
    } else {
        format!("{code}")
    }
}

/// Declared code sets for every categorical covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryAllowList(pub BTreeMap<String, Vec<f64>>);

impl CategoryAllowList {
    /// Code sets the reference mortality model was trained with.
    pub fn reference() -> Self {
        let binary_severity = vec![1.0, 2.0, 4.0, 8.0];
        let mut codes = BTreeMap::new();
        codes.insert(ASA.to_string(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        codes.insert(CARDIAC.to_string(), binary_severity.clone());
        codes.insert(RESPIRATORY.to_string(), binary_severity.clone());
        codes.insert(MALIGNANCY.to_string(), binary_severity.clone());
        codes.insert(SOILING.to_string(), binary_severity);
        codes.insert(GCS.to_string(), (3..=15).map(f64::from).collect());
        codes.insert(INDICATION.to_string(), (0..=13).map(f64::from).collect());
        Self(codes)
    }

    pub fn allowed(&self, column: &str) -> Option<&[f64]> {
        self.0.get(column).map(Vec::as_slice)
    }

    /// Checks every listed categorical column of `row`, in row order, and reports
    /// the first violation.
    pub fn validate(&self, row: &FeatureRow) -> Result<(), ValidationError> {
        for (column, value) in row.iter() {
            if let Some(allowed) = self.allowed(column) {
                check_code(column, value, allowed)?;
            }
        }
        for (column, allowed) in &self.0 {
            if row.position(column).is_none() {
                return Err(ValidationError::new(column, None, allowed));
            }
        }
        Ok(())
    }
}

fn check_code(column: &str, value: Option<f64>, allowed: &[f64]) -> Result<(), ValidationError> {
    match value {
        Some(v) if allowed.contains(&v) => Ok(()),
        other => Err(ValidationError::new(column, other, allowed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case() -> CaseInput {
        CaseInput {
            ct_performed: true,
            sinus_rhythm: false,
            age: 40.0,
            creatinine: 80.0,
            sodium: 135.0,
            potassium: 4.1,
            urea: 6.0,
            white_cell_count: 13.0,
            heart_rate: 87.0,
            systolic_bp: 120.0,
            gcs: 15.0,
            asa: 3.0,
            cardiac: 1.0,
            respiratory: 2.0,
            malignancy: 2.0,
            soiling: 2.0,
            indication: 1.0,
            albumin: Some(40.0),
            lactate: None,
        }
    }

    #[test]
    fn feature_row_follows_mortality_order_and_derives_indicators() {
        let row = case().to_feature_row();
        assert_eq!(row.columns(), owned_columns(&MORTALITY_COVARIATES).as_slice());
        assert_eq!(row.get(CT_PERFORMED), Some(1.0));
        assert_eq!(row.get(SINUS_RHYTHM), Some(0.0));
        assert_eq!(row.get(ALBUMIN), Some(40.0));
        assert_eq!(row.get(ALBUMIN_MISSING), Some(0.0));
        assert!(row.is_missing(LACTATE));
        assert_eq!(row.get(LACTATE_MISSING), Some(1.0));
    }

    #[test]
    fn non_finite_markers_count_as_absent() {
        let mut input = case();
        input.albumin = Some(f64::NAN);
        let row = input.to_feature_row();
        assert!(row.is_missing(ALBUMIN));
        assert_eq!(row.get(ALBUMIN_MISSING), Some(1.0));
    }

    #[test]
    fn select_keeps_requested_order_and_rejects_unknown_columns() {
        let row = case().to_feature_row();
        let subset = row.select(&[AGE, CT_PERFORMED]).unwrap();
        assert_eq!(subset.columns(), &[AGE.to_string(), CT_PERFORMED.to_string()]);
        assert_eq!(subset.values(), &[Some(40.0), Some(1.0)]);

        match row.select(&["Height"]).unwrap_err() {
            SchemaError::UnknownColumn(name) => assert_eq!(name, "Height"),
            other => panic!("Expected UnknownColumn, got {other:?}"),
        }
    }

    #[test]
    fn frame_requires_every_value() {
        let row = case().to_feature_row();
        match FeatureFrame::from_rows(&[row]).unwrap_err() {
            SchemaError::MissingValue { column, row } => {
                assert_eq!(column, LACTATE);
                assert_eq!(row, 0);
            }
            other => panic!("Expected MissingValue, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_covariates_are_rejected() {
        let mut input = case();
        input.creatinine = f64::NAN;
        input.lactate = Some(1.5);
        let row = input.to_feature_row();
        match row.ensure_finite().unwrap_err() {
            SchemaError::NonFiniteValue { column, .. } => assert_eq!(column, CREATININE),
            other => panic!("Expected NonFiniteValue, got {other:?}"),
        }
        match FeatureFrame::from_rows(&[row]).unwrap_err() {
            SchemaError::NonFiniteValue { column, row, .. } => {
                assert_eq!(column, CREATININE);
                assert_eq!(row, 0);
            }
            other => panic!("Expected NonFiniteValue, got {other:?}"),
        }

        input.creatinine = 80.0;
        input.heart_rate = f64::INFINITY;
        assert!(matches!(
            input.to_feature_row().ensure_finite(),
            Err(SchemaError::NonFiniteValue { .. })
        ));
        assert!(case().to_feature_row().ensure_finite().is_ok());
    }

    #[test]
    fn frame_rejects_rows_with_different_schemas() {
        let row = case().to_feature_row();
        let first = row.select(&[AGE, UREA]).unwrap();
        let second = row.select(&[UREA, AGE]).unwrap();
        assert_eq!(
            FeatureFrame::from_rows(&[first, second]).unwrap_err(),
            SchemaError::InconsistentRows { row: 1 }
        );
        assert_eq!(FeatureFrame::from_rows(&[]).unwrap_err(), SchemaError::EmptyFrame);
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = FeatureRow::new(
            vec![AGE.to_string(), AGE.to_string()],
            vec![Some(1.0), Some(2.0)],
        )
        .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateColumn(AGE.to_string()));
    }

    #[test]
    fn reference_allow_list_accepts_valid_codes() {
        let allow = CategoryAllowList::reference();
        assert!(allow.validate(&case().to_feature_row()).is_ok());
    }

    #[test]
    fn invalid_code_reports_field_value_and_allowed_set() {
        let mut input = case();
        input.soiling = 7.0;
        let err = CategoryAllowList::reference()
            .validate(&input.to_feature_row())
            .unwrap_err();
        assert_eq!(err.field, SOILING);
        assert_eq!(err.value, Some(7.0));
        assert_eq!(err.allowed, vec![1.0, 2.0, 4.0, 8.0]);
        assert_eq!(err.status, ErrorStatus::Unprocessable);
        assert_eq!(err.status.status_code(), 422);
        assert_eq!(
            err.to_string(),
            "Invalid Peritoneal Soiling : 7. Must be one of (1, 2, 4, 8)"
        );
    }

    #[test]
    fn absent_categorical_column_is_a_bad_request() {
        let row = case().to_feature_row().select(&[AGE, ASA]).unwrap();
        let err = CategoryAllowList::reference().validate(&row).unwrap_err();
        assert_eq!(err.status, ErrorStatus::BadRequest);
        assert_eq!(err.value, None);
    }
}
