//! # Model Assets
//!
//! The read-only context a prediction runs against: the mortality expert, one
//! imputation model per marker, the category allow-lists and the winsorization
//! thresholds. Assets are built once, checked against the covariate schema, and
//! then shared by reference across any number of concurrent predictions.
//!
//! `AssetBundle` is the TOML form. Each expert is shipped as one or more
//! imputation-specific fits; several fits are pooled at load time.

use crate::config::EngineConfig;
use crate::impute::MarkerModel;
use crate::model::{Distribution, Expert, FittedExpert, LinkFunction, ModelError};
use crate::pool::{self, PoolError};
use crate::schema::{
    self, CategoryAllowList, IMPUTATION_COVARIATES, MORTALITY_COVARIATES, Marker, SchemaError,
};
use crate::transform::{QuantileTransform, TransformError};
use crate::winsor::WinsorThresholds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Failed to read or write asset bundle: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML asset bundle: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize asset bundle to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("The {role} expert lists no fitted imputations.")]
    NoExperts { role: &'static str },

    #[error("The {role} expert is invalid: {source}")]
    InvalidExpert {
        role: &'static str,
        #[source]
        source: ModelError,
    },

    #[error("The {role} imputation experts cannot be pooled: {source}")]
    Pooling {
        role: &'static str,
        #[source]
        source: PoolError,
    },

    #[error("The {role} expert was not fit on the expected covariates: {source}")]
    Schema {
        role: &'static str,
        #[source]
        source: SchemaError,
    },

    #[error("The {role} expert must use the {expected} distribution, found {found}.")]
    WrongDistribution {
        role: &'static str,
        expected: Distribution,
        found: Distribution,
    },

    #[error("The mortality expert must use the logit link, found {0:?}.")]
    WrongLink(LinkFunction),

    #[error("The imputation model supplied for {expected} imputes {found}.")]
    WrongMarker { expected: Marker, found: Marker },

    #[error("The {marker} transform could not be built: {source}")]
    Transform {
        marker: Marker,
        #[source]
        source: TransformError,
    },

    #[error("Column '{column}' in the {table} table is not a mortality covariate.")]
    UnknownColumn { table: &'static str, column: String },

    #[error("The allow-list for '{0}' is empty.")]
    EmptyAllowList(String),
}

/// Everything a prediction needs, validated and immutable.
pub struct ModelAssets {
    mortality: Box<dyn Expert>,
    lactate: MarkerModel,
    albumin: MarkerModel,
    categories: CategoryAllowList,
    winsor: WinsorThresholds,
}

impl ModelAssets {
    pub fn new(
        mortality: Box<dyn Expert>,
        lactate: MarkerModel,
        albumin: MarkerModel,
        categories: CategoryAllowList,
        winsor: WinsorThresholds,
    ) -> Result<Self, AssetError> {
        check_mortality(mortality.as_ref())?;
        check_marker(&lactate, Marker::Lactate)?;
        check_marker(&albumin, Marker::Albumin)?;
        for (column, allowed) in &categories.0 {
            check_known_column("category", column)?;
            if allowed.is_empty() {
                return Err(AssetError::EmptyAllowList(column.clone()));
            }
        }
        for column in winsor.columns() {
            check_known_column("winsorization", column)?;
        }
        Ok(Self {
            mortality,
            lactate,
            albumin,
            categories,
            winsor,
        })
    }

    /// Reads a TOML bundle and builds the assets from it.
    pub fn load(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self, AssetError> {
        let path = path.as_ref();
        let assets = AssetBundle::load(path)?.into_assets(config)?;
        log::info!("Loaded model assets from {}", path.display());
        Ok(assets)
    }

    pub fn mortality(&self) -> &dyn Expert {
        self.mortality.as_ref()
    }

    pub fn marker_model(&self, marker: Marker) -> &MarkerModel {
        match marker {
            Marker::Lactate => &self.lactate,
            Marker::Albumin => &self.albumin,
        }
    }

    pub fn categories(&self) -> &CategoryAllowList {
        &self.categories
    }

    pub fn winsor(&self) -> &WinsorThresholds {
        &self.winsor
    }
}

fn check_mortality(expert: &dyn Expert) -> Result<(), AssetError> {
    let role = "mortality";
    expert
        .validate()
        .map_err(|source| AssetError::InvalidExpert { role, source })?;
    let expected = schema::owned_columns(&MORTALITY_COVARIATES);
    schema::ensure_schema(&expected, expert.features())
        .map_err(|source| AssetError::Schema { role, source })?;
    if expert.distribution() != Distribution::Bernoulli {
        return Err(AssetError::WrongDistribution {
            role,
            expected: Distribution::Bernoulli,
            found: expert.distribution(),
        });
    }
    if expert.link() != LinkFunction::Logit {
        return Err(AssetError::WrongLink(expert.link()));
    }
    Ok(())
}

fn check_marker(model: &MarkerModel, expected: Marker) -> Result<(), AssetError> {
    if model.marker() != expected {
        return Err(AssetError::WrongMarker {
            expected,
            found: model.marker(),
        });
    }
    let role = marker_role(expected);
    model
        .expert()
        .validate()
        .map_err(|source| AssetError::InvalidExpert { role, source })?;
    let columns = schema::owned_columns(&IMPUTATION_COVARIATES);
    schema::ensure_schema(&columns, model.expert().features())
        .map_err(|source| AssetError::Schema { role, source })?;
    let found = model.expert().distribution();
    if found != Distribution::Gaussian {
        return Err(AssetError::WrongDistribution {
            role,
            expected: Distribution::Gaussian,
            found,
        });
    }
    Ok(())
}

fn check_known_column(table: &'static str, column: &str) -> Result<(), AssetError> {
    if MORTALITY_COVARIATES.contains(&column) {
        Ok(())
    } else {
        Err(AssetError::UnknownColumn {
            table,
            column: column.to_string(),
        })
    }
}

fn marker_role(marker: Marker) -> &'static str {
    match marker {
        Marker::Lactate => "lactate",
        Marker::Albumin => "albumin",
    }
}

// --- Serialized form ---

/// One expert as fit on each imputed copy of the training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertSource {
    pub imputations: Vec<FittedExpert>,
}

impl ExpertSource {
    /// A single fit is used as is; several are pooled with Rubin's rules.
    pub fn build(self, role: &'static str) -> Result<Box<dyn Expert>, AssetError> {
        let mut imputations = self.imputations;
        match imputations.len() {
            0 => Err(AssetError::NoExperts { role }),
            1 => {
                let expert = imputations.remove(0);
                expert
                    .validate()
                    .map_err(|source| AssetError::InvalidExpert { role, source })?;
                Ok(Box::new(expert))
            }
            k => {
                log::info!("Pooling {k} {role} imputation experts");
                let pooled = pool::pool(imputations)
                    .map_err(|source| AssetError::Pooling { role, source })?;
                Ok(Box::new(pooled))
            }
        }
    }
}

/// A marker transform, either as saved knots or as the raw observations to fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformSource {
    Fitted(QuantileTransform),
    Observed { observed: Vec<f64> },
}

impl TransformSource {
    pub fn build(self, n_quantiles: usize) -> Result<QuantileTransform, TransformError> {
        match self {
            TransformSource::Fitted(transform) => Ok(transform),
            TransformSource::Observed { observed } => QuantileTransform::fit(&observed, n_quantiles),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSource {
    pub expert: ExpertSource,
    pub transform: TransformSource,
}

impl MarkerSource {
    fn build(self, marker: Marker, config: &EngineConfig) -> Result<MarkerModel, AssetError> {
        let expert = self.expert.build(marker_role(marker))?;
        let transform = self
            .transform
            .build(config.transform_quantiles)
            .map_err(|source| AssetError::Transform { marker, source })?;
        Ok(MarkerModel::new(marker, expert, transform))
    }
}

/// TOML form of `ModelAssets`. Missing tables fall back to the reference
/// allow-lists and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBundle {
    #[serde(default = "CategoryAllowList::reference")]
    pub categories: CategoryAllowList,
    #[serde(default = "WinsorThresholds::reference_table")]
    pub winsor: WinsorThresholds,
    pub mortality: ExpertSource,
    pub lactate: MarkerSource,
    pub albumin: MarkerSource,
}

impl AssetBundle {
    pub fn into_assets(self, config: &EngineConfig) -> Result<ModelAssets, AssetError> {
        let mortality = self.mortality.build("mortality")?;
        let lactate = self.lactate.build(Marker::Lactate, config)?;
        let albumin = self.albumin.build(Marker::Albumin, config)?;
        ModelAssets::new(mortality, lactate, albumin, self.categories, self.winsor)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AssetError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AssetError> {
        let toml_string = fs::read_to_string(path)?;
        let bundle = toml::from_str(&toml_string)?;
        Ok(bundle)
    }
}
