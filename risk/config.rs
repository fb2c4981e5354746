use crate::transform::DEFAULT_QUANTILE_COUNT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write engine configuration: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML engine configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize engine configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Configuration value '{0}' must be at least {1}.")]
    TooSmall(&'static str, usize),
}

/// Draw counts for one prediction. Fields missing from a TOML file keep their
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Mortality draws when both markers were observed.
    pub direct_draws: usize,
    /// Completions drawn for each missing marker.
    pub imputation_draws: usize,
    /// Knot cap used when a transform is fit from raw observations.
    pub transform_quantiles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            direct_draws: 1000,
            imputation_draws: 10,
            transform_quantiles: DEFAULT_QUANTILE_COUNT,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("direct_draws", self.direct_draws, 1),
            ("imputation_draws", self.imputation_draws, 1),
            ("transform_quantiles", self.transform_quantiles, 2),
        ];
        for (name, value, minimum) in checks {
            if value < minimum {
                return Err(ConfigError::TooSmall(name, minimum));
            }
        }
        Ok(())
    }

    /// Mortality draws per completed row on the imputation path, scaled so the
    /// path yields at least `direct_draws` samples in total.
    pub fn imputed_row_draws(&self) -> usize {
        self.direct_draws.div_ceil(self.imputation_draws.max(1))
    }

    /// Total mortality draws on the imputation path.
    pub fn imputed_total_draws(&self) -> usize {
        self.imputation_draws * self.imputed_row_draws()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}
