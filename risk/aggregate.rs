//! # Risk Aggregation
//!
//! Turns one case into a distribution of mortality risk. A request moves through
//!
//! ```text
//! Received -> Validated -> DirectPredict    -> Pooled -> Summarized -> Done
//!                       \-> ImputeThenPredict -/
//! ```
//!
//! and ends in `Failed` if validation or any numerical step fails. When both
//! markers were measured the mortality expert is sampled directly. Otherwise each
//! missing marker is imputed a few times, the completions are paired by position,
//! and every completed row is scored. All draws for a request derive from its seed.

use crate::assets::ModelAssets;
use crate::config::{ConfigError, EngineConfig};
use crate::impute::{ImputationError, ImputationMode};
use crate::sampler::{self, Quantity, SamplingError};
use crate::schema::{
    CaseInput, FeatureFrame, FeatureRow, IMPUTATION_COVARIATES, Marker, SchemaError,
    ValidationError,
};
use crate::transform::quantile_sorted;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// XXH3 seed for identifier hashing. XXH3 output is fixed across platforms and
/// builds, so an identifier maps to the same draws everywhere.
const IDENTIFIER_HASH_SEED: u64 = 0x243f_6a88_85a3_08d3;

/// Stages of a single prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionState {
    Received,
    Validated,
    DirectPredict,
    ImputeThenPredict,
    Pooled,
    Summarized,
    Done,
    Failed,
}

/// Which branch produced the risk samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionPath {
    Direct,
    Imputed,
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Imputation(#[from] ImputationError),

    #[error("Sampling the mortality expert failed: {0}")]
    Sampling(#[from] SamplingError),
}

/// Derives a 32-bit seed from a case identifier.
pub fn seed_from_identifier(identifier: &str) -> u64 {
    xxh3_64_with_seed(identifier.as_bytes(), IDENTIFIER_HASH_SEED) & 0xFFFF_FFFF
}

/// One case to score.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub identifier: String,
    pub seed: u64,
    pub case: CaseInput,
}

impl PredictionRequest {
    /// Uses `seed` when given, otherwise one derived from the identifier.
    pub fn new(identifier: impl Into<String>, case: CaseInput, seed: Option<u64>) -> Self {
        let identifier = identifier.into();
        let seed = seed.unwrap_or_else(|| seed_from_identifier(&identifier));
        Self {
            identifier,
            seed,
            case,
        }
    }
}

/// Median and central 95% interval of the risk samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskSummary {
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

impl RiskSummary {
    /// Linear-interpolation percentiles. `samples` must be non-empty.
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self {
            median: quantile_sorted(&sorted, 0.5),
            lower: quantile_sorted(&sorted, 0.025),
            upper: quantile_sorted(&sorted, 0.975),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub identifier: String,
    pub seed: u64,
    pub path: PredictionPath,
    /// Markers that were filled by imputation.
    pub imputed: Vec<Marker>,
    pub summary: RiskSummary,
    pub samples: Vec<f64>,
    /// The winsorized rows that were scored, one per completion.
    pub scored_rows: FeatureFrame,
}

/// Scores cases against a fixed set of assets.
pub struct RiskAggregator<'a> {
    assets: &'a ModelAssets,
    config: EngineConfig,
}

impl<'a> RiskAggregator<'a> {
    pub fn new(assets: &'a ModelAssets, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { assets, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn predict(&self, request: &PredictionRequest) -> Result<PredictionResult, PredictionError> {
        self.predict_with_trace(request).1
    }

    /// Like `predict`, also returning every state the request passed through.
    pub fn predict_with_trace(
        &self,
        request: &PredictionRequest,
    ) -> (Vec<PredictionState>, Result<PredictionResult, PredictionError>) {
        let mut trace = Trace::new(&request.identifier);
        let outcome = self.run(request, &mut trace);
        if let Err(e) = &outcome {
            log::debug!("{}: prediction failed: {e}", request.identifier);
            trace.enter(PredictionState::Failed);
        }
        (trace.states, outcome)
    }

    /// Scores every request in parallel. Results keep the input order.
    pub fn predict_batch(
        &self,
        requests: &[PredictionRequest],
    ) -> Vec<Result<PredictionResult, PredictionError>> {
        log::info!("Scoring {} cases", requests.len());
        requests.par_iter().map(|r| self.predict(r)).collect()
    }

    fn run(
        &self,
        request: &PredictionRequest,
        trace: &mut Trace<'_>,
    ) -> Result<PredictionResult, PredictionError> {
        let row = request.case.to_feature_row();
        self.assets.categories().validate(&row)?;
        row.ensure_finite()?;
        trace.enter(PredictionState::Validated);

        let winsorized = self.assets.winsor().winsorize(&row);
        let missing: Vec<Marker> = [Marker::Lactate, Marker::Albumin]
            .into_iter()
            .filter(|m| row.is_missing(m.value_column()))
            .collect();

        let (path, rows, n_draws) = if missing.is_empty() {
            trace.enter(PredictionState::DirectPredict);
            (PredictionPath::Direct, vec![winsorized], self.config.direct_draws)
        } else {
            trace.enter(PredictionState::ImputeThenPredict);
            let rows = self.complete_rows(&winsorized, &missing, request.seed)?;
            (PredictionPath::Imputed, rows, self.config.imputed_row_draws())
        };

        let scored_rows = FeatureFrame::from_rows(&rows)?;
        let draws = sampler::sample(
            self.assets.mortality(),
            &scored_rows,
            Quantity::Mean,
            n_draws,
            request.seed,
        )?;
        // Column j holds the draws for completed row j.
        let samples: Vec<f64> = draws.t().iter().copied().collect();
        trace.enter(PredictionState::Pooled);

        let summary = RiskSummary::from_samples(&samples);
        trace.enter(PredictionState::Summarized);

        log::debug!(
            "{}: {} risk samples over {} row(s), median {:.4}",
            request.identifier,
            samples.len(),
            scored_rows.nrows(),
            summary.median
        );
        trace.enter(PredictionState::Done);
        Ok(PredictionResult {
            identifier: request.identifier.clone(),
            seed: request.seed,
            path,
            imputed: missing,
            summary,
            samples,
            scored_rows,
        })
    }

    /// Imputes the missing markers and returns one winsorized row per completion.
    /// Draw `i` of one marker is paired with draw `i` of the other.
    fn complete_rows(
        &self,
        winsorized: &FeatureRow,
        missing: &[Marker],
        seed: u64,
    ) -> Result<Vec<FeatureRow>, PredictionError> {
        let partial = winsorized.select(&IMPUTATION_COVARIATES)?;
        let mode = ImputationMode::Probabilistic {
            n_draws: self.config.imputation_draws,
        };
        let impute = |marker: Marker| -> Option<Result<Vec<f64>, ImputationError>> {
            missing.contains(&marker).then(|| {
                self.assets
                    .marker_model(marker)
                    .impute(&partial, mode, seed)
            })
        };
        let (lactate, albumin) = rayon::join(|| impute(Marker::Lactate), || impute(Marker::Albumin));
        let completions = [
            (Marker::Lactate, lactate.transpose()?),
            (Marker::Albumin, albumin.transpose()?),
        ];

        let mut rows = Vec::with_capacity(self.config.imputation_draws);
        for i in 0..self.config.imputation_draws {
            let mut row = winsorized.clone();
            for (marker, values) in &completions {
                if let Some(values) = values {
                    row.set(marker.value_column(), Some(values[i]))?;
                }
            }
            rows.push(self.assets.winsor().winsorize(&row));
        }
        Ok(rows)
    }
}

/// Records state transitions for one request.
struct Trace<'r> {
    identifier: &'r str,
    states: Vec<PredictionState>,
}

impl<'r> Trace<'r> {
    fn new(identifier: &'r str) -> Self {
        Self {
            identifier,
            states: vec![PredictionState::Received],
        }
    }

    fn enter(&mut self, state: PredictionState) {
        if let Some(previous) = self.states.last() {
            log::debug!("{}: {previous:?} -> {state:?}", self.identifier);
        }
        self.states.push(state);
    }
}
