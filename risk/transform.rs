//! Monotone mapping between a clinical variable and the standard-normal scale.
//!
//! The transform stores a grid of empirical quantiles (`quantiles`) at evenly
//! spaced probabilities (`references`). The forward direction interpolates a value
//! to its probability and applies the normal quantile function; the inverse applies
//! the normal CDF and interpolates back. Runs of repeated knots, common for
//! discretized laboratory values, map to the centre of the run.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

/// Upper bound on the number of quantile knots.
pub const DEFAULT_QUANTILE_COUNT: usize = 10_000;

/// Probabilities are kept this far from 0 and 1 before the normal quantile function.
pub const BOUNDS_THRESHOLD: f64 = 1e-7;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("At least two observations are needed to fit a quantile transform, found {0}.")]
    TooFewObservations(usize),

    #[error("A quantile transform needs at least two knots, but {0} were requested.")]
    TooFewQuantiles(usize),

    #[error("Observation {index} is not finite ({value}).")]
    NonFiniteObservation { index: usize, value: f64 },

    #[error("Transform has {quantiles} quantiles but {references} reference probabilities.")]
    LengthMismatch { quantiles: usize, references: usize },

    #[error("Transform knots must be non-decreasing and finite; knot {0} is not.")]
    UnsortedKnots(usize),

    #[error("Reference probabilities must run from 0 to 1.")]
    InvalidReferences,

    #[error("Could not build the standard normal distribution: {0}")]
    Normal(#[from] statrs::StatsError),
}

/// Linear-interpolation quantile of already sorted data (the common "type 7"
/// definition). `p` is clamped to `[0, 1]`; empty input yields `NaN`.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// A fitted quantile-normal transform. Deserialized knots are validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SavedKnots")]
pub struct QuantileTransform {
    quantiles: Vec<f64>,
    references: Vec<f64>,
}

#[derive(Deserialize)]
struct SavedKnots {
    quantiles: Vec<f64>,
    references: Vec<f64>,
}

impl TryFrom<SavedKnots> for QuantileTransform {
    type Error = TransformError;

    fn try_from(saved: SavedKnots) -> Result<Self, Self::Error> {
        QuantileTransform::from_knots(saved.quantiles, saved.references)
    }
}

impl QuantileTransform {
    /// Fits the transform on observed training values with at most `n_quantiles` knots.
    pub fn fit(observed: &[f64], n_quantiles: usize) -> Result<Self, TransformError> {
        if n_quantiles < 2 {
            return Err(TransformError::TooFewQuantiles(n_quantiles));
        }
        if observed.len() < 2 {
            return Err(TransformError::TooFewObservations(observed.len()));
        }
        if let Some((index, &value)) = observed.iter().enumerate().find(|(_, v)| !v.is_finite())
        {
            return Err(TransformError::NonFiniteObservation { index, value });
        }

        let mut sorted = observed.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n_knots = n_quantiles.min(sorted.len());
        let step = 1.0 / (n_knots - 1) as f64;
        let references: Vec<f64> = (0..n_knots)
            .map(|i| if i + 1 == n_knots { 1.0 } else { i as f64 * step })
            .collect();

        // Interpolated quantiles can lose monotonicity to rounding.
        let mut running = f64::NEG_INFINITY;
        let quantiles = references
            .iter()
            .map(|&p| {
                running = running.max(quantile_sorted(&sorted, p));
                running
            })
            .collect();

        log::debug!(
            "Fitted quantile transform with {n_knots} knots on {} observations",
            sorted.len()
        );
        Ok(Self {
            quantiles,
            references,
        })
    }

    /// Builds a transform from saved knots.
    pub fn from_knots(quantiles: Vec<f64>, references: Vec<f64>) -> Result<Self, TransformError> {
        let transform = Self {
            quantiles,
            references,
        };
        transform.validate()?;
        Ok(transform)
    }

    pub fn validate(&self) -> Result<(), TransformError> {
        if self.quantiles.len() != self.references.len() {
            return Err(TransformError::LengthMismatch {
                quantiles: self.quantiles.len(),
                references: self.references.len(),
            });
        }
        if self.quantiles.len() < 2 {
            return Err(TransformError::TooFewQuantiles(self.quantiles.len()));
        }
        for knots in [&self.quantiles, &self.references] {
            if let Some(i) = (0..knots.len())
                .find(|&i| !knots[i].is_finite() || (i > 0 && knots[i] < knots[i - 1]))
            {
                return Err(TransformError::UnsortedKnots(i));
            }
        }
        let first = self.references[0];
        let last = self.references[self.references.len() - 1];
        if first != 0.0 || last != 1.0 {
            return Err(TransformError::InvalidReferences);
        }
        Ok(())
    }

    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    pub fn references(&self) -> &[f64] {
        &self.references
    }

    /// Maps clinical values to normal scores. Values outside the fitted range are
    /// clamped to the boundary knots first.
    pub fn apply(&self, values: &[f64]) -> Result<Vec<f64>, TransformError> {
        let normal = Normal::new(0.0, 1.0)?;
        let lower = self.quantiles[0];
        let upper = self.quantiles[self.quantiles.len() - 1];
        let neg_quantiles: Vec<f64> = self.quantiles.iter().rev().map(|q| -q).collect();
        let neg_references: Vec<f64> = self.references.iter().rev().map(|r| -r).collect();

        Ok(values
            .iter()
            .map(|&x| {
                let p = if x <= lower {
                    0.0
                } else if x >= upper {
                    1.0
                } else {
                    0.5 * (interp(x, &self.quantiles, &self.references)
                        - interp(-x, &neg_quantiles, &neg_references))
                };
                normal.inverse_cdf(p.clamp(BOUNDS_THRESHOLD, 1.0 - BOUNDS_THRESHOLD))
            })
            .collect())
    }

    /// Maps normal scores back to clinical values. Scores at or beyond the clipped
    /// bounds of `apply` land exactly on the boundary knots.
    pub fn invert(&self, scores: &[f64]) -> Result<Vec<f64>, TransformError> {
        let normal = Normal::new(0.0, 1.0)?;
        let lower_score = normal.inverse_cdf(BOUNDS_THRESHOLD);
        let upper_score = normal.inverse_cdf(1.0 - BOUNDS_THRESHOLD);
        let lower = self.quantiles[0];
        let upper = self.quantiles[self.quantiles.len() - 1];

        Ok(scores
            .iter()
            .map(|&z| {
                if z <= lower_score {
                    lower
                } else if z >= upper_score {
                    upper
                } else {
                    interp(normal.cdf(z), &self.references, &self.quantiles)
                }
            })
            .collect())
    }
}

/// Piecewise-linear interpolation through `(xp, fp)`, flat beyond the ends. When
/// `x` hits a run of equal `xp`, the last knot of the run is used.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len();
    if x < xp[0] {
        return fp[0];
    }
    let j = xp.partition_point(|&v| v <= x).saturating_sub(1);
    if j + 1 >= n {
        return fp[n - 1];
    }
    let slope = (fp[j + 1] - fp[j]) / (xp[j + 1] - xp[j]);
    fp[j] + slope * (x - xp[j])
}
