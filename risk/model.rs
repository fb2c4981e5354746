use crate::basis::{self, create_bspline_basis_with_knots};
use crate::schema::{self, FeatureFrame, SchemaError};
use crate::types::Coefficients;
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable form of a fitted expert when it is
// shipped inside a TOML asset bundle.

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    /// The logit link, for binary outcomes such as thirty-day mortality.
    /// Maps probabilities (0, 1) to the real line (-inf, +inf).
    Logit,
    /// The identity link, for continuous outcomes (e.g., Gaussian regression).
    Identity,
}

impl LinkFunction {
    /// Maps a linear predictor onto the mean scale.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => {
                // Clamp eta to prevent overflow in exp()
                let eta_clamped = eta.clamp(-700.0, 700.0);
                let prob = 1.0 / (1.0 + f64::exp(-eta_clamped));
                // Keep probabilities strictly inside (0, 1).
                prob.clamp(1e-8, 1.0 - 1e-8)
            }
            LinkFunction::Identity => eta,
        }
    }

    /// The canonical link of an outcome distribution.
    pub fn canonical_for(distribution: Distribution) -> Self {
        match distribution {
            Distribution::Gaussian => LinkFunction::Identity,
            Distribution::Bernoulli => LinkFunction::Logit,
        }
    }
}

/// Outcome distribution an expert was fit under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    Gaussian,
    Bernoulli,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Gaussian => f.write_str("gaussian"),
            Distribution::Bernoulli => f.write_str("bernoulli"),
        }
    }
}

/// Holds the transformation matrix for a sum-to-zero constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// The Z matrix that transforms an unconstrained basis B to a constrained one B_c = B.dot(Z)
    pub z_transform: Array2<f64>,
}

/// One additive term of an expert's design. Terms contribute design columns in
/// the order they are listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    /// A column of ones.
    Intercept,
    /// The raw feature value.
    Linear { feature: String },
    /// A B-spline expansion of the feature using the knots saved at fit time.
    Spline {
        feature: String,
        knots: Array1<f64>,
        degree: usize,
        #[serde(default)]
        constraint: Option<Constraint>,
    },
    /// One indicator column per level of a coded categorical feature.
    Factor { feature: String, levels: Vec<f64> },
}

impl Term {
    pub fn feature(&self) -> Option<&str> {
        match self {
            Term::Intercept => None,
            Term::Linear { feature }
            | Term::Spline { feature, .. }
            | Term::Factor { feature, .. } => Some(feature),
        }
    }

    /// Number of design columns this term contributes.
    pub fn width(&self) -> usize {
        match self {
            Term::Intercept | Term::Linear { .. } => 1,
            Term::Spline {
                knots,
                degree,
                constraint,
                ..
            } => match constraint {
                Some(c) => c.z_transform.ncols(),
                None => basis::num_basis_functions(knots.len(), *degree),
            },
            Term::Factor { levels, .. } => levels.len(),
        }
    }
}

/// The basis-expansion function of an expert: the exact feature schema it was fit
/// with plus the terms that expand those features into design columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpec {
    /// Feature columns in fitted order. Rows must match this exactly.
    pub features: Vec<String>,
    pub terms: Vec<Term>,
}

impl DesignSpec {
    pub fn num_coefficients(&self) -> usize {
        self.terms.iter().map(Term::width).sum()
    }

    /// Checks that every term refers to a declared feature and that saved
    /// constraints line up with their spline bases.
    pub fn validate(&self) -> Result<(), ModelError> {
        for term in &self.terms {
            if let Some(feature) = term.feature() {
                if !self.features.iter().any(|f| f == feature) {
                    return Err(ModelError::UnknownTermFeature(feature.to_string()));
                }
            }
            if let Term::Spline {
                feature,
                knots,
                degree,
                constraint: Some(c),
            } = term
            {
                let num_basis = basis::num_basis_functions(knots.len(), *degree);
                if c.z_transform.nrows() != num_basis {
                    return Err(ModelError::ConstraintShape {
                        feature: feature.clone(),
                        basis: num_basis,
                        rows: c.z_transform.nrows(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Expands a frame into the design matrix, one row per frame row.
    pub fn design_matrix(&self, frame: &FeatureFrame) -> Result<Array2<f64>, ModelError> {
        schema::ensure_schema(&self.features, frame.columns())?;

        let n_rows = frame.nrows();
        let mut design = Array2::zeros((n_rows, self.num_coefficients()));
        let mut offset = 0;
        for term in &self.terms {
            let width = term.width();
            let mut block = design.slice_mut(s![.., offset..offset + width]);
            match term {
                Term::Intercept => block.fill(1.0),
                Term::Linear { feature } => {
                    block.column_mut(0).assign(&frame.column(feature)?);
                }
                Term::Spline {
                    feature,
                    knots,
                    degree,
                    constraint,
                } => {
                    let raw =
                        create_bspline_basis_with_knots(frame.column(feature)?, knots.view(), *degree)?;
                    match constraint {
                        Some(c) => block.assign(&raw.dot(&c.z_transform)),
                        None => block.assign(&raw),
                    }
                }
                Term::Factor { feature, levels } => {
                    let column = frame.column(feature)?;
                    internal::one_hot(column, levels, feature, &mut block)?;
                }
            }
            offset += width;
        }
        Ok(design)
    }
}

/// Custom error type for expert construction and design expansion.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] basis::BasisError),

    #[error("Term refers to feature '{0}', which is not part of the design's feature schema.")]
    UnknownTermFeature(String),

    #[error("Constraint for '{feature}' has {rows} rows but its spline basis has {basis} columns.")]
    ConstraintShape {
        feature: String,
        basis: usize,
        rows: usize,
    },

    #[error("Value {value} of factor '{feature}' is not one of its fitted levels.")]
    UnknownFactorLevel { feature: String, value: f64 },

    #[error("Expert has {coefficients} coefficients but its design produces {design} columns.")]
    CoefficientCount { coefficients: usize, design: usize },

    #[error("Coefficient covariance must be {expected}x{expected}, found {rows}x{cols}.")]
    CovarianceShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Coefficient covariance is not symmetric: entry ({row}, {col}) differs from its transpose by {difference:.3e}.")]
    CovarianceNotSymmetric {
        row: usize,
        col: usize,
        difference: f64,
    },

    #[error("Expert parameters contain a non-finite value in {0}.")]
    NonFiniteParameter(&'static str),

    #[error("Dispersion scale must be non-negative, found {0}.")]
    NegativeScale(f64),
}

/// The sampling contract shared by single fitted experts and pooled composites.
///
/// Anything that exposes a posterior over coefficients, a design function, a link
/// and an outcome distribution can be sampled from.
pub trait Expert: Send + Sync {
    fn coefficients(&self) -> &Coefficients;

    fn covariance(&self) -> &Array2<f64>;

    fn design(&self) -> &DesignSpec;

    fn link(&self) -> LinkFunction;

    fn distribution(&self) -> Distribution;

    /// Dispersion of a Gaussian expert, if one was estimated.
    fn scale(&self) -> Option<f64>;

    fn features(&self) -> &[String] {
        &self.design().features
    }

    fn design_matrix(&self, frame: &FeatureFrame) -> Result<Array2<f64>, ModelError> {
        self.design().design_matrix(frame)
    }

    /// Checks the parameters against the design: coefficient count, covariance
    /// shape and symmetry, finiteness and a non-negative scale. Experts built in
    /// memory or deserialized must pass this before they are sampled.
    fn validate(&self) -> Result<(), ModelError> {
        let design = self.design();
        design.validate()?;
        let p = design.num_coefficients();
        let coefficients = self.coefficients();
        if coefficients.len() != p {
            return Err(ModelError::CoefficientCount {
                coefficients: coefficients.len(),
                design: p,
            });
        }
        internal::check_covariance(self.covariance(), p)?;
        if coefficients.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteParameter("coefficients"));
        }
        match self.scale() {
            Some(s) if !s.is_finite() => Err(ModelError::NonFiniteParameter("scale")),
            Some(s) if s < 0.0 => Err(ModelError::NegativeScale(s)),
            _ => Ok(()),
        }
    }
}

/// Parameters of one fitted additive model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedExpert {
    pub design: DesignSpec,
    pub coefficients: Coefficients,
    pub covariance: Array2<f64>,
    pub link: LinkFunction,
    pub distribution: Distribution,
    #[serde(default)]
    pub scale: Option<f64>,
}

impl FittedExpert {
    pub fn new(
        design: DesignSpec,
        coefficients: Coefficients,
        covariance: Array2<f64>,
        link: LinkFunction,
        distribution: Distribution,
        scale: Option<f64>,
    ) -> Result<Self, ModelError> {
        let expert = Self {
            design,
            coefficients,
            covariance,
            link,
            distribution,
            scale,
        };
        expert.validate()?;
        Ok(expert)
    }
}

impl Expert for FittedExpert {
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

/// Internal module for design and parameter checks.
mod internal {
    use super::*;
    use ndarray::{ArrayView1, ArrayViewMut2};

    const SYMMETRY_TOLERANCE: f64 = 1e-8;

    pub(super) fn one_hot(
        column: ArrayView1<f64>,
        levels: &[f64],
        feature: &str,
        block: &mut ArrayViewMut2<f64>,
    ) -> Result<(), ModelError> {
        for (i, &value) in column.iter().enumerate() {
            let level = levels.iter().position(|&l| l == value).ok_or_else(|| {
                ModelError::UnknownFactorLevel {
                    feature: feature.to_string(),
                    value,
                }
            })?;
            block[[i, level]] = 1.0;
        }
        Ok(())
    }

    pub(super) fn check_covariance(covariance: &Array2<f64>, p: usize) -> Result<(), ModelError> {
        if covariance.nrows() != p || covariance.ncols() != p {
            return Err(ModelError::CovarianceShape {
                expected: p,
                rows: covariance.nrows(),
                cols: covariance.ncols(),
            });
        }
        if covariance.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteParameter("covariance"));
        }
        let magnitude = covariance
            .iter()
            .fold(1.0_f64, |acc, v| acc.max(v.abs()));
        for i in 0..p {
            for j in (i + 1)..p {
                let difference = (covariance[[i, j]] - covariance[[j, i]]).abs();
                if difference > SYMMETRY_TOLERANCE * magnitude {
                    return Err(ModelError::CovarianceNotSymmetric {
                        row: i,
                        col: j,
                        difference,
                    });
                }
            }
        }
        Ok(())
    }
}
