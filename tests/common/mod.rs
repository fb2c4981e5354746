use ndarray::{Array, Array1, Array2, array};
use rune::assets::{AssetBundle, ExpertSource, MarkerSource, ModelAssets, TransformSource};
use rune::basis::{apply_sum_to_zero_constraint, create_bspline_basis_with_knots, uniform_knot_vector};
use rune::config::EngineConfig;
use rune::model::{Constraint, DesignSpec, Distribution, FittedExpert, LinkFunction, Term};
use rune::schema::{
    self, AGE, ALBUMIN, ALBUMIN_MISSING, ASA, CREATININE, CaseInput, CategoryAllowList,
    IMPUTATION_COVARIATES, LACTATE, LACTATE_MISSING, MORTALITY_COVARIATES, PULSE,
};
use rune::transform::QuantileTransform;
use rune::types::Coefficients;
use rune::winsor::WinsorThresholds;

fn linear(feature: &str) -> Term {
    Term::Linear {
        feature: feature.to_string(),
    }
}

fn age_spline() -> Term {
    let knots = uniform_knot_vector((18.0, 96.0), 3, 2).unwrap();
    let grid = Array::linspace(18.0, 96.0, 79);
    let basis = create_bspline_basis_with_knots(grid.view(), knots.view(), 2).unwrap();
    let (_, z_transform) = apply_sum_to_zero_constraint(basis.view()).unwrap();
    Term::Spline {
        feature: AGE.to_string(),
        knots,
        degree: 2,
        constraint: Some(Constraint { z_transform }),
    }
}

pub fn mortality_design() -> DesignSpec {
    DesignSpec {
        features: schema::owned_columns(&MORTALITY_COVARIATES),
        terms: vec![
            Term::Intercept,
            age_spline(),
            linear(CREATININE),
            linear(LACTATE),
            linear(ALBUMIN),
            linear(LACTATE_MISSING),
            linear(ALBUMIN_MISSING),
            Term::Factor {
                feature: ASA.to_string(),
                levels: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            },
        ],
    }
}

pub fn mortality_expert(intercept: f64) -> FittedExpert {
    let mut coefficients = vec![intercept, -0.5, -0.2, 0.1, 0.4, 0.8];
    coefficients.extend([0.002, 0.15, -0.03, 0.1, 0.1]);
    coefficients.extend([0.0, 0.3, 0.8, 1.4, 2.0]);
    let p = coefficients.len();
    FittedExpert::new(
        mortality_design(),
        Coefficients::new(Array1::from_vec(coefficients)),
        Array2::eye(p) * 0.01,
        LinkFunction::Logit,
        Distribution::Bernoulli,
        None,
    )
    .unwrap()
}

/// A Gaussian expert on the normal-score scale of a marker.
pub fn marker_expert(intercept: f64) -> FittedExpert {
    FittedExpert::new(
        DesignSpec {
            features: schema::owned_columns(&IMPUTATION_COVARIATES),
            terms: vec![Term::Intercept, linear(AGE), linear(PULSE)],
        },
        Coefficients::new(array![intercept, 0.01, -0.002]),
        Array2::eye(3) * 0.001,
        LinkFunction::Identity,
        Distribution::Gaussian,
        Some(0.64),
    )
    .unwrap()
}

pub fn lactate_observations() -> Vec<f64> {
    (0..500).map(|i| 0.4 + (i as f64 / 60.0).powi(2) * 0.2).collect()
}

pub fn albumin_transform() -> QuantileTransform {
    let observed: Vec<f64> = (0..500).map(|i| 12.0 + i as f64 * 0.08).collect();
    QuantileTransform::fit(&observed, 200).unwrap()
}

pub fn bundle() -> AssetBundle {
    AssetBundle {
        categories: CategoryAllowList::reference(),
        winsor: WinsorThresholds::reference_table(),
        mortality: ExpertSource {
            imputations: vec![mortality_expert(-3.0), mortality_expert(-2.9)],
        },
        lactate: MarkerSource {
            expert: ExpertSource {
                imputations: vec![marker_expert(-0.4)],
            },
            transform: TransformSource::Observed {
                observed: lactate_observations(),
            },
        },
        albumin: MarkerSource {
            expert: ExpertSource {
                imputations: vec![marker_expert(-0.6), marker_expert(-0.5)],
            },
            transform: TransformSource::Fitted(albumin_transform()),
        },
    }
}

pub fn assets() -> ModelAssets {
    bundle().into_assets(&EngineConfig::default()).unwrap()
}

pub fn case() -> CaseInput {
    CaseInput {
        ct_performed: true,
        sinus_rhythm: true,
        age: 64.0,
        creatinine: 95.0,
        sodium: 137.0,
        potassium: 4.2,
        urea: 7.1,
        white_cell_count: 12.5,
        heart_rate: 96.0,
        systolic_bp: 118.0,
        gcs: 15.0,
        asa: 3.0,
        cardiac: 1.0,
        respiratory: 2.0,
        malignancy: 1.0,
        soiling: 2.0,
        indication: 4.0,
        albumin: Some(31.0),
        lactate: Some(2.2),
    }
}
