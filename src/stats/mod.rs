//! Statistical models fitted per unit of work.
//!
//! Dispatch is a closed enum over the three supported tests; each model
//! exposes the shared capability pair {fit_unit, describe_columns}. All
//! arithmetic is f64. Degenerate inputs surface as [`ModelFitError`] and
//! never leak NaN/Inf into stored results.

pub mod linear;
pub mod logistic;
pub mod skat;

use ndarray::{Array1, Array2, ArrayView1};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::ModelFitError;

pub use linear::LinearModel;
pub use logistic::LogisticModel;
pub use skat::{SkatModel, WeightScheme};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Linear,
    Logistic,
    Skat,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::Logistic => "logistic",
            ModelKind::Skat => "skat",
        }
    }
}

/// The analyzed quantity for one unit of work: a single dosage vector for
/// regression models, a sample-by-variant dosage block plus per-variant
/// MAFs for the set test.
pub enum Predictor<'a> {
    Dosage(ArrayView1<'a, f64>),
    Set {
        dosages: Array2<f64>,
        mafs: Vec<f64>,
    },
}

/// Assembled inputs for one fit. The outcome vector arrives transformed and
/// exclusion-masked; covariates are sample-major without an intercept
/// column (models add their own).
pub struct UnitData<'a> {
    pub outcome: ArrayView1<'a, f64>,
    pub outcome_kind: crate::variables::VariableKind,
    pub covariates: &'a Array2<f64>,
    pub predictor: Predictor<'a>,
}

/// Successful fit of one unit.
#[derive(Debug, Clone)]
pub struct ModelFit {
    /// Effect estimate; absent for the set test.
    pub coefficient: Option<f64>,
    pub std_error: Option<f64>,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub p_value: f64,
    /// Complete-case sample count the fit used.
    pub n: usize,
    /// Model-specific auxiliary output, persisted as JSON.
    pub diagnostics: serde_json::Value,
}

/// Closed dispatch over the supported statistical models.
pub enum AnalysisModel {
    Linear(LinearModel),
    Logistic(LogisticModel),
    Skat(SkatModel),
}

impl AnalysisModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            AnalysisModel::Linear(_) => ModelKind::Linear,
            AnalysisModel::Logistic(_) => ModelKind::Logistic,
            AnalysisModel::Skat(_) => ModelKind::Skat,
        }
    }

    /// Names of the diagnostics columns this model contributes.
    pub fn describe_columns(&self) -> &'static [&'static str] {
        match self {
            AnalysisModel::Linear(_) => &["std_beta", "adj_r2"],
            AnalysisModel::Logistic(_) => &["n_cases", "n_controls", "iterations", "deviance"],
            AnalysisModel::Skat(_) => &["q_stat", "n_variants", "weights"],
        }
    }

    pub fn fit_unit(&self, unit: &UnitData<'_>) -> Result<ModelFit, ModelFitError> {
        match (self, &unit.predictor) {
            (AnalysisModel::Linear(m), Predictor::Dosage(x)) => {
                m.fit(unit.outcome, *x, unit.covariates)
            }
            (AnalysisModel::Logistic(m), Predictor::Dosage(x)) => {
                m.fit(unit.outcome, *x, unit.covariates)
            }
            (AnalysisModel::Skat(m), Predictor::Set { dosages, mafs }) => {
                m.fit(unit.outcome, dosages, mafs, unit.covariates, unit.outcome_kind)
            }
            _ => Err(ModelFitError::Numeric(
                "predictor shape does not match the model".into(),
            )),
        }
    }
}

/// 95% Wald interval around an estimate.
pub(crate) fn wald_ci(coefficient: f64, std_error: f64) -> (f64, f64) {
    let z = Normal::standard().inverse_cdf(0.975);
    (coefficient - z * std_error, coefficient + z * std_error)
}

/// Rows where the outcome, the dosage and every covariate are observed.
/// Returns (y, x, covariates) restricted to those rows.
pub(crate) fn complete_cases(
    outcome: ArrayView1<'_, f64>,
    dosage: ArrayView1<'_, f64>,
    covariates: &Array2<f64>,
) -> (Array1<f64>, Array1<f64>, Array2<f64>) {
    let keep: Vec<usize> = (0..outcome.len())
        .filter(|&i| {
            !outcome[i].is_nan()
                && !dosage[i].is_nan()
                && (0..covariates.ncols()).all(|c| !covariates[[i, c]].is_nan())
        })
        .collect();

    let y = Array1::from_iter(keep.iter().map(|&i| outcome[i]));
    let x = Array1::from_iter(keep.iter().map(|&i| dosage[i]));
    let mut covs = Array2::zeros((keep.len(), covariates.ncols()));
    for (row, &i) in keep.iter().enumerate() {
        for c in 0..covariates.ncols() {
            covs[[row, c]] = covariates[[i, c]];
        }
    }
    (y, x, covs)
}

/// Builds the design matrix [intercept | dosage | covariates].
pub(crate) fn design_matrix(x: &Array1<f64>, covariates: &Array2<f64>) -> Array2<f64> {
    let n = x.len();
    let p = 2 + covariates.ncols();
    let mut design = Array2::zeros((n, p));
    for i in 0..n {
        design[[i, 0]] = 1.0;
        design[[i, 1]] = x[i];
        for c in 0..covariates.ncols() {
            design[[i, 2 + c]] = covariates[[i, c]];
        }
    }
    design
}

/// Cholesky factor (lower triangular) of a symmetric positive-definite
/// matrix. `None` when the matrix is not positive definite within
/// tolerance, which for normal equations means a collinear design.
pub(crate) fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let p = a.nrows();
    if p != a.ncols() {
        return None;
    }
    let max_diag = (0..p).fold(0.0f64, |acc, i| acc.max(a[[i, i]].abs()));
    let tol = 1e-12 * max_diag.max(1.0);

    let mut l = Array2::<f64>::zeros((p, p));
    for j in 0..p {
        let mut d = a[[j, j]];
        for k in 0..j {
            d -= l[[j, k]] * l[[j, k]];
        }
        if !d.is_finite() || d <= tol {
            return None;
        }
        let djj = d.sqrt();
        l[[j, j]] = djj;
        for i in (j + 1)..p {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / djj;
        }
    }
    Some(l)
}

/// Solves `L L^T x = b` given the Cholesky factor.
pub(crate) fn chol_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let p = l.nrows();
    // Forward substitution: L z = b.
    let mut z = Array1::<f64>::zeros(p);
    for i in 0..p {
        let mut s = b[i];
        for k in 0..i {
            s -= l[[i, k]] * z[k];
        }
        z[i] = s / l[[i, i]];
    }
    // Back substitution: L^T x = z.
    let mut x = Array1::<f64>::zeros(p);
    for i in (0..p).rev() {
        let mut s = z[i];
        for k in (i + 1)..p {
            s -= l[[k, i]] * x[k];
        }
        x[i] = s / l[[i, i]];
    }
    x
}

/// Full inverse from the Cholesky factor, column by column.
pub(crate) fn chol_inverse(l: &Array2<f64>) -> Array2<f64> {
    let p = l.nrows();
    let mut inv = Array2::<f64>::zeros((p, p));
    for j in 0..p {
        let mut e = Array1::<f64>::zeros(p);
        e[j] = 1.0;
        let col = chol_solve(l, &e);
        for i in 0..p {
            inv[[i, j]] = col[i];
        }
    }
    inv
}
