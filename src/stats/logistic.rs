//! Maximum-likelihood logistic regression via iteratively reweighted least
//! squares.
//!
//! The reported coefficient is a log-odds-ratio. Perfect or quasi-perfect
//! separation is detected by the linear predictor running away during
//! iteration and surfaces as [`ModelFitError::Separation`] instead of an
//! unbounded estimate.

use ndarray::{Array1, Array2, ArrayView1};
use serde_json::json;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::ModelFitError;

use super::{chol_inverse, chol_solve, cholesky, complete_cases, design_matrix, wald_ci, ModelFit};

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_TOL: f64 = 1e-8;
/// |eta| beyond this means fitted probabilities pinned at 0/1. Under
/// separation the predictor grows by roughly one unit per IRLS step, so the
/// iteration budget must comfortably exceed this bound.
const ETA_BOUND: f64 = 30.0;

#[derive(Debug, Default)]
pub struct LogisticModel;

impl LogisticModel {
    pub fn fit(
        &self,
        outcome: ArrayView1<'_, f64>,
        dosage: ArrayView1<'_, f64>,
        covariates: &Array2<f64>,
    ) -> Result<ModelFit, ModelFitError> {
        let (y, x, covs) = complete_cases(outcome, dosage, covariates);
        let n = y.len();
        let p = 2 + covs.ncols();
        if n <= p {
            return Err(ModelFitError::TooFewObservations {
                observed: n,
                parameters: p,
            });
        }

        let n_cases = y.iter().filter(|&&v| v == 1.0).count();
        let n_controls = y.iter().filter(|&&v| v == 0.0).count();
        if n_cases + n_controls != n {
            return Err(ModelFitError::Numeric(
                "logistic outcome holds values other than 0/1".into(),
            ));
        }
        if n_cases == 0 || n_controls == 0 {
            return Err(ModelFitError::ZeroVariance(
                "outcome has no cases or no controls in the fitted sample".into(),
            ));
        }
        if !x.iter().any(|&v| v != x[0]) {
            return Err(ModelFitError::ZeroVariance(
                "analyzed dosage is constant in the fitted sample".into(),
            ));
        }

        let design = design_matrix(&x, &covs);
        let fit = irls_fit(&design, &y)?;

        // Standard errors from the observed information at the solution.
        let weights = fit.mu.mapv(|m| m * (1.0 - m));
        let xtwx = weighted_cross(&design, &weights);
        let l = cholesky(&xtwx).ok_or_else(|| {
            ModelFitError::SingularDesign("information matrix is not positive definite".into())
        })?;
        let inv = chol_inverse(&l);
        let se = inv[[1, 1]].sqrt();
        let coefficient = fit.beta[1];
        if !coefficient.is_finite() || !se.is_finite() || se <= 0.0 {
            return Err(ModelFitError::Numeric(format!(
                "unstable estimate (coefficient {}, se {})",
                coefficient, se
            )));
        }

        let z = coefficient / se;
        let p_value = 2.0 * Normal::standard().cdf(-z.abs());
        let (ci_low, ci_high) = wald_ci(coefficient, se);

        Ok(ModelFit {
            coefficient: Some(coefficient),
            std_error: Some(se),
            ci_low: Some(ci_low),
            ci_high: Some(ci_high),
            p_value,
            n,
            diagnostics: json!({
                "n_cases": n_cases,
                "n_controls": n_controls,
                "iterations": fit.iterations,
                "deviance": fit.deviance,
            }),
        })
    }
}

pub(crate) struct IrlsFit {
    pub beta: Array1<f64>,
    pub mu: Array1<f64>,
    pub iterations: usize,
    pub deviance: f64,
}

/// Runs IRLS on an arbitrary design matrix. Shared with the set test's
/// binary null model.
pub(crate) fn irls_fit(design: &Array2<f64>, y: &Array1<f64>) -> Result<IrlsFit, ModelFitError> {
    let p = design.ncols();
    let mut beta = Array1::<f64>::zeros(p);

    for iteration in 1..=MAX_ITERATIONS {
        let eta = design.dot(&beta);
        if let Some(extreme) = eta.iter().find(|e| e.abs() > ETA_BOUND) {
            return Err(ModelFitError::Separation(format!(
                "linear predictor reached {:.1} at iteration {}",
                extreme, iteration
            )));
        }
        let mu = eta.mapv(sigmoid);
        let weights = mu.mapv(|m| m * (1.0 - m));

        // Working response z = eta + (y - mu) / w, solved through the
        // weighted normal equations.
        let mut z = Array1::<f64>::zeros(y.len());
        for i in 0..y.len() {
            z[i] = eta[i] + (y[i] - mu[i]) / weights[i].max(1e-12);
        }
        let xtwx = weighted_cross(design, &weights);
        let xtwz = weighted_rhs(design, &weights, &z);
        let l = cholesky(&xtwx).ok_or_else(|| {
            ModelFitError::SingularDesign(
                "weighted normal equations are not positive definite".into(),
            )
        })?;
        let updated = chol_solve(&l, &xtwz);

        let delta = updated
            .iter()
            .zip(beta.iter())
            .fold(0.0f64, |acc, (a, b)| acc.max((a - b).abs()));
        beta = updated;
        if delta < CONVERGENCE_TOL {
            let eta = design.dot(&beta);
            if let Some(extreme) = eta.iter().find(|e| e.abs() > ETA_BOUND) {
                return Err(ModelFitError::Separation(format!(
                    "converged with linear predictor at {:.1}",
                    extreme
                )));
            }
            let mu = eta.mapv(sigmoid);
            let deviance = binomial_deviance(y, &mu);
            return Ok(IrlsFit {
                beta,
                mu,
                iterations: iteration,
                deviance,
            });
        }
    }

    Err(ModelFitError::NonConvergence {
        iterations: MAX_ITERATIONS,
    })
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

fn binomial_deviance(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    let mut deviance = 0.0;
    for (&yi, &mi) in y.iter().zip(mu.iter()) {
        let m = mi.clamp(1e-15, 1.0 - 1e-15);
        deviance -= 2.0 * (yi * m.ln() + (1.0 - yi) * (1.0 - m).ln());
    }
    deviance
}

/// X^T diag(w) X without materializing the weighted copy.
fn weighted_cross(design: &Array2<f64>, weights: &Array1<f64>) -> Array2<f64> {
    let (n, p) = design.dim();
    let mut out = Array2::<f64>::zeros((p, p));
    for i in 0..n {
        let w = weights[i];
        for a in 0..p {
            let wa = w * design[[i, a]];
            for b in a..p {
                out[[a, b]] += wa * design[[i, b]];
            }
        }
    }
    for a in 0..p {
        for b in 0..a {
            out[[a, b]] = out[[b, a]];
        }
    }
    out
}

fn weighted_rhs(design: &Array2<f64>, weights: &Array1<f64>, z: &Array1<f64>) -> Array1<f64> {
    let (n, p) = design.dim();
    let mut out = Array1::<f64>::zeros(p);
    for i in 0..n {
        let wz = weights[i] * z[i];
        for a in 0..p {
            out[a] += design[[i, a]] * wz;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn recovers_positive_log_odds() {
        // Cases concentrate at higher dosage, with enough overlap to keep
        // the likelihood bounded.
        let y = array![0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let x = array![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 0.0, 1.0];
        let covs = Array2::zeros((12, 0));
        let fit = LogisticModel.fit(y.view(), x.view(), &covs).unwrap();
        let coef = fit.coefficient.unwrap();
        assert!(coef.is_finite() && coef > 0.0);
        assert!(fit.p_value > 0.0 && fit.p_value <= 1.0);
        assert!(fit.ci_low.unwrap() <= coef && coef <= fit.ci_high.unwrap());
        assert_eq!(fit.diagnostics["n_cases"], 6);
        assert_eq!(fit.diagnostics["n_controls"], 6);
    }

    #[test]
    fn perfect_separation_is_detected() {
        // Every case has dosage 2, every control dosage 0.
        let y = array![1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let x = array![2.0, 2.0, 2.0, 0.0, 0.0, 0.0];
        let covs = Array2::zeros((6, 0));
        let err = LogisticModel.fit(y.view(), x.view(), &covs).unwrap_err();
        assert!(matches!(err, ModelFitError::Separation(_)));
    }

    #[test]
    fn single_class_outcome_is_zero_variance() {
        let y = array![1.0, 1.0, 1.0, 1.0, 1.0];
        let x = array![0.0, 1.0, 2.0, 1.0, 0.0];
        let covs = Array2::zeros((5, 0));
        let err = LogisticModel.fit(y.view(), x.view(), &covs).unwrap_err();
        assert!(matches!(err, ModelFitError::ZeroVariance(_)));
    }
}
