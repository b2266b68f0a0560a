//! Variance-component score test over a variant set (SKAT).
//!
//! Tests one externally-supplied variant grouping against one outcome. The
//! score statistic is Q = ||W G^T (y - mu)||^2 with per-variant weights
//! derived from MAF; the null distribution is approximated by a scaled
//! chi-square matched to the first two moments of the quadratic form.
//! Missing dosages inside the set are mean-imputed per variant; samples
//! missing the outcome or a covariate are dropped.

use ndarray::{Array1, Array2, ArrayView1};
use serde_json::json;
use statrs::distribution::{Beta, ChiSquared, Continuous, ContinuousCDF};

use crate::error::ModelFitError;
use crate::variables::VariableKind;

use super::logistic::irls_fit;
use super::{chol_inverse, chol_solve, cholesky, ModelFit};

/// Per-variant weighting mode, selecting the MAF emphasis of the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightScheme {
    /// Beta(1, 25) density of the MAF; strongly upweights rare variants.
    RareBeta,
    /// Beta(0.5, 0.5) density; a milder rare-variant emphasis.
    BalancedBeta,
    /// Equal weights, appropriate for common-variant sets.
    Uniform,
}

impl WeightScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightScheme::RareBeta => "beta(1,25)",
            WeightScheme::BalancedBeta => "beta(0.5,0.5)",
            WeightScheme::Uniform => "uniform",
        }
    }

    fn weight(&self, maf: f64) -> Result<f64, ModelFitError> {
        let maf = maf.clamp(1e-6, 1.0 - 1e-6);
        match self {
            WeightScheme::Uniform => Ok(1.0),
            WeightScheme::RareBeta => beta_pdf(1.0, 25.0, maf),
            WeightScheme::BalancedBeta => beta_pdf(0.5, 0.5, maf),
        }
    }
}

fn beta_pdf(a: f64, b: f64, x: f64) -> Result<f64, ModelFitError> {
    let dist = Beta::new(a, b).map_err(|e| ModelFitError::Numeric(e.to_string()))?;
    Ok(dist.pdf(x))
}

#[derive(Debug)]
pub struct SkatModel {
    pub weights: WeightScheme,
}

impl SkatModel {
    pub fn new(weights: WeightScheme) -> Self {
        Self { weights }
    }

    /// Fits the null model (intercept + covariates; linear or logistic per
    /// the outcome kind) and evaluates the score test for the set.
    pub fn fit(
        &self,
        outcome: ArrayView1<'_, f64>,
        dosages: &Array2<f64>,
        mafs: &[f64],
        covariates: &Array2<f64>,
        outcome_kind: VariableKind,
    ) -> Result<ModelFit, ModelFitError> {
        let q = dosages.ncols();
        if q == 0 || mafs.len() != q {
            return Err(ModelFitError::Numeric(
                "variant set is empty or MAF vector does not match it".into(),
            ));
        }

        // Complete cases on outcome and covariates only; set dosages are
        // mean-imputed afterwards.
        let keep: Vec<usize> = (0..outcome.len())
            .filter(|&i| {
                !outcome[i].is_nan()
                    && (0..covariates.ncols()).all(|c| !covariates[[i, c]].is_nan())
            })
            .collect();
        let n = keep.len();
        let p0 = 1 + covariates.ncols();
        if n <= p0 + 1 {
            return Err(ModelFitError::TooFewObservations {
                observed: n,
                parameters: p0 + 1,
            });
        }

        let y = Array1::from_iter(keep.iter().map(|&i| outcome[i]));
        let mut null_design = Array2::<f64>::zeros((n, p0));
        for (row, &i) in keep.iter().enumerate() {
            null_design[[row, 0]] = 1.0;
            for c in 0..covariates.ncols() {
                null_design[[row, 1 + c]] = covariates[[i, c]];
            }
        }
        let mut g = Array2::<f64>::zeros((n, q));
        for (row, &i) in keep.iter().enumerate() {
            for j in 0..q {
                g[[row, j]] = dosages[[i, j]];
            }
        }
        impute_column_means(&mut g);

        // Null model: residuals and per-sample residual variance.
        let (residuals, variance) = match outcome_kind {
            VariableKind::Continuous => {
                let xtx = null_design.t().dot(&null_design);
                let xty = null_design.t().dot(&y);
                let l = cholesky(&xtx).ok_or_else(|| {
                    ModelFitError::SingularDesign("null design is not positive definite".into())
                })?;
                let beta = chol_solve(&l, &xty);
                let fitted = null_design.dot(&beta);
                let residuals = &y - &fitted;
                let rss = residuals.iter().map(|r| r * r).sum::<f64>();
                let sigma2 = rss / (n - p0) as f64;
                if sigma2 <= 0.0 || !sigma2.is_finite() {
                    return Err(ModelFitError::ZeroVariance(
                        "outcome has no residual variance under the null model".into(),
                    ));
                }
                (residuals, Array1::from_elem(n, sigma2))
            }
            VariableKind::Discrete => {
                let n_cases = y.iter().filter(|&&v| v == 1.0).count();
                let n_controls = y.iter().filter(|&&v| v == 0.0).count();
                if n_cases + n_controls != n {
                    return Err(ModelFitError::Numeric(
                        "binary outcome holds values other than 0/1".into(),
                    ));
                }
                if n_cases == 0 || n_controls == 0 {
                    return Err(ModelFitError::ZeroVariance(
                        "outcome has no cases or no controls in the fitted sample".into(),
                    ));
                }
                let null = irls_fit(&null_design, &y)?;
                let residuals = &y - &null.mu;
                let variance = null.mu.mapv(|m| (m * (1.0 - m)).max(1e-12));
                (residuals, variance)
            }
        };

        let weights: Vec<f64> = mafs
            .iter()
            .map(|&maf| self.weights.weight(maf))
            .collect::<Result<_, _>>()?;

        // Score statistic Q = sum_j (w_j g_j . r)^2.
        let score = g.t().dot(&residuals);
        let q_stat: f64 = score
            .iter()
            .zip(weights.iter())
            .map(|(u, w)| (w * u) * (w * u))
            .sum();

        // Moments of the quadratic form from A = W G^T P G W with
        // P = V - V X (X^T V X)^-1 X^T V.
        let vg = scale_rows(&g, &variance);
        let gtvg = g.t().dot(&vg);
        let vx = scale_rows(&null_design, &variance);
        let xtvx = null_design.t().dot(&vx);
        let l = cholesky(&xtvx).ok_or_else(|| {
            ModelFitError::SingularDesign(
                "weighted null design is not positive definite".into(),
            )
        })?;
        let xtvx_inv = chol_inverse(&l);
        let b = g.t().dot(&vx); // q x p0
        let correction = b.dot(&xtvx_inv).dot(&b.t());
        let mut a = &gtvg - &correction;
        for j in 0..q {
            for k in 0..q {
                a[[j, k]] *= weights[j] * weights[k];
            }
        }

        let c1: f64 = (0..q).map(|j| a[[j, j]]).sum();
        let c2: f64 = a.iter().map(|v| v * v).sum();
        if !(c1 > 1e-12) || !(c2 > 1e-24) {
            return Err(ModelFitError::ZeroVariance(
                "variant set carries no variance after null-model projection".into(),
            ));
        }
        let kappa = c2 / c1;
        let df = c1 * c1 / c2;
        let chi = ChiSquared::new(df).map_err(|e| ModelFitError::Numeric(e.to_string()))?;
        let p_value = 1.0 - chi.cdf(q_stat / kappa);
        if !p_value.is_finite() {
            return Err(ModelFitError::Numeric(format!(
                "set test produced a non-finite p-value (Q = {})",
                q_stat
            )));
        }

        Ok(ModelFit {
            coefficient: None,
            std_error: None,
            ci_low: None,
            ci_high: None,
            p_value,
            n,
            diagnostics: json!({
                "q_stat": q_stat,
                "n_variants": q,
                "weights": self.weights.as_str(),
            }),
        })
    }
}

/// Replaces NaN entries of each column with the column's observed mean.
fn impute_column_means(g: &mut Array2<f64>) {
    for mut col in g.columns_mut() {
        let mut sum = 0.0;
        let mut count = 0usize;
        for &v in col.iter() {
            if !v.is_nan() {
                sum += v;
                count += 1;
            }
        }
        let mean = if count > 0 { sum / count as f64 } else { 0.0 };
        for v in col.iter_mut() {
            if v.is_nan() {
                *v = mean;
            }
        }
    }
}

/// Returns the matrix with row i scaled by `scale[i]`.
fn scale_rows(m: &Array2<f64>, scale: &Array1<f64>) -> Array2<f64> {
    let mut out = m.clone();
    for (i, mut row) in out.rows_mut().into_iter().enumerate() {
        row.mapv_inplace(|v| v * scale[i]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy_set() -> (Array1<f64>, Array2<f64>, Vec<f64>) {
        // 12 samples, 3 variants; the first variant tracks the outcome.
        let g = array![
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 1.0, 1.0],
            [2.0, 0.0, 0.0],
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0],
            [2.0, 0.0, 1.0],
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 1.0, 0.0],
        ];
        let y = array![
            1.1, 0.8, 2.2, 1.9, 4.1, 3.8, 0.9, 2.1, 4.2, 1.2, 2.0, 3.9
        ];
        let mafs = vec![0.4, 0.3, 0.15];
        (y, g, mafs)
    }

    #[test]
    fn continuous_set_test_produces_valid_p() {
        let (y, g, mafs) = toy_set();
        let covs = Array2::zeros((12, 0));
        let model = SkatModel::new(WeightScheme::Uniform);
        let fit = model
            .fit(y.view(), &g, &mafs, &covs, VariableKind::Continuous)
            .unwrap();
        assert!(fit.coefficient.is_none());
        assert!(fit.p_value > 0.0 && fit.p_value < 1.0);
        assert_eq!(fit.n, 12);
        assert_eq!(fit.diagnostics["n_variants"], 3);
    }

    #[test]
    fn binary_set_test_uses_logistic_null() {
        let (_, g, mafs) = toy_set();
        let y = array![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0];
        let covs = Array2::zeros((12, 0));
        let model = SkatModel::new(WeightScheme::RareBeta);
        let fit = model
            .fit(y.view(), &g, &mafs, &covs, VariableKind::Discrete)
            .unwrap();
        assert!(fit.p_value > 0.0 && fit.p_value <= 1.0);
    }

    #[test]
    fn constant_set_carries_no_variance() {
        let y = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let g = Array2::from_elem((6, 2), 1.0);
        let covs = Array2::zeros((6, 0));
        let model = SkatModel::new(WeightScheme::Uniform);
        let err = model
            .fit(y.view(), &g, &[0.2, 0.3], &covs, VariableKind::Continuous)
            .unwrap_err();
        assert!(matches!(err, ModelFitError::ZeroVariance(_)));
    }

    #[test]
    fn rare_weighting_upweights_low_maf() {
        let rare = WeightScheme::RareBeta.weight(0.01).unwrap();
        let common = WeightScheme::RareBeta.weight(0.3).unwrap();
        assert!(rare > common);
        assert_eq!(WeightScheme::Uniform.weight(0.01).unwrap(), 1.0);
    }
}
