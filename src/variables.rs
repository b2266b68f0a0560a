//! Typed registry of outcomes and covariates.
//!
//! Variables are declared up front (name, type, covariate flag, optional
//! transformation), then loaded against the phenotype store. Loading
//! validates the declaration, computes per-variable summary statistics and
//! freezes the catalog; variables are immutable afterwards.

use std::collections::HashMap;

use log::{debug, warn};
use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{PhenoscanError, Result};
use crate::providers::PhenotypeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Discrete,
    Continuous,
}

impl VariableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableKind::Discrete => "discrete",
            VariableKind::Continuous => "continuous",
        }
    }
}

/// Value transformation applied when a continuous variable is fetched for
/// modeling. Raw values stay untouched in the phenotype store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transformation {
    /// Natural log. Non-positive values become missing.
    Log,
    /// Rank-based inverse normal transform with the Blom offset (c = 3/8).
    InverseNormal,
}

impl Transformation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transformation::Log => "log",
            Transformation::InverseNormal => "inverse-normal-transform",
        }
    }
}

/// A variable as declared by the caller, before catalog load.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub name: String,
    pub kind: VariableKind,
    pub is_covariate: bool,
    pub transformation: Option<Transformation>,
}

impl VariableSpec {
    pub fn discrete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Discrete,
            is_covariate: false,
            transformation: None,
        }
    }

    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Continuous,
            is_covariate: false,
            transformation: None,
        }
    }

    pub fn covariate(mut self) -> Self {
        self.is_covariate = true;
        self
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = Some(transformation);
        self
    }
}

/// Summary statistics computed at catalog load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum VariableStats {
    Discrete { n_cases: u64, n_controls: u64 },
    Continuous { mean: f64, std: f64 },
}

/// A loaded, immutable variable. Serializable for the reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub is_covariate: bool,
    pub transformation: Option<Transformation>,
    pub n_missing: u64,
    pub stats: VariableStats,
}

impl Variable {
    /// Case prevalence among non-missing samples; discrete variables only.
    pub fn prevalence(&self) -> Option<f64> {
        match self.stats {
            VariableStats::Discrete { n_cases, n_controls } => {
                let total = n_cases + n_controls;
                (total > 0).then(|| n_cases as f64 / total as f64)
            }
            VariableStats::Continuous { .. } => None,
        }
    }
}

/// Frozen catalog of all experiment variables, indexed by name.
#[derive(Debug)]
pub struct VariableCatalog {
    variables: Vec<Variable>,
    by_name: HashMap<String, usize>,
}

impl VariableCatalog {
    /// Validates the declarations against the phenotype store, computes
    /// summary statistics and freezes the catalog.
    pub fn load(specs: &[VariableSpec], phenotypes: &dyn PhenotypeStore) -> Result<Self> {
        let mut variables = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());

        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(PhenoscanError::config(format!(
                    "duplicate variable declaration '{}'",
                    spec.name
                )));
            }
            let values = phenotypes.values(&spec.name).ok_or_else(|| {
                PhenoscanError::config(format!(
                    "variable '{}' is not present in the phenotype store",
                    spec.name
                ))
            })?;
            if spec.kind == VariableKind::Discrete && spec.transformation.is_some() {
                return Err(PhenoscanError::config(format!(
                    "discrete variable '{}' cannot carry a transformation",
                    spec.name
                )));
            }

            let n_missing = values.iter().filter(|v| v.is_nan()).count() as u64;
            let stats = match spec.kind {
                VariableKind::Discrete => {
                    let mut n_cases = 0u64;
                    let mut n_controls = 0u64;
                    for &v in values.iter() {
                        if v.is_nan() {
                            continue;
                        } else if v == 1.0 {
                            n_cases += 1;
                        } else if v == 0.0 {
                            n_controls += 1;
                        } else {
                            return Err(PhenoscanError::config(format!(
                                "discrete variable '{}' holds value {} (expected 0, 1 or missing)",
                                spec.name, v
                            )));
                        }
                    }
                    VariableStats::Discrete { n_cases, n_controls }
                }
                VariableKind::Continuous => {
                    let observed: Vec<f64> =
                        values.iter().copied().filter(|v| !v.is_nan()).collect();
                    if observed.is_empty() {
                        warn!(
                            "Continuous variable '{}' has no observed values.",
                            spec.name
                        );
                        VariableStats::Continuous {
                            mean: f64::NAN,
                            std: f64::NAN,
                        }
                    } else {
                        let n = observed.len() as f64;
                        let mean = observed.iter().sum::<f64>() / n;
                        let var =
                            observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                        VariableStats::Continuous {
                            mean,
                            std: var.sqrt(),
                        }
                    }
                }
            };

            debug!(
                "Loaded variable '{}' ({}, covariate: {}, missing: {}).",
                spec.name,
                spec.kind.as_str(),
                spec.is_covariate,
                n_missing
            );
            by_name.insert(spec.name.clone(), variables.len());
            variables.push(Variable {
                name: spec.name.clone(),
                kind: spec.kind,
                is_covariate: spec.is_covariate,
                transformation: spec.transformation,
                n_missing,
                stats,
            });
        }

        for name in phenotypes.variable_names() {
            if !by_name.contains_key(&name) {
                debug!(
                    "Phenotype store variable '{}' is not declared in this experiment.",
                    name
                );
            }
        }

        Ok(Self { variables, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.by_name.get(name).map(|&i| &self.variables[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    /// All non-covariate variables, in declaration order.
    pub fn outcomes(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| !v.is_covariate)
    }

    /// All covariates, in declaration order.
    pub fn covariates(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| v.is_covariate)
    }

    pub fn require_outcome(&self, name: &str) -> Result<&Variable> {
        let var = self.get(name).ok_or_else(|| {
            PhenoscanError::config(format!("unknown outcome '{}'", name))
        })?;
        if var.is_covariate {
            return Err(PhenoscanError::config(format!(
                "variable '{}' is declared as a covariate, not an outcome",
                name
            )));
        }
        Ok(var)
    }

    pub fn require_covariate(&self, name: &str) -> Result<&Variable> {
        let var = self.get(name).ok_or_else(|| {
            PhenoscanError::config(format!("unknown covariate '{}'", name))
        })?;
        if !var.is_covariate {
            return Err(PhenoscanError::config(format!(
                "variable '{}' is not declared as a covariate",
                name
            )));
        }
        Ok(var)
    }
}

/// Applies a transformation to a raw value vector. Missing values stay
/// missing; log of a non-positive value becomes missing as well.
pub fn apply_transformation(
    transformation: Transformation,
    values: ArrayView1<'_, f64>,
) -> Array1<f64> {
    match transformation {
        Transformation::Log => {
            let mut dropped = 0usize;
            let out = values.mapv(|v| {
                if v.is_nan() {
                    f64::NAN
                } else if v <= 0.0 {
                    dropped += 1;
                    f64::NAN
                } else {
                    v.ln()
                }
            });
            if dropped > 0 {
                warn!(
                    "Log transformation dropped {} non-positive values.",
                    dropped
                );
            }
            out
        }
        Transformation::InverseNormal => inverse_normal_transform(values),
    }
}

/// Rank-based inverse normal transform with the Blom offset:
/// `phi^-1((r - 3/8) / (n + 1/4))` over the observed values, ties ranked by
/// their average rank.
fn inverse_normal_transform(values: ArrayView1<'_, f64>) -> Array1<f64> {
    const C: f64 = 3.0 / 8.0;

    let observed: Vec<(usize, f64)> = values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .collect();
    let n = observed.len();
    let mut out = Array1::from_elem(values.len(), f64::NAN);
    if n == 0 {
        return out;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| observed[a].1.total_cmp(&observed[b].1));

    // Average ranks over tied runs, 1-based.
    let mut ranks = vec![0.0f64; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && observed[order[j + 1]].1 == observed[order[i]].1 {
            j += 1;
        }
        let avg = (i + 1 + j + 1) as f64 / 2.0;
        for k in i..=j {
            ranks[order[k]] = avg;
        }
        i = j + 1;
    }

    let normal = Normal::standard();
    let denom = n as f64 - 2.0 * C + 1.0;
    for (k, &(sample_idx, _)) in observed.iter().enumerate() {
        out[sample_idx] = normal.inverse_cdf((ranks[k] - C) / denom);
    }
    out
}

/// Fetches a variable's vector the way a model sees it: transformed when a
/// transformation is configured, raw otherwise.
pub fn model_values(variable: &Variable, raw: ArrayView1<'_, f64>) -> Array1<f64> {
    match variable.transformation {
        Some(t) => apply_transformation(t, raw),
        None => raw.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryPhenotypes;
    use ndarray::array;

    fn store(variables: Vec<(String, Array1<f64>)>) -> InMemoryPhenotypes {
        let samples = (1..=variables[0].1.len())
            .map(|i| format!("sample{}", i))
            .collect();
        InMemoryPhenotypes::new(samples, variables).unwrap()
    }

    #[test]
    fn load_computes_summaries_and_prevalence() {
        let store = store(vec![
            ("cc".into(), array![1.0, 0.0, 0.0, f64::NAN, 1.0]),
            ("bmi".into(), array![20.0, 24.0, 28.0, 24.0, f64::NAN]),
        ]);
        let catalog = VariableCatalog::load(
            &[VariableSpec::discrete("cc"), VariableSpec::continuous("bmi")],
            &store,
        )
        .unwrap();

        let cc = catalog.get("cc").unwrap();
        assert_eq!(cc.n_missing, 1);
        assert_eq!(cc.stats, VariableStats::Discrete { n_cases: 2, n_controls: 2 });
        assert_eq!(cc.prevalence(), Some(0.5));

        let bmi = catalog.get("bmi").unwrap();
        assert_eq!(bmi.prevalence(), None);
        match bmi.stats {
            VariableStats::Continuous { mean, std } => {
                assert!((mean - 24.0).abs() < 1e-12);
                assert!(std > 0.0);
            }
            ref other => panic!("unexpected stats {:?}", other),
        }
    }

    #[test]
    fn load_rejects_bad_discrete_coding() {
        let store = store(vec![("cc".into(), array![0.0, 1.0, 2.0])]);
        let err = VariableCatalog::load(&[VariableSpec::discrete("cc")], &store).unwrap_err();
        assert!(matches!(err, PhenoscanError::Config { .. }));
        assert!(err.to_string().contains("cc"));
    }

    #[test]
    fn load_rejects_transformation_on_discrete() {
        let store = store(vec![("cc".into(), array![0.0, 1.0, 0.0])]);
        let specs =
            [VariableSpec::discrete("cc").with_transformation(Transformation::Log)];
        let err = VariableCatalog::load(&specs, &store).unwrap_err();
        assert!(matches!(err, PhenoscanError::Config { .. }));
    }

    #[test]
    fn load_rejects_unknown_and_duplicate_names() {
        let store = store(vec![("bmi".into(), array![20.0, 24.0, 28.0])]);
        assert!(VariableCatalog::load(&[VariableSpec::continuous("weight")], &store).is_err());
        let dup = [
            VariableSpec::continuous("bmi"),
            VariableSpec::continuous("bmi"),
        ];
        assert!(VariableCatalog::load(&dup, &store).is_err());
    }

    #[test]
    fn log_transform_drops_non_positive() {
        let values = array![1.0, std::f64::consts::E, 0.0, -2.0, f64::NAN];
        let out = apply_transformation(Transformation::Log, values.view());
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 1.0).abs() < 1e-12);
        assert!(out[2].is_nan());
        assert!(out[3].is_nan());
        assert!(out[4].is_nan());
    }

    #[test]
    fn inverse_normal_preserves_order_and_centers() {
        let values = array![3.0, 1.0, 2.0, f64::NAN, 4.0];
        let out = apply_transformation(Transformation::InverseNormal, values.view());
        assert!(out[3].is_nan());
        assert!(out[1] < out[2] && out[2] < out[0] && out[0] < out[4]);
        // Symmetric ranks around the median transform to +/- pairs.
        assert!((out[1] + out[4]).abs() < 1e-12);
        assert!((out[2] + out[0]).abs() < 1e-12);
    }

    #[test]
    fn inverse_normal_averages_ties() {
        let values = array![1.0, 1.0, 2.0];
        let out = apply_transformation(Transformation::InverseNormal, values.view());
        assert_eq!(out[0], out[1]);
        assert!(out[0] < out[2]);
    }
}
