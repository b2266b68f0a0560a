//! Outcome-correlation pre-pass and derived control exclusions.
//!
//! Correlated phenotypes contaminate each other's control groups: a sample
//! affected by a condition related to the analyzed outcome is not a clean
//! control. Before any task runs, the engine computes the outcome
//! correlation matrix and, per discrete outcome, the set of samples to drop
//! from its control group. Correlation is computed on raw values; configured
//! transformations only apply when a model fetches a vector.

use std::collections::HashMap;

use log::{info, warn};
use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::error::{PhenoscanError, Result};
use crate::providers::PhenotypeStore;
use crate::variables::{VariableCatalog, VariableKind};

/// Pairwise Pearson correlation of the experiment outcomes, with the
/// outcome order it was computed in.
#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    pub names: Vec<String>,
    pub matrix: Array2<f64>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == a)?;
        let j = self.names.iter().position(|n| n == b)?;
        Some(self.matrix[[i, j]])
    }
}

/// Exclusion summary for one outcome: the related phenotypes and the union
/// count of samples removed from its control group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExclusionSet {
    pub phenotype: String,
    pub related: Vec<String>,
    pub n_excluded: u64,
    pub threshold: f64,
}

/// One normalized (phenotype, related) pair with its per-pair count, the
/// shape the result store persists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairExclusion {
    pub phenotype: String,
    pub related: String,
    pub n_excluded: u64,
}

/// Derived exclusions: per-outcome sets, persistable pair rows and the
/// boolean control masks the scheduler applies.
#[derive(Debug, Clone)]
pub struct Exclusions {
    pub threshold: f64,
    pub sets: Vec<ExclusionSet>,
    pub pairs: Vec<PairExclusion>,
    masks: HashMap<String, Vec<bool>>,
}

impl Exclusions {
    /// Mask over samples: true means the sample must be treated as missing
    /// when `outcome` is analyzed. Only discrete outcomes carry masks.
    pub fn control_mask(&self, outcome: &str) -> Option<&[bool]> {
        self.masks.get(outcome).map(|m| m.as_slice())
    }

    pub fn set_for(&self, outcome: &str) -> Option<&ExclusionSet> {
        self.sets.iter().find(|s| s.phenotype == outcome)
    }
}

/// Computes outcome correlation and derived exclusions. Runs single-threaded
/// before any task starts; requires the full phenotype matrix.
pub struct ExclusionEngine {
    names: Vec<String>,
    kinds: Vec<VariableKind>,
    vectors: Vec<Array1<f64>>,
}

impl ExclusionEngine {
    /// Collects the raw vector of every declared outcome.
    pub fn new(catalog: &VariableCatalog, phenotypes: &dyn PhenotypeStore) -> Result<Self> {
        let mut names = Vec::new();
        let mut kinds = Vec::new();
        let mut vectors = Vec::new();
        for outcome in catalog.outcomes() {
            let values = phenotypes.values(&outcome.name).ok_or_else(|| {
                PhenoscanError::config(format!(
                    "outcome '{}' disappeared from the phenotype store",
                    outcome.name
                ))
            })?;
            names.push(outcome.name.clone());
            kinds.push(outcome.kind);
            vectors.push(values.to_owned());
        }
        Ok(Self {
            names,
            kinds,
            vectors,
        })
    }

    /// N x N Pearson matrix over jointly non-missing samples per pair.
    /// Pairs with fewer than two joint observations or zero variance are
    /// undefined; they are logged and treated as non-correlated.
    pub fn correlation_matrix(&self) -> CorrelationMatrix {
        let n = self.names.len();
        let mut matrix = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in i..n {
                let r = if i == j {
                    match pearson(&self.vectors[i], &self.vectors[j]) {
                        Some(_) => 1.0,
                        None => {
                            warn!(
                                "Outcome '{}' has no variance; its self-correlation is undefined.",
                                self.names[i]
                            );
                            0.0
                        }
                    }
                } else {
                    match pearson(&self.vectors[i], &self.vectors[j]) {
                        Some(r) => r,
                        None => {
                            warn!(
                                "Correlation between '{}' and '{}' is undefined \
                                 (insufficient joint observations or zero variance); \
                                 treating as non-correlated.",
                                self.names[i], self.names[j]
                            );
                            0.0
                        }
                    }
                };
                matrix[[i, j]] = r;
                matrix[[j, i]] = r;
            }
        }
        CorrelationMatrix {
            names: self.names.clone(),
            matrix,
        }
    }

    /// Derives the symmetric related sets (|r| >= threshold) and the control
    /// exclusion masks for discrete outcomes.
    pub fn derive_exclusions(
        &self,
        corr: &CorrelationMatrix,
        threshold: f64,
    ) -> Exclusions {
        let n = self.names.len();
        let mut related: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if i != j && corr.matrix[[i, j]].abs() >= threshold {
                    related[i].push(j);
                }
            }
        }

        let mut sets = Vec::new();
        let mut pairs = Vec::new();
        let mut masks = HashMap::new();
        for i in 0..n {
            if related[i].is_empty() {
                continue;
            }

            let mut n_excluded = 0u64;
            if self.kinds[i] == VariableKind::Discrete {
                let values = &self.vectors[i];
                let mut mask = vec![false; values.len()];
                for &j in &related[i] {
                    if self.kinds[j] != VariableKind::Discrete {
                        continue;
                    }
                    let other = &self.vectors[j];
                    let mut pair_count = 0u64;
                    for s in 0..values.len() {
                        if values[s] == 0.0 && other[s] == 1.0 {
                            pair_count += 1;
                            if !mask[s] {
                                mask[s] = true;
                            }
                        }
                    }
                    pairs.push(PairExclusion {
                        phenotype: self.names[i].clone(),
                        related: self.names[j].clone(),
                        n_excluded: pair_count,
                    });
                }
                n_excluded = mask.iter().filter(|&&m| m).count() as u64;
                masks.insert(self.names[i].clone(), mask);
            }

            sets.push(ExclusionSet {
                phenotype: self.names[i].clone(),
                related: related[i].iter().map(|&j| self.names[j].clone()).collect(),
                n_excluded,
                threshold,
            });
        }

        info!(
            "Exclusion pre-pass: {} outcomes with related phenotypes at |r| >= {}.",
            sets.len(),
            threshold
        );
        Exclusions {
            threshold,
            sets,
            pairs,
            masks,
        }
    }
}

/// Pearson correlation restricted to jointly non-missing samples. `None`
/// when undefined (fewer than two joint observations or zero variance).
fn pearson(a: &Array1<f64>, b: &Array1<f64>) -> Option<f64> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (&x, &y) in a.iter().zip(b.iter()) {
        if !x.is_nan() && !y.is_nan() {
            xs.push(x);
            ys.push(y);
        }
    }
    let n = xs.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = xs.iter().sum::<f64>() / nf;
    let mean_y = ys.iter().sum::<f64>() / nf;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for k in 0..n {
        let dx = xs[k] - mean_x;
        let dy = ys[k] - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryPhenotypes;
    use crate::variables::VariableSpec;
    use ndarray::array;

    fn engine_for(
        variables: Vec<(String, Array1<f64>)>,
        specs: &[VariableSpec],
    ) -> ExclusionEngine {
        let samples = (1..=variables[0].1.len())
            .map(|i| format!("sample{}", i))
            .collect();
        let store = InMemoryPhenotypes::new(samples, variables).unwrap();
        let catalog = VariableCatalog::load(specs, &store).unwrap();
        ExclusionEngine::new(&catalog, &store).unwrap()
    }

    #[test]
    fn matrix_is_symmetric_with_unit_diagonal() {
        let engine = engine_for(
            vec![
                ("a".into(), array![1.0, 2.0, 3.0, 4.0, 5.0]),
                ("b".into(), array![2.0, 1.0, 4.0, 3.0, 6.0]),
                ("c".into(), array![-1.0, 0.5, 2.0, f64::NAN, 1.0]),
            ],
            &[
                VariableSpec::continuous("a"),
                VariableSpec::continuous("b"),
                VariableSpec::continuous("c"),
            ],
        );
        let corr = engine.correlation_matrix();
        for i in 0..3 {
            assert_eq!(corr.matrix[[i, i]], 1.0);
            for j in 0..3 {
                assert_eq!(corr.matrix[[i, j]], corr.matrix[[j, i]]);
            }
        }
    }

    #[test]
    fn undefined_pairs_are_non_correlated() {
        let engine = engine_for(
            vec![
                ("a".into(), array![1.0, 2.0, 3.0]),
                ("flat".into(), array![5.0, 5.0, 5.0]),
                ("sparse".into(), array![1.0, f64::NAN, f64::NAN]),
            ],
            &[
                VariableSpec::continuous("a"),
                VariableSpec::continuous("flat"),
                VariableSpec::continuous("sparse"),
            ],
        );
        let corr = engine.correlation_matrix();
        assert_eq!(corr.get("a", "flat"), Some(0.0));
        assert_eq!(corr.get("a", "sparse"), Some(0.0));
    }

    #[test]
    fn exclusion_is_symmetric_and_counts_affected_controls() {
        // Two discrete outcomes agreeing on 8 of 10 samples: r is high, and
        // each outcome's controls include exactly one case of the other.
        let a = array![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let b = array![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let engine = engine_for(
            vec![("a".into(), a), ("b".into(), b)],
            &[VariableSpec::discrete("a"), VariableSpec::discrete("b")],
        );
        let corr = engine.correlation_matrix();
        let r = corr.get("a", "b").unwrap();
        assert!(r > 0.5 && r < 1.0);

        let exclusions = engine.derive_exclusions(&corr, 0.5);
        let set_a = exclusions.set_for("a").unwrap();
        let set_b = exclusions.set_for("b").unwrap();
        assert_eq!(set_a.related, vec!["b".to_string()]);
        assert_eq!(set_b.related, vec!["a".to_string()]);
        assert_eq!(set_a.n_excluded, 1);
        assert_eq!(set_b.n_excluded, 1);

        let mask_a = exclusions.control_mask("a").unwrap();
        assert!(mask_a[9]);
        assert_eq!(mask_a.iter().filter(|&&m| m).count(), 1);
    }

    #[test]
    fn below_threshold_pairs_do_not_exclude() {
        let a = array![1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let b = array![0.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        let engine = engine_for(
            vec![("a".into(), a), ("b".into(), b)],
            &[VariableSpec::discrete("a"), VariableSpec::discrete("b")],
        );
        let corr = engine.correlation_matrix();
        let exclusions = engine.derive_exclusions(&corr, 0.99);
        assert!(exclusions.set_for("a").is_none());
        assert!(exclusions.control_mask("a").is_none());
    }
}
