//! Data-source interfaces and their eager in-memory implementations.
//!
//! The engine never parses files; it consumes a [`GenotypeProvider`] and a
//! [`PhenotypeStore`]. Both must present sample vectors in an identical,
//! stable order for the whole run. This is a documented contract that
//! [`check_alignment`] verifies defensively before any scheduling happens.
//! The in-memory containers are the deliberate simplicity tradeoff for
//! small inputs; a streaming or indexed source plugs in behind the same
//! traits.

use std::collections::HashMap;

use log::{debug, info, warn};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{PhenoscanError, Result};

/// Immutable per-variant record: identity plus the summary statistics
/// computed when the container is built. Serializable for the reporting
/// layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantRecord {
    pub name: String,
    pub chrom: String,
    pub pos: u64,
    pub minor: String,
    pub major: String,
    pub mac: u64,
    pub maf: f64,
    pub n_missing: u64,
    pub n_non_missing: u64,
}

/// Filter applied when listing units of analysis.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitFilter {
    /// Keep only variants with MAF >= this floor.
    pub min_maf: Option<f64>,
}

/// Supplies aligned dosage vectors and variant metadata.
pub trait GenotypeProvider: Send + Sync {
    /// Sample identifiers, in the fixed order every dosage vector follows.
    fn samples(&self) -> &[String];

    /// Per-sample expected minor-allele dosage for one variant, aligned to
    /// [`GenotypeProvider::samples`]. Missing genotypes are NaN.
    fn dosages(&self, name: &str) -> Option<ArrayView1<'_, f64>>;

    fn metadata(&self, name: &str) -> Option<&VariantRecord>;

    /// Variant names passing the filter, in container order.
    fn list_units(&self, filter: &UnitFilter) -> Vec<String>;
}

/// Supplies aligned phenotype/covariate value vectors.
pub trait PhenotypeStore: Send + Sync {
    /// Sample identifiers, in the fixed order every value vector follows.
    fn samples(&self) -> &[String];

    /// Raw values for one variable, aligned to [`PhenotypeStore::samples`].
    /// Missing values are NaN.
    fn values(&self, name: &str) -> Option<ArrayView1<'_, f64>>;

    fn variable_names(&self) -> Vec<String>;
}

/// Compares the sample fingerprints of both providers. A count or order
/// mismatch means every downstream statistic would be silently corrupted,
/// so it aborts the run.
pub fn check_alignment(
    genotypes: &dyn GenotypeProvider,
    phenotypes: &dyn PhenotypeStore,
) -> Result<()> {
    let geno = genotypes.samples();
    let pheno = phenotypes.samples();
    if geno.len() != pheno.len() {
        return Err(PhenoscanError::alignment(format!(
            "genotype provider has {} samples but phenotype store has {}",
            geno.len(),
            pheno.len()
        )));
    }
    for (idx, (g, p)) in geno.iter().zip(pheno.iter()).enumerate() {
        if g != p {
            return Err(PhenoscanError::alignment(format!(
                "sample order diverges at index {}: genotype '{}' vs phenotype '{}'",
                idx, g, p
            )));
        }
    }
    debug!("Sample alignment verified for {} samples.", geno.len());
    Ok(())
}

/// Variant identity and dosages as supplied by the caller; summary
/// statistics are computed at container build time.
#[derive(Debug, Clone)]
pub struct VariantInput {
    pub name: String,
    pub chrom: String,
    pub pos: u64,
    pub minor: String,
    pub major: String,
    pub dosages: Array1<f64>,
}

/// Eager genotype container holding every dosage vector in memory.
pub struct InMemoryGenotypes {
    samples: Vec<String>,
    order: Vec<String>,
    records: HashMap<String, (VariantRecord, Array1<f64>)>,
}

impl InMemoryGenotypes {
    pub fn new(samples: Vec<String>, variants: Vec<VariantInput>) -> Result<Self> {
        let n_samples = samples.len();
        for input in &variants {
            if input.dosages.len() != n_samples {
                return Err(PhenoscanError::alignment(format!(
                    "variant '{}' carries {} dosages for {} samples",
                    input.name,
                    input.dosages.len(),
                    n_samples
                )));
            }
        }

        // Summary statistics per variant are independent; computed in
        // parallel over the container the same way the rest of the engine
        // treats dosage data: read-only, sample-aligned.
        let summarized: Vec<(String, VariantRecord, Array1<f64>)> = variants
            .into_par_iter()
            .map(|input| {
                let record = summarize_variant(&input);
                (input.name, record, input.dosages)
            })
            .collect();

        let mut order = Vec::with_capacity(summarized.len());
        let mut records = HashMap::with_capacity(summarized.len());
        for (name, record, dosages) in summarized {
            if records.insert(name.clone(), (record, dosages)).is_some() {
                return Err(PhenoscanError::config(format!(
                    "duplicate variant '{}' in genotype container",
                    name
                )));
            }
            order.push(name);
        }

        info!(
            "In-memory genotype container ready: {} variants x {} samples.",
            order.len(),
            n_samples
        );
        Ok(Self {
            samples,
            order,
            records,
        })
    }
}

fn summarize_variant(input: &VariantInput) -> VariantRecord {
    let mut total_dosage = 0.0f64;
    let mut n_non_missing = 0u64;
    for &d in input.dosages.iter() {
        if !d.is_nan() {
            total_dosage += d;
            n_non_missing += 1;
        }
    }
    let n_missing = input.dosages.len() as u64 - n_non_missing;

    let (mut minor, mut major) = (input.minor.clone(), input.major.clone());
    let total_alleles = 2.0 * n_non_missing as f64;
    let (mac, maf) = if n_non_missing == 0 {
        warn!("Variant '{}' has no observed genotypes.", input.name);
        (0, 0.0)
    } else {
        let mut minor_count = total_dosage;
        if minor_count > total_alleles - minor_count {
            // The declared minor allele is actually the major one; flip the
            // labels so maf stays <= 0.5.
            debug!(
                "Variant '{}': declared minor allele '{}' is the major allele; swapping.",
                input.name, minor
            );
            std::mem::swap(&mut minor, &mut major);
            minor_count = total_alleles - minor_count;
        }
        ((minor_count.round()) as u64, minor_count / total_alleles)
    };

    VariantRecord {
        name: input.name.clone(),
        chrom: input.chrom.clone(),
        pos: input.pos,
        minor,
        major,
        mac,
        maf,
        n_missing,
        n_non_missing,
    }
}

impl GenotypeProvider for InMemoryGenotypes {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn dosages(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.records.get(name).map(|(_, d)| d.view())
    }

    fn metadata(&self, name: &str) -> Option<&VariantRecord> {
        self.records.get(name).map(|(r, _)| r)
    }

    fn list_units(&self, filter: &UnitFilter) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| match filter.min_maf {
                Some(floor) => self.records[name.as_str()].0.maf >= floor,
                None => true,
            })
            .cloned()
            .collect()
    }
}

/// Eager phenotype container; variable vectors keyed by name, in insertion
/// order.
pub struct InMemoryPhenotypes {
    samples: Vec<String>,
    order: Vec<String>,
    values: HashMap<String, Array1<f64>>,
}

impl InMemoryPhenotypes {
    pub fn new(samples: Vec<String>, variables: Vec<(String, Array1<f64>)>) -> Result<Self> {
        let n_samples = samples.len();
        let mut order = Vec::with_capacity(variables.len());
        let mut values = HashMap::with_capacity(variables.len());
        for (name, vector) in variables {
            if vector.len() != n_samples {
                return Err(PhenoscanError::alignment(format!(
                    "variable '{}' carries {} values for {} samples",
                    name,
                    vector.len(),
                    n_samples
                )));
            }
            if values.insert(name.clone(), vector).is_some() {
                return Err(PhenoscanError::config(format!(
                    "duplicate variable '{}' in phenotype store",
                    name
                )));
            }
            order.push(name);
        }
        Ok(Self {
            samples,
            order,
            values,
        })
    }
}

impl PhenotypeStore for InMemoryPhenotypes {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn values(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.values.get(name).map(|v| v.view())
    }

    fn variable_names(&self) -> Vec<String> {
        self.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("sample{}", i)).collect()
    }

    #[test]
    fn variant_summary_holds_maf_invariant() {
        let genotypes = InMemoryGenotypes::new(
            sample_names(5),
            vec![VariantInput {
                name: "snp1".into(),
                chrom: "1".into(),
                pos: 1234,
                minor: "A".into(),
                major: "G".into(),
                dosages: array![0.0, 1.0, 2.0, 0.0, f64::NAN],
            }],
        )
        .unwrap();

        let record = genotypes.metadata("snp1").unwrap();
        assert_eq!(record.n_missing, 1);
        assert_eq!(record.n_non_missing, 4);
        assert_eq!(record.mac, 3);
        assert!((record.maf - record.mac as f64 / (2.0 * record.n_non_missing as f64)).abs() < 1e-12);
        assert!(record.maf <= 0.5);
    }

    #[test]
    fn variant_summary_swaps_misdeclared_minor_allele() {
        let genotypes = InMemoryGenotypes::new(
            sample_names(3),
            vec![VariantInput {
                name: "snp1".into(),
                chrom: "1".into(),
                pos: 1,
                minor: "A".into(),
                major: "G".into(),
                dosages: array![2.0, 2.0, 1.0],
            }],
        )
        .unwrap();

        let record = genotypes.metadata("snp1").unwrap();
        assert_eq!(record.minor, "G");
        assert_eq!(record.major, "A");
        assert_eq!(record.mac, 1);
        assert!(record.maf <= 0.5);
    }

    #[test]
    fn unit_filter_applies_maf_floor() {
        let genotypes = InMemoryGenotypes::new(
            sample_names(4),
            vec![
                VariantInput {
                    name: "common".into(),
                    chrom: "1".into(),
                    pos: 1,
                    minor: "A".into(),
                    major: "G".into(),
                    dosages: array![1.0, 1.0, 0.0, 1.0],
                },
                VariantInput {
                    name: "rare".into(),
                    chrom: "1".into(),
                    pos: 2,
                    minor: "C".into(),
                    major: "T".into(),
                    dosages: array![0.0, 0.0, 0.0, 1.0],
                },
            ],
        )
        .unwrap();

        let all = genotypes.list_units(&UnitFilter::default());
        assert_eq!(all, vec!["common".to_string(), "rare".to_string()]);
        let filtered = genotypes.list_units(&UnitFilter { min_maf: Some(0.2) });
        assert_eq!(filtered, vec!["common".to_string()]);
    }

    #[test]
    fn alignment_mismatch_is_fatal() {
        let genotypes = InMemoryGenotypes::new(sample_names(3), Vec::new()).unwrap();
        let mut shuffled = sample_names(3);
        shuffled.swap(0, 2);
        let phenotypes = InMemoryPhenotypes::new(shuffled, Vec::new()).unwrap();

        let err = check_alignment(&genotypes, &phenotypes).unwrap_err();
        assert!(matches!(err, PhenoscanError::Alignment { .. }));
        assert!(err.to_string().contains("index 0"));
    }
}
