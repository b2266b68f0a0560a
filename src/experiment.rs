//! Experiment orchestration.
//!
//! An experiment wires the data providers, the variable catalog, the
//! exclusion pre-pass and the result store together, then runs its tasks in
//! sequence. Construction order matters: sample alignment is verified
//! first, then variables and variants are registered, then exclusions are
//! derived from the full phenotype matrix. Only after all of that can any
//! task dispatch work.

use std::path::PathBuf;

use log::{info, warn};

use crate::correction::{Correction, CorrectionEngine};
use crate::error::Result;
use crate::exclusion::{CorrelationMatrix, ExclusionEngine, Exclusions};
use crate::providers::{check_alignment, GenotypeProvider, PhenotypeStore, UnitFilter};
use crate::scheduler::{Task, TaskScheduler, TaskSpec, TaskStatus};
use crate::store::ResultStore;
use crate::variables::{VariableCatalog, VariableSpec};

/// Knobs that are not data: worker pool size, exclusion threshold, default
/// correction method and store location.
#[derive(Debug, Clone)]
pub struct ExperimentOptions {
    pub cpu: usize,
    /// |r| at or above this marks two phenotypes as related.
    pub exclusion_threshold: f64,
    pub correction: Correction,
    /// Store location; in-memory when absent.
    pub db_path: Option<PathBuf>,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            cpu: 1,
            exclusion_threshold: 0.8,
            correction: Correction::Bonferroni,
            db_path: None,
        }
    }
}

/// Terminal task states after a run.
#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub tasks: Vec<(String, TaskStatus)>,
}

impl ExperimentSummary {
    pub fn n_completed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, s)| matches!(s, TaskStatus::Completed { .. }))
            .count()
    }

    pub fn n_failed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, s)| matches!(s, TaskStatus::Failed { .. }))
            .count()
    }
}

pub struct Experiment<'a> {
    name: String,
    genotypes: &'a dyn GenotypeProvider,
    phenotypes: &'a dyn PhenotypeStore,
    catalog: VariableCatalog,
    correlation: CorrelationMatrix,
    exclusions: Exclusions,
    store: ResultStore,
    tasks: Vec<Task>,
    options: ExperimentOptions,
}

impl std::fmt::Debug for Experiment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("catalog", &self.catalog)
            .field("correlation", &self.correlation)
            .field("exclusions", &self.exclusions)
            .field("store", &self.store)
            .field("tasks", &self.tasks)
            .field("options", &self.options)
            .finish()
    }
}

impl<'a> Experiment<'a> {
    pub fn new(
        name: impl Into<String>,
        genotypes: &'a dyn GenotypeProvider,
        phenotypes: &'a dyn PhenotypeStore,
        variable_specs: &[VariableSpec],
        task_specs: Vec<TaskSpec>,
        options: ExperimentOptions,
    ) -> Result<Self> {
        let name = name.into();
        info!("Setting up experiment '{}'.", name);

        // The alignment contract between the providers underwrites every
        // statistic downstream; verify it before touching anything else.
        check_alignment(genotypes, phenotypes)?;

        let mut store = match &options.db_path {
            Some(path) => ResultStore::open(path)?,
            None => ResultStore::open_in_memory()?,
        };

        let catalog = VariableCatalog::load(variable_specs, phenotypes)?;
        store.insert_variables(catalog.iter())?;

        let unit_names = genotypes.list_units(&UnitFilter::default());
        let records: Vec<_> = unit_names
            .iter()
            .filter_map(|name| genotypes.metadata(name))
            .collect();
        store.insert_variants(records.iter().copied())?;

        let engine = ExclusionEngine::new(&catalog, phenotypes)?;
        let correlation = engine.correlation_matrix();
        let exclusions = engine.derive_exclusions(&correlation, options.exclusion_threshold);
        store.insert_exclusions(&exclusions)?;

        let tasks = task_specs.into_iter().map(Task::new).collect();
        Ok(Self {
            name,
            genotypes,
            phenotypes,
            catalog,
            correlation,
            exclusions,
            store,
            tasks,
            options,
        })
    }

    /// Runs every task in sequence. Configuration failures are contained to
    /// their task; alignment and persistence failures abort the run.
    pub fn run(&mut self) -> Result<ExperimentSummary> {
        self.run_with(|_, _, _| {})
    }

    /// Like [`Experiment::run`], reporting per-task progress as
    /// `(task_name, done_units, total_units)`.
    pub fn run_with(
        &mut self,
        mut on_progress: impl FnMut(&str, u64, u64),
    ) -> Result<ExperimentSummary> {
        let scheduler = TaskScheduler::new(
            self.genotypes,
            self.phenotypes,
            &self.catalog,
            &self.exclusions,
            self.options.cpu,
        );
        for task in &mut self.tasks {
            let task_name = task.spec.name.clone();
            scheduler.run_task_with(task, &self.store, |done, total| {
                on_progress(&task_name, done, total)
            })?;
        }

        let summary = ExperimentSummary {
            tasks: self
                .tasks
                .iter()
                .map(|t| (t.spec.name.clone(), t.status.clone()))
                .collect(),
        };
        if summary.n_failed() > 0 {
            warn!(
                "Experiment '{}': {} of {} tasks failed.",
                self.name,
                summary.n_failed(),
                summary.tasks.len()
            );
        } else {
            info!(
                "Experiment '{}': {} tasks completed.",
                self.name,
                summary.tasks.len()
            );
        }
        Ok(summary)
    }

    /// Corrected significance threshold for one task, using the
    /// experiment's configured method over the live result counts.
    pub fn threshold(&self, task: &str, alpha: f64) -> Result<f64> {
        CorrectionEngine::new(&self.store).threshold(task, alpha, self.options.correction)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn catalog(&self) -> &VariableCatalog {
        &self.catalog
    }

    pub fn correlation(&self) -> &CorrelationMatrix {
        &self.correlation
    }

    pub fn exclusions(&self) -> &Exclusions {
        &self.exclusions
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{InMemoryGenotypes, InMemoryPhenotypes, VariantInput};
    use ndarray::array;

    fn samples(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("sample{}", i)).collect()
    }

    #[test]
    fn construction_registers_variables_and_variants() {
        let genotypes = InMemoryGenotypes::new(
            samples(6),
            vec![VariantInput {
                name: "snp1".into(),
                chrom: "1".into(),
                pos: 42,
                minor: "A".into(),
                major: "G".into(),
                dosages: array![0.0, 1.0, 2.0, 0.0, 1.0, 1.0],
            }],
        )
        .unwrap();
        let phenotypes = InMemoryPhenotypes::new(
            samples(6),
            vec![("bmi".into(), array![22.0, 25.0, 31.0, 20.0, 27.0, 24.5])],
        )
        .unwrap();

        let experiment = Experiment::new(
            "exp",
            &genotypes,
            &phenotypes,
            &[VariableSpec::continuous("bmi")],
            vec![],
            ExperimentOptions::default(),
        )
        .unwrap();

        let variant = experiment.store().variant("snp1").unwrap().unwrap();
        assert_eq!(variant.chrom, "1");
        assert!(experiment.catalog().get("bmi").is_some());
    }

    #[test]
    fn misaligned_providers_abort_construction() {
        let genotypes = InMemoryGenotypes::new(samples(4), vec![]).unwrap();
        let phenotypes = InMemoryPhenotypes::new(samples(5), vec![]).unwrap();
        let err = Experiment::new(
            "exp",
            &genotypes,
            &phenotypes,
            &[],
            vec![],
            ExperimentOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::PhenoscanError::Alignment { .. }));
    }
}
