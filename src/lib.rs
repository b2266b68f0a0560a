//! # Phenoscan
//!
//! Experiment execution engine for variant-phenotype association studies:
//! it fits statistical models (linear and logistic regression, a
//! variance-component set test) per variant-outcome pair over a cohort,
//! derives control exclusions from phenotype correlation, corrects for
//! multiple testing on demand and persists results in a queryable
//! relational store.
//!
//! ## Modules
//! - `variables`: typed registry of outcomes and covariates
//! - `providers`: genotype/phenotype data-source interfaces and in-memory
//!   implementations
//! - `exclusion`: outcome correlation and control-exclusion pre-pass
//! - `stats`: the closed model set {linear, logistic, skat}
//! - `scheduler`: task validation, unit enumeration and the worker pool
//! - `correction`: on-demand multiple-testing thresholds
//! - `store`: rusqlite-backed result persistence
//! - `experiment`: orchestration of a full run
//! - `simulate`: seeded synthetic cohorts for demos and tests

pub mod correction;
pub mod error;
pub mod exclusion;
pub mod experiment;
pub mod providers;
pub mod scheduler;
pub mod simulate;
pub mod stats;
pub mod store;
pub mod variables;

pub use correction::{Correction, CorrectionEngine};
pub use error::{ModelFitError, PhenoscanError, Result};
pub use exclusion::{CorrelationMatrix, ExclusionEngine, ExclusionSet, Exclusions};
pub use experiment::{Experiment, ExperimentOptions, ExperimentSummary};
pub use providers::{
    check_alignment, GenotypeProvider, InMemoryGenotypes, InMemoryPhenotypes, PhenotypeStore,
    UnitFilter, VariantInput, VariantRecord,
};
pub use scheduler::{
    CovariateSelection, OutcomeSelection, Task, TaskScheduler, TaskSpec, TaskStatus,
    UnitSelection, VariantSet,
};
pub use stats::{AnalysisModel, LinearModel, LogisticModel, ModelFit, ModelKind, SkatModel, WeightScheme};
pub use store::{OrderBy, ResultQuery, ResultRow, ResultStore, TestedEntity};
pub use variables::{Transformation, Variable, VariableCatalog, VariableKind, VariableSpec};
