//! Task scheduling over the variant x outcome space.
//!
//! A task is validated in full before any unit is dispatched; configuration
//! problems fail the task with a descriptive cause and zero work done.
//! Valid tasks enumerate their work units and push them through a
//! fixed-size pool of scoped worker threads. Workers share only read-only
//! data and send finished rows to the single aggregator, which owns the
//! store connection. Per-unit model failures become failed rows; the task
//! still completes and reports both counts. Model fits are deterministic,
//! so failed units are never retried.

use log::{error, info, warn};
use ndarray::{Array1, Array2};

use crate::error::{PhenoscanError, Result};
use crate::exclusion::Exclusions;
use crate::providers::{GenotypeProvider, PhenotypeStore, UnitFilter};
use crate::stats::{AnalysisModel, LinearModel, LogisticModel, ModelKind, Predictor, SkatModel, UnitData, WeightScheme};
use crate::store::{ResultRow, ResultStore, TestedEntity};
use crate::variables::{model_values, VariableCatalog, VariableKind};

/// Which outcomes a task covers. `All` is filtered down to the outcomes the
/// model can analyze; named outcomes of the wrong type are configuration
/// errors.
#[derive(Debug, Clone, Default)]
pub enum OutcomeSelection {
    #[default]
    All,
    Named(Vec<String>),
}

/// Which covariates enter the design. `Named(vec![])` means none.
#[derive(Debug, Clone, Default)]
pub enum CovariateSelection {
    #[default]
    All,
    Named(Vec<String>),
}

/// An externally-supplied variant grouping for the set test.
#[derive(Debug, Clone)]
pub struct VariantSet {
    pub id: String,
    pub variants: Vec<String>,
}

/// Units of analysis for a task: single variants for the regression
/// models, variant sets for the set test.
#[derive(Debug, Clone)]
pub enum UnitSelection {
    AllVariants(UnitFilter),
    Variants(Vec<String>),
    VariantSets(Vec<VariantSet>),
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub model: ModelKind,
    pub outcomes: OutcomeSelection,
    pub covariates: CovariateSelection,
    pub units: UnitSelection,
    /// Only consulted by the set test.
    pub weights: WeightScheme,
}

impl TaskSpec {
    pub fn linear(name: impl Into<String>) -> Self {
        Self::new(name, ModelKind::Linear)
    }

    pub fn logistic(name: impl Into<String>) -> Self {
        Self::new(name, ModelKind::Logistic)
    }

    pub fn skat(name: impl Into<String>, sets: Vec<VariantSet>) -> Self {
        let mut spec = Self::new(name, ModelKind::Skat);
        spec.units = UnitSelection::VariantSets(sets);
        spec
    }

    fn new(name: impl Into<String>, model: ModelKind) -> Self {
        Self {
            name: name.into(),
            model,
            outcomes: OutcomeSelection::All,
            covariates: CovariateSelection::All,
            units: UnitSelection::AllVariants(UnitFilter::default()),
            weights: WeightScheme::RareBeta,
        }
    }

    pub fn with_outcomes(mut self, outcomes: Vec<String>) -> Self {
        self.outcomes = OutcomeSelection::Named(outcomes);
        self
    }

    pub fn with_covariates(mut self, covariates: Vec<String>) -> Self {
        self.covariates = CovariateSelection::Named(covariates);
        self
    }

    pub fn with_units(mut self, units: UnitSelection) -> Self {
        self.units = units;
        self
    }

    pub fn with_weights(mut self, weights: WeightScheme) -> Self {
        self.weights = weights;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed { n_success: u64, n_failed: u64 },
    Failed { cause: String },
}

#[derive(Debug)]
pub struct Task {
    pub spec: TaskSpec,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            status: TaskStatus::Pending,
        }
    }
}

/// One outcome, prepared for modeling: transformed and exclusion-masked.
struct PreparedOutcome {
    name: String,
    kind: VariableKind,
    values: Array1<f64>,
}

/// The unit side of the enumerated product.
enum PlannedUnit {
    Variant(String),
    Set(VariantSet),
}

/// Everything workers need, fully resolved before dispatch.
struct TaskPlan {
    outcomes: Vec<PreparedOutcome>,
    covariates: Array2<f64>,
    units: Vec<PlannedUnit>,
}

/// (outcome index, unit index) into the plan.
type WorkItem = (usize, usize);

/// Dispatches tasks over a fixed-size worker pool.
pub struct TaskScheduler<'a> {
    genotypes: &'a dyn GenotypeProvider,
    phenotypes: &'a dyn PhenotypeStore,
    catalog: &'a VariableCatalog,
    exclusions: &'a Exclusions,
    cpu: usize,
}

impl<'a> TaskScheduler<'a> {
    pub fn new(
        genotypes: &'a dyn GenotypeProvider,
        phenotypes: &'a dyn PhenotypeStore,
        catalog: &'a VariableCatalog,
        exclusions: &'a Exclusions,
        cpu: usize,
    ) -> Self {
        Self {
            genotypes,
            phenotypes,
            catalog,
            exclusions,
            cpu: cpu.max(1),
        }
    }

    /// Runs one task through Pending -> Running -> {Completed, Failed}.
    /// Configuration errors fail the task without dispatching any unit;
    /// persistence errors abort the run.
    pub fn run_task(&self, task: &mut Task, store: &ResultStore) -> Result<()> {
        self.run_task_with(task, store, |_, _| {})
    }

    /// Like [`TaskScheduler::run_task`], invoking `on_progress(done, total)`
    /// as rows arrive at the aggregator.
    pub fn run_task_with(
        &self,
        task: &mut Task,
        store: &ResultStore,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<()> {
        task.status = TaskStatus::Running;
        info!("Task '{}' ({}): starting.", task.spec.name, task.spec.model.as_str());

        let plan = match self.plan(&task.spec) {
            Ok(plan) => plan,
            Err(PhenoscanError::Config { message }) => {
                error!("Task '{}' failed configuration: {}", task.spec.name, message);
                task.status = TaskStatus::Failed {
                    cause: message.clone(),
                };
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        let model = match task.spec.model {
            ModelKind::Linear => AnalysisModel::Linear(LinearModel),
            ModelKind::Logistic => AnalysisModel::Logistic(LogisticModel),
            ModelKind::Skat => AnalysisModel::Skat(SkatModel::new(task.spec.weights)),
        };

        let total = (plan.outcomes.len() * plan.units.len()) as u64;
        info!(
            "Task '{}': dispatching {} units ({} outcomes x {} units) across {} workers.",
            task.spec.name,
            total,
            plan.outcomes.len(),
            plan.units.len(),
            self.cpu
        );

        let (unit_tx, unit_rx) = flume::unbounded::<WorkItem>();
        let (row_tx, row_rx) = flume::unbounded::<ResultRow>();
        for outcome_idx in 0..plan.outcomes.len() {
            for unit_idx in 0..plan.units.len() {
                // The queue is unbounded and workers are not yet running:
                // sends cannot fail here.
                let _ = unit_tx.send((outcome_idx, unit_idx));
            }
        }
        drop(unit_tx);

        let mut n_success = 0u64;
        let mut n_failed = 0u64;
        let mut persist_error: Option<PhenoscanError> = None;

        let task_name = task.spec.name.clone();
        let genotypes = self.genotypes;
        let plan_ref = &plan;
        let model_ref = &model;

        std::thread::scope(|scope| {
            for _ in 0..self.cpu {
                let unit_rx = unit_rx.clone();
                let row_tx = row_tx.clone();
                let task_name = task_name.clone();
                scope.spawn(move || {
                    for item in unit_rx.iter() {
                        let row = compute_row(plan_ref, genotypes, model_ref, &task_name, item);
                        // A closed channel means the aggregator gave up;
                        // wind down instead of computing unwanted rows.
                        if row_tx.send(row).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(row_tx);
            drop(unit_rx);

            let mut done = 0u64;
            for row in row_rx.iter() {
                if row.is_failed {
                    n_failed += 1;
                } else {
                    n_success += 1;
                }
                if let Err(e) = store.append_result(&row) {
                    persist_error = Some(e);
                    break;
                }
                done += 1;
                on_progress(done, total);
            }
            // Closing the channel before the scope joins lets workers bail
            // out of any units still queued after an aborted aggregation.
            drop(row_rx);
        });

        if let Some(e) = persist_error {
            error!("Task '{}': aborting on store failure: {}", task.spec.name, e);
            task.status = TaskStatus::Failed {
                cause: format!("result store failure: {}", e),
            };
            return Err(e);
        }

        if n_failed > 0 {
            warn!(
                "Task '{}': {} units succeeded, {} failed (recorded as failed rows).",
                task.spec.name, n_success, n_failed
            );
        } else {
            info!("Task '{}': all {} units succeeded.", task.spec.name, n_success);
        }
        task.status = TaskStatus::Completed { n_success, n_failed };
        Ok(())
    }

    /// Resolves and validates the task configuration. Every error here
    /// precedes dispatch.
    fn plan(&self, spec: &TaskSpec) -> Result<TaskPlan> {
        // Outcomes: named ones must exist and match the model's outcome
        // type; `All` filters by eligibility.
        let eligible = |kind: VariableKind| match spec.model {
            ModelKind::Linear => kind == VariableKind::Continuous,
            ModelKind::Logistic => kind == VariableKind::Discrete,
            ModelKind::Skat => true,
        };
        let selected: Vec<&crate::variables::Variable> = match &spec.outcomes {
            OutcomeSelection::All => self
                .catalog
                .outcomes()
                .filter(|v| eligible(v.kind))
                .collect(),
            OutcomeSelection::Named(names) => {
                let mut vars = Vec::with_capacity(names.len());
                for name in names {
                    let var = self.catalog.require_outcome(name)?;
                    if !eligible(var.kind) {
                        return Err(PhenoscanError::config(format!(
                            "outcome '{}' is {} but the {} model requires a different type",
                            name,
                            var.kind.as_str(),
                            spec.model.as_str()
                        )));
                    }
                    vars.push(var);
                }
                vars
            }
        };
        if selected.is_empty() {
            return Err(PhenoscanError::config(format!(
                "no eligible outcomes for the {} model",
                spec.model.as_str()
            )));
        }

        let mut outcomes = Vec::with_capacity(selected.len());
        for var in selected {
            let raw = self.phenotypes.values(&var.name).ok_or_else(|| {
                PhenoscanError::config(format!(
                    "outcome '{}' disappeared from the phenotype store",
                    var.name
                ))
            })?;
            let mut values = model_values(var, raw);
            if var.kind == VariableKind::Discrete {
                if let Some(mask) = self.exclusions.control_mask(&var.name) {
                    let mut masked = 0usize;
                    for (i, &excluded) in mask.iter().enumerate() {
                        if excluded {
                            values[i] = f64::NAN;
                            masked += 1;
                        }
                    }
                    if masked > 0 {
                        info!(
                            "Outcome '{}': {} related-phenotype controls excluded.",
                            var.name, masked
                        );
                    }
                }
            }
            outcomes.push(PreparedOutcome {
                name: var.name.clone(),
                kind: var.kind,
                values,
            });
        }

        // Covariate matrix, one column per covariate, transformed.
        let covariate_vars: Vec<&crate::variables::Variable> = match &spec.covariates {
            CovariateSelection::All => self.catalog.covariates().collect(),
            CovariateSelection::Named(names) => names
                .iter()
                .map(|n| self.catalog.require_covariate(n))
                .collect::<Result<_>>()?,
        };
        let n_samples = self.phenotypes.samples().len();
        let mut covariates = Array2::<f64>::zeros((n_samples, covariate_vars.len()));
        for (c, var) in covariate_vars.iter().enumerate() {
            let raw = self.phenotypes.values(&var.name).ok_or_else(|| {
                PhenoscanError::config(format!(
                    "covariate '{}' disappeared from the phenotype store",
                    var.name
                ))
            })?;
            let values = model_values(var, raw);
            for i in 0..n_samples {
                covariates[[i, c]] = values[i];
            }
        }

        // Units: the regression models take single variants, the set test
        // takes variant sets.
        let units = match (&spec.units, spec.model) {
            (UnitSelection::VariantSets(_), ModelKind::Linear | ModelKind::Logistic) => {
                return Err(PhenoscanError::config(format!(
                    "the {} model analyzes single variants, not variant sets",
                    spec.model.as_str()
                )));
            }
            (UnitSelection::AllVariants(_) | UnitSelection::Variants(_), ModelKind::Skat) => {
                return Err(PhenoscanError::config(
                    "the skat model requires explicit variant sets".to_string(),
                ));
            }
            (UnitSelection::AllVariants(filter), _) => self
                .genotypes
                .list_units(filter)
                .into_iter()
                .map(PlannedUnit::Variant)
                .collect::<Vec<_>>(),
            (UnitSelection::Variants(names), _) => {
                for name in names {
                    if self.genotypes.metadata(name).is_none() {
                        return Err(PhenoscanError::config(format!(
                            "unknown variant '{}'",
                            name
                        )));
                    }
                }
                names.iter().cloned().map(PlannedUnit::Variant).collect()
            }
            (UnitSelection::VariantSets(sets), ModelKind::Skat) => {
                for set in sets {
                    if set.variants.is_empty() {
                        return Err(PhenoscanError::config(format!(
                            "variant set '{}' is empty",
                            set.id
                        )));
                    }
                    for name in &set.variants {
                        if self.genotypes.metadata(name).is_none() {
                            return Err(PhenoscanError::config(format!(
                                "unknown variant '{}' in set '{}'",
                                name, set.id
                            )));
                        }
                    }
                }
                sets.iter().cloned().map(PlannedUnit::Set).collect()
            }
        };
        if units.is_empty() {
            return Err(PhenoscanError::config(
                "task unit set is empty".to_string(),
            ));
        }

        Ok(TaskPlan {
            outcomes,
            covariates,
            units,
        })
    }
}

/// Computes one result row. Model failures land here as failed rows, never
/// as errors.
fn compute_row(
    plan: &TaskPlan,
    genotypes: &dyn GenotypeProvider,
    model: &AnalysisModel,
    task_name: &str,
    (outcome_idx, unit_idx): WorkItem,
) -> ResultRow {
    let outcome = &plan.outcomes[outcome_idx];
    let (tested_entity, entity_name, predictor) = match &plan.units[unit_idx] {
        PlannedUnit::Variant(name) => match genotypes.dosages(name) {
            Some(dosages) => (
                TestedEntity::Variant,
                name.clone(),
                Ok(Predictor::Dosage(dosages)),
            ),
            None => (
                TestedEntity::Variant,
                name.clone(),
                Err(format!("variant '{}' vanished from the provider", name)),
            ),
        },
        PlannedUnit::Set(set) => {
            let n = outcome.values.len();
            let mut dosages = Array2::<f64>::zeros((n, set.variants.len()));
            let mut mafs = Vec::with_capacity(set.variants.len());
            let mut missing = None;
            for (j, name) in set.variants.iter().enumerate() {
                match (genotypes.dosages(name), genotypes.metadata(name)) {
                    (Some(column), Some(record)) => {
                        for i in 0..n {
                            dosages[[i, j]] = column[i];
                        }
                        mafs.push(record.maf);
                    }
                    _ => {
                        missing = Some(format!(
                            "variant '{}' vanished from the provider",
                            name
                        ));
                        break;
                    }
                }
            }
            (
                TestedEntity::VariantSet,
                set.id.clone(),
                match missing {
                    None => Ok(Predictor::Set { dosages, mafs }),
                    Some(msg) => Err(msg),
                },
            )
        }
    };

    let base = ResultRow {
        task_name: task_name.to_string(),
        tested_entity,
        entity_name,
        phenotype: outcome.name.clone(),
        coefficient: None,
        std_error: None,
        ci_low: None,
        ci_high: None,
        p_value: None,
        n: 0,
        diagnostics: serde_json::Value::Null,
        is_failed: true,
        failure: None,
    };

    let predictor = match predictor {
        Ok(p) => p,
        Err(message) => {
            return ResultRow {
                failure: Some(message),
                ..base
            }
        }
    };

    let unit = UnitData {
        outcome: outcome.values.view(),
        outcome_kind: outcome.kind,
        covariates: &plan.covariates,
        predictor,
    };
    match model.fit_unit(&unit) {
        Ok(fit) => ResultRow {
            coefficient: fit.coefficient,
            std_error: fit.std_error,
            ci_low: fit.ci_low,
            ci_high: fit.ci_high,
            p_value: Some(fit.p_value),
            n: fit.n as u64,
            diagnostics: fit.diagnostics,
            is_failed: false,
            failure: None,
            ..base
        },
        Err(fit_error) => ResultRow {
            failure: Some(fit_error.to_string()),
            ..base
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusion::ExclusionEngine;
    use crate::providers::{InMemoryGenotypes, InMemoryPhenotypes, VariantInput};
    use crate::variables::VariableSpec;
    use ndarray::array;

    struct Fixture {
        genotypes: InMemoryGenotypes,
        phenotypes: InMemoryPhenotypes,
        catalog: VariableCatalog,
        exclusions: Exclusions,
    }

    fn fixture() -> Fixture {
        let samples: Vec<String> = (1..=8).map(|i| format!("sample{}", i)).collect();
        let genotypes = InMemoryGenotypes::new(
            samples.clone(),
            vec![
                VariantInput {
                    name: "snp1".into(),
                    chrom: "1".into(),
                    pos: 100,
                    minor: "A".into(),
                    major: "G".into(),
                    dosages: array![0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 1.0, 0.0],
                },
                VariantInput {
                    name: "snp2".into(),
                    chrom: "2".into(),
                    pos: 200,
                    minor: "C".into(),
                    major: "T".into(),
                    dosages: array![1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 2.0, 1.0],
                },
            ],
        )
        .unwrap();
        let phenotypes = InMemoryPhenotypes::new(
            samples,
            vec![
                (
                    "height".into(),
                    array![160.0, 170.0, 182.0, 158.0, 172.0, 181.0, 169.0, 163.0],
                ),
                (
                    "affected".into(),
                    array![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
                ),
            ],
        )
        .unwrap();
        let specs = vec![
            VariableSpec::continuous("height"),
            VariableSpec::discrete("affected"),
        ];
        let catalog = VariableCatalog::load(&specs, &phenotypes).unwrap();
        let engine = ExclusionEngine::new(&catalog, &phenotypes).unwrap();
        let corr = engine.correlation_matrix();
        let exclusions = engine.derive_exclusions(&corr, 0.8);
        Fixture {
            genotypes,
            phenotypes,
            catalog,
            exclusions,
        }
    }

    fn scheduler(fx: &Fixture, cpu: usize) -> TaskScheduler<'_> {
        TaskScheduler::new(
            &fx.genotypes,
            &fx.phenotypes,
            &fx.catalog,
            &fx.exclusions,
            cpu,
        )
    }

    #[test]
    fn linear_task_covers_the_product_space() {
        let fx = fixture();
        let store = ResultStore::open_in_memory().unwrap();
        let mut task = Task::new(TaskSpec::linear("lin1"));
        scheduler(&fx, 2).run_task(&mut task, &store).unwrap();

        match task.status {
            TaskStatus::Completed { n_success, n_failed } => {
                // One continuous outcome x two variants.
                assert_eq!(n_success + n_failed, 2);
            }
            ref other => panic!("unexpected status {:?}", other),
        }
        let rows = store
            .query(&crate::store::ResultQuery::task("lin1").include_failed())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.phenotype == "height"));
    }

    #[test]
    fn all_outcomes_filter_by_model_type() {
        let fx = fixture();
        let store = ResultStore::open_in_memory().unwrap();
        let mut task = Task::new(TaskSpec::logistic("log1"));
        scheduler(&fx, 1).run_task(&mut task, &store).unwrap();

        let rows = store
            .query(&crate::store::ResultQuery::task("log1").include_failed())
            .unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.phenotype == "affected"));
    }

    #[test]
    fn unknown_outcome_fails_before_dispatch() {
        let fx = fixture();
        let store = ResultStore::open_in_memory().unwrap();
        let mut task = Task::new(
            TaskSpec::linear("bad").with_outcomes(vec!["nonexistent".into()]),
        );
        scheduler(&fx, 1).run_task(&mut task, &store).unwrap();

        match &task.status {
            TaskStatus::Failed { cause } => assert!(cause.contains("nonexistent")),
            other => panic!("unexpected status {:?}", other),
        }
        let rows = store
            .query(&crate::store::ResultQuery::task("bad").include_failed())
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn wrong_outcome_type_fails_before_dispatch() {
        let fx = fixture();
        let store = ResultStore::open_in_memory().unwrap();
        let mut task = Task::new(
            TaskSpec::linear("bad").with_outcomes(vec!["affected".into()]),
        );
        scheduler(&fx, 1).run_task(&mut task, &store).unwrap();
        assert!(matches!(task.status, TaskStatus::Failed { .. }));
    }

    #[test]
    fn empty_unit_set_fails_before_dispatch() {
        let fx = fixture();
        let store = ResultStore::open_in_memory().unwrap();
        let mut task = Task::new(TaskSpec::linear("empty").with_units(
            UnitSelection::AllVariants(UnitFilter { min_maf: Some(0.9) }),
        ));
        scheduler(&fx, 1).run_task(&mut task, &store).unwrap();
        match &task.status {
            TaskStatus::Failed { cause } => assert!(cause.contains("empty")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn skat_task_requires_sets_and_regressions_reject_them() {
        let fx = fixture();
        let store = ResultStore::open_in_memory().unwrap();

        let mut bad_skat = Task::new(
            TaskSpec::skat("s1", vec![]).with_units(UnitSelection::AllVariants(
                UnitFilter::default(),
            )),
        );
        scheduler(&fx, 1).run_task(&mut bad_skat, &store).unwrap();
        assert!(matches!(bad_skat.status, TaskStatus::Failed { .. }));

        let mut bad_linear = Task::new(TaskSpec::linear("l1").with_units(
            UnitSelection::VariantSets(vec![VariantSet {
                id: "set1".into(),
                variants: vec!["snp1".into()],
            }]),
        ));
        scheduler(&fx, 1).run_task(&mut bad_linear, &store).unwrap();
        assert!(matches!(bad_linear.status, TaskStatus::Failed { .. }));
    }

    #[test]
    fn pool_size_does_not_change_the_row_set() {
        let fx = fixture();

        let collect = |cpu: usize| {
            let store = ResultStore::open_in_memory().unwrap();
            let mut task = Task::new(TaskSpec::linear("lin"));
            scheduler(&fx, cpu).run_task(&mut task, &store).unwrap();
            let mut rows: Vec<(String, String, Option<f64>)> = store
                .query(&crate::store::ResultQuery::task("lin").include_failed())
                .unwrap()
                .into_iter()
                .map(|r| (r.entity_name, r.phenotype, r.p_value))
                .collect();
            rows.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
            rows
        };

        assert_eq!(collect(1), collect(4));
    }
}
