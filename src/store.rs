//! Relational persistence for one experiment.
//!
//! Four normalized tables (variables, variants, results, exclusions) in a
//! single SQLite database per experiment. The write path is append-only
//! (one insert per completed unit); the read path filters and sorts at
//! query time so a changed correction threshold is reflected immediately.

use std::path::Path;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;
use crate::exclusion::{Exclusions, PairExclusion};
use crate::providers::VariantRecord;
use crate::variables::{Variable, VariableStats};

/// What a result row was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestedEntity {
    Variant,
    VariantSet,
}

impl TestedEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestedEntity::Variant => "variant",
            TestedEntity::VariantSet => "variant_set",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "variant_set" => TestedEntity::VariantSet,
            _ => TestedEntity::Variant,
        }
    }
}

/// One immutable experiment result, keyed by (task, entity, phenotype).
/// Serializable for the reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRow {
    pub task_name: String,
    pub tested_entity: TestedEntity,
    pub entity_name: String,
    pub phenotype: String,
    pub coefficient: Option<f64>,
    pub std_error: Option<f64>,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub p_value: Option<f64>,
    pub n: u64,
    pub diagnostics: serde_json::Value,
    pub is_failed: bool,
    pub failure: Option<String>,
}

/// Sortable result columns; a closed set so queries never interpolate
/// caller strings into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    PValue,
    Coefficient,
    EntityName,
    Phenotype,
    N,
}

impl OrderBy {
    fn column(&self) -> &'static str {
        match self {
            OrderBy::PValue => "p_value",
            OrderBy::Coefficient => "coefficient",
            OrderBy::EntityName => "entity_name",
            OrderBy::Phenotype => "phenotype",
            OrderBy::N => "n",
        }
    }
}

/// Query over one task's rows. Failed rows are excluded unless requested.
#[derive(Debug, Clone)]
pub struct ResultQuery {
    pub task: String,
    pub order_by: Option<OrderBy>,
    pub ascending: bool,
    pub p_threshold: Option<f64>,
    pub include_failed: bool,
}

impl ResultQuery {
    pub fn task(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            order_by: None,
            ascending: true,
            p_threshold: None,
            include_failed: false,
        }
    }

    pub fn order_by(mut self, column: OrderBy, ascending: bool) -> Self {
        self.order_by = Some(column);
        self.ascending = ascending;
        self
    }

    pub fn p_threshold(mut self, threshold: f64) -> Self {
        self.p_threshold = Some(threshold);
        self
    }

    pub fn include_failed(mut self) -> Self {
        self.include_failed = true;
        self
    }
}

/// SQLite-backed store for one experiment.
#[derive(Debug)]
pub struct ResultStore {
    conn: Connection,
}

impl ResultStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        debug!(
            "Opened result store at {} (journal mode: {}).",
            db_path.as_ref().display(),
            journal_mode
        );
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS variables (
                name TEXT PRIMARY KEY,
                variable_type TEXT NOT NULL,
                is_covariate INTEGER NOT NULL,
                transformation TEXT,
                n_missing INTEGER NOT NULL,
                n_cases INTEGER,
                n_controls INTEGER,
                mean REAL,
                std REAL
            );
            CREATE TABLE IF NOT EXISTS variants (
                name TEXT PRIMARY KEY,
                chrom TEXT NOT NULL,
                pos INTEGER NOT NULL,
                minor TEXT NOT NULL,
                major TEXT NOT NULL,
                mac INTEGER NOT NULL,
                maf REAL NOT NULL,
                n_missing INTEGER NOT NULL,
                n_non_missing INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS results (
                task_name TEXT NOT NULL,
                tested_entity TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                phenotype TEXT NOT NULL,
                coefficient REAL,
                std_error REAL,
                ci_low REAL,
                ci_high REAL,
                p_value REAL,
                n INTEGER NOT NULL,
                diagnostics TEXT NOT NULL,
                is_failed INTEGER NOT NULL,
                failure TEXT,
                PRIMARY KEY (task_name, entity_name, phenotype)
            );
            CREATE INDEX IF NOT EXISTS idx_results_task ON results(task_name);
            CREATE INDEX IF NOT EXISTS idx_results_p_value ON results(p_value);
            CREATE TABLE IF NOT EXISTS exclusions (
                phenotype TEXT NOT NULL,
                related TEXT NOT NULL,
                n_excluded INTEGER NOT NULL,
                threshold REAL NOT NULL,
                PRIMARY KEY (phenotype, related)
            );",
        )?;
        Ok(())
    }

    /// Registers the frozen variable catalog.
    pub fn insert_variables<'a>(
        &mut self,
        variables: impl IntoIterator<Item = &'a Variable>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut count = 0usize;
        for var in variables {
            let (n_cases, n_controls, mean, std) = match var.stats {
                VariableStats::Discrete { n_cases, n_controls } => {
                    (Some(n_cases as i64), Some(n_controls as i64), None, None)
                }
                VariableStats::Continuous { mean, std } => {
                    (None, None, Some(mean), Some(std))
                }
            };
            tx.execute(
                "INSERT INTO variables
                 (name, variable_type, is_covariate, transformation,
                  n_missing, n_cases, n_controls, mean, std)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    var.name,
                    var.kind.as_str(),
                    var.is_covariate as i64,
                    var.transformation.map(|t| t.as_str()),
                    var.n_missing as i64,
                    n_cases,
                    n_controls,
                    mean,
                    std,
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        info!("Registered {} variables.", count);
        Ok(())
    }

    pub fn insert_variants<'a>(
        &mut self,
        variants: impl IntoIterator<Item = &'a VariantRecord>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut count = 0usize;
        for rec in variants {
            tx.execute(
                "INSERT INTO variants
                 (name, chrom, pos, minor, major, mac, maf, n_missing, n_non_missing)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rec.name,
                    rec.chrom,
                    rec.pos as i64,
                    rec.minor,
                    rec.major,
                    rec.mac as i64,
                    rec.maf,
                    rec.n_missing as i64,
                    rec.n_non_missing as i64,
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        info!("Registered {} variants.", count);
        Ok(())
    }

    /// Persists the derived exclusions as normalized (phenotype, related)
    /// pair rows.
    pub fn insert_exclusions(&mut self, exclusions: &Exclusions) -> Result<()> {
        let tx = self.conn.transaction()?;
        for pair in &exclusions.pairs {
            tx.execute(
                "INSERT INTO exclusions (phenotype, related, n_excluded, threshold)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    pair.phenotype,
                    pair.related,
                    pair.n_excluded as i64,
                    exclusions.threshold,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Appends one result row. Rows are immutable; a duplicate key is a
    /// persistence error, never an update.
    pub fn append_result(&self, row: &ResultRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO results
             (task_name, tested_entity, entity_name, phenotype, coefficient,
              std_error, ci_low, ci_high, p_value, n, diagnostics, is_failed, failure)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                row.task_name,
                row.tested_entity.as_str(),
                row.entity_name,
                row.phenotype,
                row.coefficient,
                row.std_error,
                row.ci_low,
                row.ci_high,
                row.p_value,
                row.n as i64,
                row.diagnostics.to_string(),
                row.is_failed as i64,
                row.failure,
            ],
        )?;
        Ok(())
    }

    /// Filtered, sorted view over one task's rows, computed at query time.
    pub fn query(&self, query: &ResultQuery) -> Result<Vec<ResultRow>> {
        let mut sql = String::from(
            "SELECT task_name, tested_entity, entity_name, phenotype, coefficient,
                    std_error, ci_low, ci_high, p_value, n, diagnostics, is_failed, failure
             FROM results WHERE task_name = ?1",
        );
        if !query.include_failed {
            sql.push_str(" AND is_failed = 0");
        }
        if query.p_threshold.is_some() {
            sql.push_str(" AND p_value <= ?2");
        }
        if let Some(order) = query.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order.column());
            sql.push_str(if query.ascending { " ASC" } else { " DESC" });
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ResultRow> {
            let entity: String = row.get(1)?;
            let diagnostics: String = row.get(10)?;
            Ok(ResultRow {
                task_name: row.get(0)?,
                tested_entity: TestedEntity::from_str(&entity),
                entity_name: row.get(2)?,
                phenotype: row.get(3)?,
                coefficient: row.get(4)?,
                std_error: row.get(5)?,
                ci_low: row.get(6)?,
                ci_high: row.get(7)?,
                p_value: row.get(8)?,
                n: row.get::<_, i64>(9)? as u64,
                diagnostics: serde_json::from_str(&diagnostics)
                    .unwrap_or(serde_json::Value::Null),
                is_failed: row.get::<_, i64>(11)? != 0,
                failure: row.get(12)?,
            })
        };

        let rows = match query.p_threshold {
            Some(threshold) => stmt
                .query_map(params![query.task, threshold], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![query.task], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Live count of non-failed rows for a task; the correction denominator.
    pub fn count_successful(&self, task: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM results WHERE task_name = ?1 AND is_failed = 0",
            params![task],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_failed(&self, task: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM results WHERE task_name = ?1 AND is_failed = 1",
            params![task],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn distinct_tasks(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT task_name FROM results ORDER BY task_name")?;
        let tasks = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tasks)
    }

    /// Variant metadata for reporting joins.
    pub fn variant(&self, name: &str) -> Result<Option<VariantRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT name, chrom, pos, minor, major, mac, maf, n_missing, n_non_missing
                 FROM variants WHERE name = ?1",
                params![name],
                |row| {
                    Ok(VariantRecord {
                        name: row.get(0)?,
                        chrom: row.get(1)?,
                        pos: row.get::<_, i64>(2)? as u64,
                        minor: row.get(3)?,
                        major: row.get(4)?,
                        mac: row.get::<_, i64>(5)? as u64,
                        maf: row.get(6)?,
                        n_missing: row.get::<_, i64>(7)? as u64,
                        n_non_missing: row.get::<_, i64>(8)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Persisted exclusion pairs, grouped the way they were derived.
    pub fn exclusion_pairs(&self) -> Result<Vec<PairExclusion>> {
        let mut stmt = self.conn.prepare(
            "SELECT phenotype, related, n_excluded FROM exclusions ORDER BY phenotype, related",
        )?;
        let pairs = stmt
            .query_map([], |row| {
                Ok(PairExclusion {
                    phenotype: row.get(0)?,
                    related: row.get(1)?,
                    n_excluded: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_row(task: &str, entity: &str, phenotype: &str, p: f64) -> ResultRow {
        ResultRow {
            task_name: task.into(),
            tested_entity: TestedEntity::Variant,
            entity_name: entity.into(),
            phenotype: phenotype.into(),
            coefficient: Some(0.5),
            std_error: Some(0.1),
            ci_low: Some(0.3),
            ci_high: Some(0.7),
            p_value: Some(p),
            n: 100,
            diagnostics: json!({"adj_r2": 0.2}),
            is_failed: false,
            failure: None,
        }
    }

    fn failed_row(task: &str, entity: &str, phenotype: &str) -> ResultRow {
        ResultRow {
            task_name: task.into(),
            tested_entity: TestedEntity::Variant,
            entity_name: entity.into(),
            phenotype: phenotype.into(),
            coefficient: None,
            std_error: None,
            ci_low: None,
            ci_high: None,
            p_value: None,
            n: 0,
            diagnostics: serde_json::Value::Null,
            is_failed: true,
            failure: Some("zero variance".into()),
        }
    }

    #[test]
    fn roundtrips_rows_with_filters_and_ordering() {
        let store = ResultStore::open_in_memory().unwrap();
        store.append_result(&sample_row("t1", "snp1", "var1", 0.001)).unwrap();
        store.append_result(&sample_row("t1", "snp2", "var1", 0.2)).unwrap();
        store.append_result(&sample_row("t1", "snp3", "var1", 0.04)).unwrap();
        store.append_result(&failed_row("t1", "snp4", "var1")).unwrap();

        let rows = store
            .query(&ResultQuery::task("t1").order_by(OrderBy::PValue, true))
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].entity_name, "snp1");
        assert_eq!(rows[2].entity_name, "snp2");

        let significant = store
            .query(&ResultQuery::task("t1").p_threshold(0.05))
            .unwrap();
        assert_eq!(significant.len(), 2);

        let with_failed = store
            .query(&ResultQuery::task("t1").include_failed())
            .unwrap();
        assert_eq!(with_failed.len(), 4);
        assert_eq!(store.count_successful("t1").unwrap(), 3);
        assert_eq!(store.count_failed("t1").unwrap(), 1);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let store = ResultStore::open_in_memory().unwrap();
        store.append_result(&sample_row("t1", "snp1", "var1", 0.5)).unwrap();
        assert!(store.append_result(&sample_row("t1", "snp1", "var1", 0.9)).is_err());
    }

    #[test]
    fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.db");
        {
            let store = ResultStore::open(&path).unwrap();
            store.append_result(&sample_row("t1", "snp1", "var1", 0.01)).unwrap();
        }
        let store = ResultStore::open(&path).unwrap();
        assert_eq!(store.count_successful("t1").unwrap(), 1);
        assert_eq!(store.distinct_tasks().unwrap(), vec!["t1".to_string()]);
    }
}
