use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use contracts::{BenchmarkCategory, BenchmarkOutcome, ValidationReport};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Headline numbers of one archived report, as listed by `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedReportSummary {
    pub run_id: String,
    pub schema_version: String,
    pub seed: String,
    pub theory: Option<String>,
    pub n_traces: u64,
    pub cacr: Option<f64>,
    pub epi: Option<f64>,
    pub p_value: Option<f64>,
    pub warnings: u64,
    pub archived_at: String,
}

#[derive(Debug)]
pub struct SqliteReportStore {
    conn: Connection,
}

impl SqliteReportStore {
    pub fn open(path: impl AsRef<Path>) -> ApiResult<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn run_exists(&self, run_id: &str) -> ApiResult<bool> {
        Ok(run_exists(&self.conn, run_id)?)
    }

    /// Store a report; an existing run id is replaced or refused. A failed
    /// replacement leaves the previously archived run untouched.
    pub fn persist_report(&mut self, report: &ValidationReport, replace_existing: bool) -> ApiResult<()> {
        let run_id = report.metadata.run_id.as_str();
        let report_json = serde_json::to_string(report)?;
        let tx = self.conn.transaction()?;
        if run_exists(&tx, run_id)? {
            if !replace_existing {
                return Err(ApiError::RunAlreadyExists(run_id.to_string()));
            }
            delete_run(&tx, run_id)?;
        }

        tx.execute(
            "INSERT INTO reports (
                run_id,
                schema_version,
                seed,
                theory,
                n_traces,
                cacr,
                epi,
                p_value,
                warnings,
                report_json,
                archived_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                report.schema_version.as_str(),
                report.metadata.seed.to_string(),
                report.metadata.theory.as_deref(),
                i64::try_from(report.metadata.n_traces).unwrap_or(i64::MAX),
                report.l1.as_ref().and_then(|l1| l1.cacr),
                report.l2.as_ref().and_then(|l2| l2.epi),
                report.null_model.as_ref().and_then(|null| null.p_value),
                i64::try_from(report.warnings.len()).unwrap_or(i64::MAX),
                report_json,
                archive_stamp(),
            ],
        )?;

        for outcome in report.l2.iter().flat_map(|l2| l2.benchmarks.iter()) {
            let category = serde_json::to_string(&outcome.category)?
                .trim_matches('"')
                .to_string();
            tx.execute(
                "INSERT INTO benchmark_outcomes (
                    run_id,
                    name,
                    category,
                    low,
                    high,
                    weight,
                    value,
                    within_range,
                    midpoint_distance
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    outcome.name.as_str(),
                    category,
                    outcome.low,
                    outcome.high,
                    outcome.weight,
                    outcome.value,
                    outcome.within_range.map(i64::from),
                    outcome.midpoint_distance,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn list_reports(&self) -> ApiResult<Vec<ArchivedReportSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, schema_version, seed, theory, n_traces, cacr, epi, p_value, warnings, archived_at
             FROM reports
             ORDER BY archived_at ASC, run_id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ArchivedReportSummary {
                run_id: row.get(0)?,
                schema_version: row.get(1)?,
                seed: row.get(2)?,
                theory: row.get(3)?,
                n_traces: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
                cacr: row.get(5)?,
                epi: row.get(6)?,
                p_value: row.get(7)?,
                warnings: u64::try_from(row.get::<_, i64>(8)?).unwrap_or(0),
                archived_at: row.get(9)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    pub fn load_report(&self, run_id: &str) -> ApiResult<Option<ValidationReport>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT report_json FROM reports WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<ValidationReport>(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn load_benchmark_outcomes(&self, run_id: &str) -> ApiResult<Vec<BenchmarkOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, category, low, high, weight, value, within_range, midpoint_distance
             FROM benchmark_outcomes
             WHERE run_id = ?1
             ORDER BY name ASC",
        )?;

        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<f64>>(7)?,
            ))
        })?;

        let mut outcomes = Vec::new();
        for row in rows {
            let (name, category, low, high, weight, value, within_range, midpoint_distance) = row?;
            outcomes.push(BenchmarkOutcome {
                name,
                category: serde_json::from_value::<BenchmarkCategory>(serde_json::Value::String(
                    category,
                ))?,
                low,
                high,
                weight,
                value,
                within_range: within_range.map(|flag| flag != 0),
                midpoint_distance,
            });
        }
        Ok(outcomes)
    }

    fn configure(&mut self) -> ApiResult<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> ApiResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reports (
                run_id TEXT PRIMARY KEY,
                schema_version TEXT NOT NULL,
                seed TEXT NOT NULL,
                theory TEXT,
                n_traces INTEGER NOT NULL,
                cacr REAL,
                epi REAL,
                p_value REAL,
                warnings INTEGER NOT NULL,
                report_json TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS benchmark_outcomes (
                run_id TEXT NOT NULL REFERENCES reports(run_id),
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                low REAL NOT NULL,
                high REAL NOT NULL,
                weight REAL NOT NULL,
                value REAL,
                within_range INTEGER,
                midpoint_distance REAL,
                PRIMARY KEY (run_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_reports_archived_at ON reports(archived_at);
            CREATE INDEX IF NOT EXISTS idx_benchmark_outcomes_name ON benchmark_outcomes(name, run_id);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES(1, 'initial_v1', ?1)",
            params![archive_stamp()],
        )?;

        Ok(())
    }
}

fn run_exists(conn: &Connection, run_id: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM reports WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn delete_run(tx: &Transaction<'_>, run_id: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM benchmark_outcomes WHERE run_id = ?1", params![run_id])?;
    tx.execute("DELETE FROM reports WHERE run_id = ?1", params![run_id])?;
    Ok(())
}

/// Zero-padded unix seconds so the text column sorts chronologically.
fn archive_stamp() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("unix-{seconds:012}")
}
