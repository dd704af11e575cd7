// Experiment logging: model registration and scalar metrics.
//
// TracingLogger forwards everything to tracing. SqliteLogger persists metrics
// so a run can be inspected (or plotted) after the process exits.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

pub trait ExperimentLogger {
    /// Register the model being trained or sampled.
    fn watch(&self, model: &str, n_params: usize) -> Result<()>;

    fn log_scalar(&self, key: &str, value: f64, step: usize) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl ExperimentLogger for TracingLogger {
    fn watch(&self, model: &str, n_params: usize) -> Result<()> {
        info!("[ELDM] watching {model} ({n_params} params)");
        Ok(())
    }

    fn log_scalar(&self, key: &str, value: f64, step: usize) -> Result<()> {
        info!("[METRIC] {key}={value:.6} step={step}");
        Ok(())
    }
}

/// One recorded metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub step: usize,
    pub value: f64,
    pub timestamp: String,
}

/// Metric store backed by SQLite. Every instance writes under its own run
/// name so several runs can share one database file.
pub struct SqliteLogger {
    conn: Connection,
    run: String,
}

impl SqliteLogger {
    /// Open (or create) a metrics database. Use ":memory:" for tests.
    pub fn open(path: impl AsRef<Path>, run: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                n_params INTEGER NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run TEXT NOT NULL,
                key TEXT NOT NULL,
                value REAL NOT NULL,
                step INTEGER NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_run_key ON metrics(run, key);",
        )?;
        Ok(Self {
            conn,
            run: run.to_string(),
        })
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    /// Values of `key` for this run in insertion order.
    pub fn history(&self, key: &str) -> Result<Vec<MetricPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT step, value, timestamp FROM metrics WHERE run = ?1 AND key = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![self.run, key], |row| {
            let step: i64 = row.get(0)?;
            Ok(MetricPoint {
                step: step as usize,
                value: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Registered (model, n_params) for this run, if any.
    pub fn watched(&self) -> Result<Option<(String, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT model, n_params FROM runs WHERE run = ?1")?;
        let mut rows = stmt.query(params![self.run])?;
        match rows.next()? {
            Some(row) => {
                let n: i64 = row.get(1)?;
                Ok(Some((row.get(0)?, n as usize)))
            }
            None => Ok(None),
        }
    }
}

impl ExperimentLogger for SqliteLogger {
    fn watch(&self, model: &str, n_params: usize) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO runs (run, model, n_params) VALUES (?1, ?2, ?3)",
            params![self.run, model, n_params as i64],
        )?;
        Ok(())
    }

    fn log_scalar(&self, key: &str, value: f64, step: usize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metrics (run, key, value, step) VALUES (?1, ?2, ?3, ?4)",
            params![self.run, key, value, step as i64],
        )?;
        Ok(())
    }
}
