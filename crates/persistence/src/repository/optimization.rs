//! Optimization runs repository - history of completed grid searches

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};

/// A persisted optimization run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OptimizationRunRecord {
    pub id: Option<i64>,
    pub run_hash: String,
    pub symbol: String,
    /// ISO date, inclusive
    pub start_date: String,
    /// ISO date, exclusive
    pub end_date: String,
    /// `start,stop,step`
    pub short_range: String,
    pub long_range: String,
    pub best_short: i64,
    pub best_long: i64,
    pub absolute_performance: String,
    pub outperformance: String,
    pub evaluated: i64,
    pub infeasible: i64,
    pub candidates_json: String,
    pub created_at: Option<i64>,
}

/// Stable identity of a search: same symbol, dates and ranges give the same hash.
pub fn compute_run_hash(
    symbol: &str,
    start_date: &str,
    end_date: &str,
    short_range: &str,
    long_range: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [symbol, start_date, end_date, short_range, long_range] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Repository for optimization history
pub struct OptimizationRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OptimizationRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a run, replacing the previous result of an identical search
    pub async fn save(&self, record: &OptimizationRunRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO optimization_runs
                (run_hash, symbol, start_date, end_date, short_range, long_range,
                 best_short, best_long, absolute_performance, outperformance,
                 evaluated, infeasible, candidates_json, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       strftime('%s', 'now'))
               ON CONFLICT(run_hash) DO UPDATE SET
                 best_short = excluded.best_short,
                 best_long = excluded.best_long,
                 absolute_performance = excluded.absolute_performance,
                 outperformance = excluded.outperformance,
                 evaluated = excluded.evaluated,
                 infeasible = excluded.infeasible,
                 candidates_json = excluded.candidates_json,
                 created_at = strftime('%s', 'now')
            "#,
        )
        .bind(&record.run_hash)
        .bind(&record.symbol)
        .bind(&record.start_date)
        .bind(&record.end_date)
        .bind(&record.short_range)
        .bind(&record.long_range)
        .bind(record.best_short)
        .bind(record.best_long)
        .bind(&record.absolute_performance)
        .bind(&record.outperformance)
        .bind(record.evaluated)
        .bind(record.infeasible)
        .bind(&record.candidates_json)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a run by its hash
    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<OptimizationRunRecord>> {
        let record = sqlx::query_as::<_, OptimizationRunRecord>(
            "SELECT * FROM optimization_runs WHERE run_hash = ?",
        )
        .bind(hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent runs first, optionally for one symbol
    pub async fn get_recent(
        &self,
        limit: i64,
        symbol: Option<&str>,
    ) -> DbResult<Vec<OptimizationRunRecord>> {
        let records = match symbol {
            Some(sym) => {
                sqlx::query_as::<_, OptimizationRunRecord>(
                    "SELECT * FROM optimization_runs WHERE symbol = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(sym)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OptimizationRunRecord>(
                    "SELECT * FROM optimization_runs ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
        };

        Ok(records)
    }

    /// Best stored run for a symbol by absolute performance
    pub async fn get_best_for_symbol(&self, symbol: &str) -> DbResult<Option<OptimizationRunRecord>> {
        let record = sqlx::query_as::<_, OptimizationRunRecord>(
            r#"SELECT * FROM optimization_runs
               WHERE symbol = ?
               ORDER BY CAST(absolute_performance AS REAL) DESC
               LIMIT 1"#,
        )
        .bind(symbol)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Total number of stored runs
    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_runs")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}
