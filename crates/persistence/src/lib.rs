//! SQLite store for completed optimization runs
//!
//! A [`RunStore`] owns the pool; [`RunStore::runs`] hands out the repository
//! that reads and writes the `optimization_runs` table.

pub mod repository;
pub mod schema;

use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use thiserror::Error;
use tracing::info;

use repository::OptimizationRepository;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cannot open run store at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Cannot create run store schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Pooled handle on the run history database. Cloning shares the pool.
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    /// Open a file-backed store in WAL mode, creating the file and its
    /// parent directory when missing.
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let open_err = |source| DbError::Open {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| open_err(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(open_err)?;

        let store = Self::with_schema(pool).await?;
        info!(path = %path.display(), "Run store ready");
        Ok(store)
    }

    /// Private in-memory store for tests.
    ///
    /// The single connection is never recycled; closing it would drop the data.
    pub async fn in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| DbError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;

        Self::with_schema(pool).await
    }

    async fn with_schema(pool: SqlitePool) -> DbResult<Self> {
        sqlx::raw_sql(schema::CREATE_TABLES)
            .execute(&pool)
            .await
            .map_err(DbError::Schema)?;
        Ok(Self { pool })
    }

    /// Repository over the `optimization_runs` table
    pub fn runs(&self) -> OptimizationRepository<'_> {
        OptimizationRepository::new(&self.pool)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("sma-backtest-{}-{}", std::process::id(), nanos))
            .join(name)
    }

    #[tokio::test]
    async fn test_open_creates_file_in_wal_mode() {
        let path = scratch_path("runs.db");
        let store = RunStore::open(&path).await.unwrap();
        assert!(path.exists());

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(store.runs().count().await.unwrap(), 0);

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let store = RunStore::in_memory().await.unwrap();
        sqlx::raw_sql(schema::CREATE_TABLES)
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.runs().count().await.unwrap(), 0);
    }
}
