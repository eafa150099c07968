//! Database module

mod raw;
mod rollup;
mod schema;
#[cfg(test)]
pub(crate) mod testing;

pub use raw::{RawAggregator, SystemSummary, TesteeSummary};
pub use rollup::{RollupStore, SqliteRollupStore};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::config::DatabaseConfig;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&format!("sqlite:{}?mode=rwc", config.url))
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = schema::MIGRATIONS.len(), "Migrations applied");
        Ok(())
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// UTC midnight opening `date`.
pub(crate) fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
