//! Ledger - The bookkeeping table of applied migrations
//!
//! Reads accept any Postgres executor so they can run against the pool or
//! inside an open transaction. Writes always take the connection of the
//! transaction that also runs the script.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::debug;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, MigrateResult};

/// One applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerRecord {
    /// Storage-assigned, increasing in application order
    pub id: i32,
    /// Script identifier
    pub name: String,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
    /// Group of the `apply` run that applied it
    pub group_id: i32,
}

/// Postgres error codes a concurrent `CREATE TABLE IF NOT EXISTS` can raise
const UNIQUE_VIOLATION: &str = "23505";
const DUPLICATE_TABLE: &str = "42P07";

/// Access to the ledger table
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            table: config.qualified_table(),
        }
    }

    /// Quoted `schema.table` name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it is missing.
    ///
    /// Two processes racing through first-run may both attempt the create;
    /// the loser's duplicate error is swallowed.
    pub async fn ensure_table(&self, pool: &PgPool) -> MigrateResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id SERIAL PRIMARY KEY, \
                name TEXT, \
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(), \
                group_id INTEGER\
            )",
            self.table
        );

        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if matches!(
                    db_err.code().as_deref(),
                    Some(UNIQUE_VIOLATION) | Some(DUPLICATE_TABLE)
                ) =>
            {
                debug!("Ledger table {} was created concurrently", self.table);
                Ok(())
            }
            Err(e) => Err(MigrateError::Initialization(e)),
        }
    }

    /// Number of applied migrations
    pub async fn count<'e, E>(&self, executor: E) -> MigrateResult<i64>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(executor).await?;
        Ok(count)
    }

    /// Most recently applied migration
    pub async fn last_applied<'e, E>(&self, executor: E) -> MigrateResult<Option<LedgerRecord>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!(
            "SELECT id, name, applied_at, group_id FROM {} ORDER BY id DESC LIMIT 1",
            self.table
        );
        let record = sqlx::query_as::<_, LedgerRecord>(&sql)
            .fetch_optional(executor)
            .await?;
        Ok(record)
    }

    /// The `n` most recent migrations, newest first
    pub async fn last_n<'e, E>(&self, executor: E, n: i64) -> MigrateResult<Vec<LedgerRecord>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!(
            "SELECT id, name, applied_at, group_id FROM {} ORDER BY id DESC LIMIT $1",
            self.table
        );
        let records = sqlx::query_as::<_, LedgerRecord>(&sql)
            .bind(n)
            .fetch_all(executor)
            .await?;
        Ok(records)
    }

    /// Every applied migration, newest first
    pub async fn all<'e, E>(&self, executor: E) -> MigrateResult<Vec<LedgerRecord>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!(
            "SELECT id, name, applied_at, group_id FROM {} ORDER BY id DESC",
            self.table
        );
        let records = sqlx::query_as::<_, LedgerRecord>(&sql)
            .fetch_all(executor)
            .await?;
        Ok(records)
    }

    /// Migrations of one group, newest first
    pub async fn by_group<'e, E>(&self, executor: E, group_id: i32) -> MigrateResult<Vec<LedgerRecord>>
    where
        E: PgExecutor<'e>,
    {
        let sql = format!(
            "SELECT id, name, applied_at, group_id FROM {} WHERE group_id = $1 ORDER BY id DESC",
            self.table
        );
        let records = sqlx::query_as::<_, LedgerRecord>(&sql)
            .bind(group_id)
            .fetch_all(executor)
            .await?;
        Ok(records)
    }

    /// Record a migration as applied
    pub async fn insert(&self, conn: &mut PgConnection, name: &str, group_id: i32) -> MigrateResult<()> {
        let sql = format!("INSERT INTO {} (name, group_id) VALUES ($1, $2)", self.table);
        sqlx::query(&sql)
            .bind(name)
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Remove a migration record
    pub async fn delete(&self, conn: &mut PgConnection, id: i32) -> MigrateResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(())
    }
}
