//! Lock Coordinator - Cross-process mutual exclusion
//!
//! Uses a PostgreSQL session-level advisory lock. The lock lives in the
//! database session, so the guard pins the pooled connection that acquired it
//! until release.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::fmt;
use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::error::MigrateResult;

/// Number of SHAKE128 output bytes folded into the lock id
const LOCK_ID_BYTES: usize = 7;

/// Advisory lock key derived from the ledger location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(i64);

impl LockId {
    /// Derive the lock id for a configuration.
    ///
    /// SHAKE128 over `host ++ port ++ database ++ schema ++ table`, 7 bytes,
    /// big-endian. Identically configured engines always agree on the id.
    pub fn derive(config: &MigrationConfig) -> Self {
        let key = format!(
            "{}{}{}{}{}",
            config.connection.host,
            config.connection.port,
            config.connection.database,
            config.schema,
            config.table
        );
        Self::from_key(&key)
    }

    fn from_key(key: &str) -> Self {
        let mut hasher = Shake128::default();
        hasher.update(key.as_bytes());

        let mut digest = [0u8; LOCK_ID_BYTES];
        hasher.finalize_xof().read(&mut digest);

        let value = digest
            .iter()
            .fold(0i64, |acc, byte| (acc << 8) | i64::from(*byte));
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-blocking advisory lock keyed by a [`LockId`]
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    pool: PgPool,
    id: LockId,
}

impl AdvisoryLock {
    pub fn new(pool: PgPool, id: LockId) -> Self {
        Self { pool, id }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Try to take the lock once, without waiting.
    ///
    /// Returns `None` when another session already holds it.
    pub async fn try_acquire(&self) -> MigrateResult<Option<LockGuard>> {
        let mut conn = self.pool.acquire().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.id.value())
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            debug!("Advisory lock {} is held by another session", self.id);
            return Ok(None);
        }

        debug!("Acquired advisory lock {}", self.id);
        Ok(Some(LockGuard {
            conn: Some(conn),
            id: self.id,
        }))
    }
}

/// Proof that the advisory lock is held by this process
pub struct LockGuard {
    conn: Option<PoolConnection<Postgres>>,
    id: LockId,
}

impl LockGuard {
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Release the lock on the session that holds it.
    ///
    /// Returns `false` if Postgres reports the lock was not held. If the
    /// unlock query itself fails the connection is closed, which ends the
    /// session and frees the lock anyway.
    pub async fn release(mut self) -> MigrateResult<bool> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(false);
        };

        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.id.value())
            .fetch_one(&mut *conn)
            .await;

        match result {
            Ok(released) => {
                debug!("Released advisory lock {}", self.id);
                Ok(released)
            }
            Err(e) => {
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Closing the session is the only way to free the lock without awaiting.
            warn!("Advisory lock {} dropped without release, closing its session", self.id);
            drop(conn.detach());
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("id", &self.id)
            .field("held", &self.conn.is_some())
            .finish()
    }
}
