//! Migrator - Applies and reverts migrations under the advisory lock
//!
//! Every mutating operation follows the same shape: take the lock or back off,
//! do the work with one transaction per script, release the lock no matter
//! how the work ended.

use rand::Rng;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::{Ledger, LedgerRecord};
use crate::lock::{AdvisoryLock, LockGuard, LockId};
use crate::reporter::{MigrationReporter, TracingReporter};
use crate::script::{ScriptSource, SqlDirectory};

/// Upper bound for randomly drawn group ids
const MAX_GROUP_ID: i32 = 2_000_000_000;

/// Idle connections are closed after this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The lock pins one connection while scripts run on another
const MIN_POOL_SIZE: u32 = 2;

/// Which ledger records a revert operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RevertScope {
    Latest(i64),
    All,
    LastGroup,
}

/// Where a script stands relative to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptState {
    Applied,
    /// The next `apply` runs it
    Pending,
    /// Not applied, but ordered at or before the last applied script, so
    /// `apply` never picks it up
    Skipped,
}

/// Applied state of one script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStatus {
    pub name: String,
    pub state: ScriptState,
    /// Ledger entry, if the script has been applied
    pub record: Option<LedgerRecord>,
    /// Whether the script source still provides this script
    pub present: bool,
}

impl ScriptStatus {
    pub fn is_applied(&self) -> bool {
        self.state == ScriptState::Applied
    }

    pub fn is_pending(&self) -> bool {
        self.state == ScriptState::Pending
    }
}

/// Migration engine bound to one database, ledger table and script source
pub struct Migrator {
    config: MigrationConfig,
    pool: PgPool,
    ledger: Ledger,
    lock: AdvisoryLock,
    source: Box<dyn ScriptSource>,
    reporter: Arc<dyn MigrationReporter>,
}

impl Migrator {
    /// Connect, create the ledger table if needed and read scripts from
    /// `config.scripts_dir`.
    pub async fn initialize(config: MigrationConfig) -> MigrateResult<Self> {
        let reporter = Arc::new(TracingReporter::new(config.silent));
        Self::initialize_with_reporter(config, reporter).await
    }

    /// Same as [`Migrator::initialize`], reporting through `reporter` from
    /// the first connection attempt on.
    pub async fn initialize_with_reporter(
        config: MigrationConfig,
        reporter: Arc<dyn MigrationReporter>,
    ) -> MigrateResult<Self> {
        let source = SqlDirectory::new(config.scripts_dir.clone());
        let pool = match Self::connect(&config).await {
            Ok(pool) => pool,
            Err(e) => {
                reporter.failure(&e.to_string());
                return Err(e);
            }
        };
        Self::new(config, pool, source)?
            .with_reporter(reporter)
            .prepared()
            .await
    }

    /// Build the connection pool for a configuration
    pub async fn connect(config: &MigrationConfig) -> MigrateResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(config.max_connections.max(MIN_POOL_SIZE))
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(config.connect_options())
            .await
            .map_err(MigrateError::Initialization)
    }

    /// Use an existing pool and any script source, creating the ledger table
    /// if needed.
    pub async fn with_source(
        config: MigrationConfig,
        pool: PgPool,
        source: impl ScriptSource + 'static,
    ) -> MigrateResult<Self> {
        Self::new(config, pool, source)?.prepared().await
    }

    /// Assemble a migrator without touching the database.
    ///
    /// The pool must allow at least two connections: the lock holds one for
    /// the whole operation while scripts run on another.
    pub fn new(
        config: MigrationConfig,
        pool: PgPool,
        source: impl ScriptSource + 'static,
    ) -> MigrateResult<Self> {
        let max_connections = pool.options().get_max_connections();
        if max_connections < MIN_POOL_SIZE {
            return Err(MigrateError::Configuration(format!(
                "connection pool allows {} connection(s), migrations need at least {}",
                max_connections, MIN_POOL_SIZE
            )));
        }

        let ledger = Ledger::new(&config);
        let lock = AdvisoryLock::new(pool.clone(), LockId::derive(&config));
        let reporter = Arc::new(TracingReporter::new(config.silent));

        Ok(Self {
            config,
            pool,
            ledger,
            lock,
            source: Box::new(source),
            reporter,
        })
    }

    async fn prepared(self) -> MigrateResult<Self> {
        if let Err(e) = self.ledger.ensure_table(&self.pool).await {
            self.reporter.failure(&e.to_string());
            return Err(e);
        }
        Ok(self)
    }

    /// Replace the progress reporter
    pub fn with_reporter(mut self, reporter: Arc<dyn MigrationReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn lock_id(&self) -> LockId {
        self.lock.id()
    }

    /// Number of applied migrations
    pub async fn applied_count(&self) -> MigrateResult<i64> {
        self.ledger.count(&self.pool).await
    }

    /// Most recently applied migration
    pub async fn last_applied(&self) -> MigrateResult<Option<LedgerRecord>> {
        self.ledger.last_applied(&self.pool).await
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Apply pending migrations.
    ///
    /// `count` of `None` or `Some(0)` applies everything pending; larger
    /// counts are clamped. All scripts of one call share a group id. Returns
    /// the number applied, which is always `0` for a dry run or when another
    /// process holds the lock.
    pub async fn apply(&self, count: Option<usize>, dry: bool) -> MigrateResult<usize> {
        let Some(guard) = self.acquire().await? else {
            return Ok(0);
        };

        let outcome = self.apply_locked(count, dry).await;
        self.release(guard).await;
        self.report_outcome(outcome, "Migrations exec error")
    }

    /// Revert the `count` most recent migrations.
    ///
    /// `count` must be positive; zero or negative fails before the lock is
    /// attempted.
    pub async fn revert(&self, count: i64, dry: bool) -> MigrateResult<usize> {
        if count <= 0 {
            return Err(MigrateError::InvalidCount(count));
        }
        self.revert_scope(RevertScope::Latest(count), dry).await
    }

    /// Revert every applied migration
    pub async fn revert_all(&self, dry: bool) -> MigrateResult<usize> {
        self.revert_scope(RevertScope::All, dry).await
    }

    /// Revert the group of the most recently applied migration
    pub async fn revert_last_group(&self, dry: bool) -> MigrateResult<usize> {
        self.revert_scope(RevertScope::LastGroup, dry).await
    }

    /// Applied state of every known script.
    ///
    /// Scripts come first in source order, followed by ledger entries whose
    /// script is no longer provided by the source. Pending means exactly what
    /// the next unlimited `apply` would run. Takes no lock.
    pub async fn status(&self) -> MigrateResult<Vec<ScriptStatus>> {
        let candidates = self.source.list()?;
        let records = self.ledger.all(&self.pool).await?;
        Ok(build_statuses(candidates, records))
    }

    async fn acquire(&self) -> MigrateResult<Option<LockGuard>> {
        match self.lock.try_acquire().await {
            Ok(Some(guard)) => Ok(Some(guard)),
            Ok(None) => {
                self.reporter.notice(
                    "Migration already locked! It seems to be executed by another service.",
                );
                Ok(None)
            }
            Err(e) => {
                self.reporter.failure(&format!("Failed to acquire migration lock: {}", e));
                Err(e)
            }
        }
    }

    async fn release(&self, guard: LockGuard) {
        let id = guard.id();
        match guard.release().await {
            Ok(true) => {}
            Ok(false) => warn!("Advisory lock {} was not held at release", id),
            Err(e) => warn!("Failed to release advisory lock {}: {}", id, e),
        }
    }

    fn report_outcome(&self, outcome: MigrateResult<usize>, context: &str) -> MigrateResult<usize> {
        if let Err(e) = &outcome {
            self.reporter.failure(&format!("{}: {}", context, e));
        }
        outcome
    }

    async fn apply_locked(&self, count: Option<usize>, dry: bool) -> MigrateResult<usize> {
        let candidates = self.source.list()?;
        if candidates.is_empty() {
            self.reporter.notice(&format!(
                "No migrations found in \"{}\" directory!",
                self.source.describe()
            ));
            return Ok(0);
        }

        let last = self.ledger.last_applied(&self.pool).await?;
        let selection = select_pending(candidates, last.as_ref().map(|r| r.name.as_str()), count);

        if let (true, Some(last)) = (selection.last_applied_missing, &last) {
            warn!(
                "Last applied migration \"{}\" is not present in {}; treating every script as applied",
                last.name,
                self.source.describe()
            );
        }

        if selection.scripts.is_empty() {
            self.reporter.notice("No migrations left to apply.");
            return Ok(0);
        }

        let group_id = next_group_id();
        debug!("Applying {} migration(s) as group {}", selection.scripts.len(), group_id);

        for name in &selection.scripts {
            if dry {
                self.reporter.applied(name, true);
                continue;
            }
            self.apply_one(name, group_id)
                .await
                .map_err(|e| MigrateError::in_script(name.as_str(), e))?;
            self.reporter.applied(name, false);
        }

        Ok(if dry { 0 } else { selection.scripts.len() })
    }

    async fn apply_one(&self, name: &str, group_id: i32) -> MigrateResult<()> {
        let script = self.source.load(name)?;

        // Dropping the transaction on error rolls it back.
        let mut tx = self.pool.begin().await?;
        if let Some(up) = &script.up {
            up.run(&mut *tx).await?;
        }
        self.ledger.insert(&mut *tx, name, group_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revert_scope(&self, scope: RevertScope, dry: bool) -> MigrateResult<usize> {
        let Some(guard) = self.acquire().await? else {
            return Ok(0);
        };

        let outcome = self.revert_locked(scope, dry).await;
        self.release(guard).await;
        self.report_outcome(outcome, "Migrations rollback error")
    }

    async fn revert_locked(&self, scope: RevertScope, dry: bool) -> MigrateResult<usize> {
        let records = self.select_for_revert(scope).await?;
        if records.is_empty() {
            self.reporter.notice("No migrations left to rollback.");
            return Ok(0);
        }

        debug!("Reverting {} migration(s) ({:?})", records.len(), scope);

        for record in &records {
            if dry {
                self.reporter.reverted(&record.name, true);
                continue;
            }
            self.revert_one(record)
                .await
                .map_err(|e| MigrateError::in_script(record.name.as_str(), e))?;
            self.reporter.reverted(&record.name, false);
        }

        Ok(if dry { 0 } else { records.len() })
    }

    /// Ledger records to revert, newest first
    async fn select_for_revert(&self, scope: RevertScope) -> MigrateResult<Vec<LedgerRecord>> {
        match scope {
            RevertScope::Latest(count) => self.ledger.last_n(&self.pool, count).await,
            RevertScope::All => self.ledger.all(&self.pool).await,
            RevertScope::LastGroup => {
                let mut tx = self.pool.begin().await?;
                let records = match self.ledger.last_applied(&mut *tx).await? {
                    Some(last) => self.ledger.by_group(&mut *tx, last.group_id).await?,
                    None => Vec::new(),
                };
                tx.commit().await?;
                Ok(records)
            }
        }
    }

    async fn revert_one(&self, record: &LedgerRecord) -> MigrateResult<()> {
        let script = self.source.load(&record.name)?;

        let mut tx = self.pool.begin().await?;
        if let Some(down) = &script.down {
            down.run(&mut *tx).await?;
        }
        self.ledger.delete(&mut *tx, record.id).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Pair candidates with ledger records (newest first) and classify them
/// the same way `apply` selects its work
fn build_statuses(candidates: Vec<String>, records: Vec<LedgerRecord>) -> Vec<ScriptStatus> {
    let last = records.first().map(|record| record.name.clone());
    let pending: HashSet<String> = select_pending(candidates.clone(), last.as_deref(), None)
        .scripts
        .into_iter()
        .collect();

    let mut records: HashMap<String, LedgerRecord> = records
        .into_iter()
        .map(|record| (record.name.clone(), record))
        .collect();

    let mut statuses: Vec<ScriptStatus> = candidates
        .into_iter()
        .map(|name| {
            let record = records.remove(&name);
            let state = match (&record, pending.contains(&name)) {
                (Some(_), _) => ScriptState::Applied,
                (None, true) => ScriptState::Pending,
                (None, false) => ScriptState::Skipped,
            };
            ScriptStatus {
                name,
                state,
                record,
                present: true,
            }
        })
        .collect();

    let mut orphans: Vec<LedgerRecord> = records.into_values().collect();
    orphans.sort_by_key(|record| record.id);
    statuses.extend(orphans.into_iter().map(|record| ScriptStatus {
        name: record.name.clone(),
        state: ScriptState::Applied,
        record: Some(record),
        present: false,
    }));

    statuses
}

fn next_group_id() -> i32 {
    rand::thread_rng().gen_range(1..=MAX_GROUP_ID)
}

/// Scripts still to apply
#[derive(Debug, PartialEq, Eq)]
struct PendingSelection {
    scripts: Vec<String>,
    /// The last applied script was not among the candidates
    last_applied_missing: bool,
}

/// Drop every candidate up to and including `last_applied`, then apply the
/// limit.
///
/// A `last_applied` name that is not among the candidates leaves nothing
/// pending.
fn select_pending(
    mut candidates: Vec<String>,
    last_applied: Option<&str>,
    count: Option<usize>,
) -> PendingSelection {
    let mut last_applied_missing = false;

    if let Some(last) = last_applied {
        match candidates.iter().position(|name| name == last) {
            Some(position) => {
                candidates.drain(..=position);
            }
            None => {
                candidates.clear();
                last_applied_missing = true;
            }
        }
    }

    if let Some(limit) = count.filter(|&n| n > 0) {
        candidates.truncate(limit);
    }

    PendingSelection {
        scripts: candidates,
        last_applied_missing,
    }
}
