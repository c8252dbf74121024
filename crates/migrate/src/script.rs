//! Script Loader - Resolving migration names to executable procedures
//!
//! A [`ScriptSource`] lists the candidate script names and loads one by name.
//! Scripts can come from `.sql` files on disk ([`SqlDirectory`]) or from Rust
//! functions compiled into the binary ([`ScriptRegistry`]).

use async_trait::async_trait;
use sqlx::{Executor, PgConnection};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{MigrateError, MigrateResult};

/// Extension of SQL migration files
pub const SQL_EXTENSION: &str = "sql";

/// Boxed future returned by native procedures
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One direction of a migration, run inside the migration's transaction
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn run(&self, conn: &mut PgConnection) -> MigrateResult<()>;
}

/// A SQL body executed as a single simple-protocol query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlProcedure {
    sql: String,
}

impl SqlProcedure {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl Procedure for SqlProcedure {
    async fn run(&self, conn: &mut PgConnection) -> MigrateResult<()> {
        // Unprepared execution lets one body hold several statements.
        conn.execute(self.sql.as_str()).await?;
        Ok(())
    }
}

/// A Rust function used as a procedure
pub struct FnProcedure<F>(F);

impl<F> FnProcedure<F>
where
    F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, MigrateResult<()>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Procedure for FnProcedure<F>
where
    F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, MigrateResult<()>> + Send + Sync,
{
    async fn run(&self, conn: &mut PgConnection) -> MigrateResult<()> {
        (self.0)(conn).await
    }
}

/// A migration resolved from its name
#[derive(Clone)]
pub struct LoadedScript {
    pub name: String,
    pub up: Option<Arc<dyn Procedure>>,
    pub down: Option<Arc<dyn Procedure>>,
}

impl fmt::Debug for LoadedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedScript")
            .field("name", &self.name)
            .field("up", &self.up.is_some())
            .field("down", &self.down.is_some())
            .finish()
    }
}

/// Where migration scripts come from
pub trait ScriptSource: Send + Sync {
    /// Candidate script names in application order
    fn list(&self) -> MigrateResult<Vec<String>>;

    /// Resolve one script by name
    fn load(&self, name: &str) -> MigrateResult<LoadedScript>;

    /// Human-readable location, used in progress messages
    fn describe(&self) -> String;
}

/// `.sql` files in a directory
///
/// Each file carries an up section and a down section:
///
/// ```sql
/// -- Up migration
/// CREATE TABLE users (id SERIAL PRIMARY KEY);
///
/// -- Down migration
/// DROP TABLE users;
/// ```
#[derive(Debug, Clone)]
pub struct SqlDirectory {
    dir: PathBuf,
}

impl SqlDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ScriptSource for SqlDirectory {
    fn list(&self) -> MigrateResult<Vec<String>> {
        let directory_error = |source: std::io::Error| MigrateError::ScriptsDirectory {
            path: self.dir.clone(),
            source,
        };

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(directory_error)? {
            let entry = entry.map_err(directory_error)?;
            if !entry.file_type().map_err(directory_error)?.is_file() {
                continue;
            }

            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == SQL_EXTENSION) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }

        // Timestamp prefixes make lexicographic order chronological.
        names.sort();
        Ok(names)
    }

    fn load(&self, name: &str) -> MigrateResult<LoadedScript> {
        let content = fs::read_to_string(self.dir.join(name)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => MigrateError::ScriptNotFound,
            _ => MigrateError::ScriptRead(e),
        })?;

        let (up_sql, down_sql) = parse_sections(&content);
        let procedure = |sql: String| -> Option<Arc<dyn Procedure>> {
            (!sql.is_empty()).then(|| Arc::new(SqlProcedure::new(sql)) as Arc<dyn Procedure>)
        };

        Ok(LoadedScript {
            name: name.to_string(),
            up: procedure(up_sql),
            down: procedure(down_sql),
        })
    }

    fn describe(&self) -> String {
        let path = fs::canonicalize(&self.dir).unwrap_or_else(|_| self.dir.clone());
        path.display().to_string()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

/// `up`, `Up migration`, `down`, `Down migration`
fn section_marker(comment: &str) -> Option<Section> {
    let marker = comment.trim().to_lowercase();
    if marker == "up" || marker.starts_with("up migration") {
        Some(Section::Up)
    } else if marker == "down" || marker.starts_with("down migration") {
        Some(Section::Down)
    } else {
        None
    }
}

/// Split file content into its up and down SQL bodies
pub fn parse_sections(content: &str) -> (String, String) {
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut section = Section::Preamble;

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(comment) = trimmed.strip_prefix("--") {
            if let Some(marked) = section_marker(comment) {
                section = marked;
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        match section {
            Section::Up => up.push(line),
            Section::Down => down.push(line),
            Section::Preamble => {}
        }
    }

    (
        up.join("\n").trim().to_string(),
        down.join("\n").trim().to_string(),
    )
}

/// Both directions of a registered script
#[derive(Clone, Default)]
pub struct ScriptDefinition {
    up: Option<Arc<dyn Procedure>>,
    down: Option<Arc<dyn Procedure>>,
}

impl ScriptDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn up(mut self, procedure: impl Procedure + 'static) -> Self {
        self.up = Some(Arc::new(procedure));
        self
    }

    pub fn down(mut self, procedure: impl Procedure + 'static) -> Self {
        self.down = Some(Arc::new(procedure));
        self
    }

    pub fn up_sql(self, sql: impl Into<String>) -> Self {
        self.up(SqlProcedure::new(sql))
    }

    pub fn down_sql(self, sql: impl Into<String>) -> Self {
        self.down(SqlProcedure::new(sql))
    }

    pub fn up_fn<F>(self, f: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, MigrateResult<()>> + Send + Sync + 'static,
    {
        self.up(FnProcedure::new(f))
    }

    pub fn down_fn<F>(self, f: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, MigrateResult<()>> + Send + Sync + 'static,
    {
        self.down(FnProcedure::new(f))
    }
}

/// Scripts compiled into the binary, keyed by name
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, ScriptDefinition>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a script, replacing any previous one with the same name
    pub fn register(mut self, name: impl Into<String>, definition: ScriptDefinition) -> Self {
        self.scripts.insert(name.into(), definition);
        self
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl ScriptSource for ScriptRegistry {
    fn list(&self) -> MigrateResult<Vec<String>> {
        Ok(self.scripts.keys().cloned().collect())
    }

    fn load(&self, name: &str) -> MigrateResult<LoadedScript> {
        let definition = self.scripts.get(name).ok_or(MigrateError::ScriptNotFound)?;
        Ok(LoadedScript {
            name: name.to_string(),
            up: definition.up.clone(),
            down: definition.down.clone(),
        })
    }

    fn describe(&self) -> String {
        "script registry".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_widgets(conn: &mut PgConnection) -> BoxFuture<'_, MigrateResult<()>> {
        Box::pin(async move {
            sqlx::query("CREATE TABLE widgets (id SERIAL PRIMARY KEY)")
                .execute(conn)
                .await?;
            Ok::<(), MigrateError>(())
        })
    }

    #[test]
    fn test_parse_sections() {
        let content = "-- Migration: create users\n\
                       -- Created: 2024-01-01\n\n\
                       -- Up migration\n\
                       CREATE TABLE users (id SERIAL PRIMARY KEY);\n\
                       -- add an index\n\
                       CREATE INDEX users_id ON users (id);\n\n\
                       -- Down migration\n\
                       DROP TABLE users;\n";

        let (up, down) = parse_sections(content);

        assert_eq!(
            up,
            "CREATE TABLE users (id SERIAL PRIMARY KEY);\nCREATE INDEX users_id ON users (id);"
        );
        assert_eq!(down, "DROP TABLE users;");
    }

    #[test]
    fn test_parse_sections_short_markers() {
        let (up, down) = parse_sections("-- up\nSELECT 1;\n-- DOWN\n");

        assert_eq!(up, "SELECT 1;");
        assert!(down.is_empty());
    }

    #[test]
    fn test_directory_lists_sql_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20240102000000-second.sql"), "-- up\nSELECT 2;").unwrap();
        fs::write(dir.path().join("20240101000000-first.sql"), "-- up\nSELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        fs::create_dir(dir.path().join("20240103000000-nested.sql")).unwrap();

        let names = SqlDirectory::new(dir.path()).list().unwrap();

        assert_eq!(
            names,
            vec!["20240101000000-first.sql", "20240102000000-second.sql"]
        );
    }

    #[test]
    fn test_directory_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqlDirectory::new(dir.path().join("absent"));

        assert!(matches!(
            source.list(),
            Err(MigrateError::ScriptsDirectory { .. })
        ));
    }

    #[test]
    fn test_directory_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("20240101000000-only-up.sql"),
            "-- Up migration\nCREATE TABLE t (id INT);\n-- Down migration\n",
        )
        .unwrap();
        let source = SqlDirectory::new(dir.path());

        let script = source.load("20240101000000-only-up.sql").unwrap();
        assert_eq!(script.name, "20240101000000-only-up.sql");
        assert!(script.up.is_some());
        assert!(script.down.is_none());

        assert!(matches!(
            source.load("20240101000000-missing.sql"),
            Err(MigrateError::ScriptNotFound)
        ));
    }

    #[test]
    fn test_registry() {
        let registry = ScriptRegistry::new()
            .register(
                "20240102000000-widgets",
                ScriptDefinition::new().up_fn(create_widgets).down_sql("DROP TABLE widgets"),
            )
            .register("20240101000000-noop", ScriptDefinition::new());

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.list().unwrap(),
            vec!["20240101000000-noop", "20240102000000-widgets"]
        );

        let widgets = registry.load("20240102000000-widgets").unwrap();
        assert!(widgets.up.is_some());
        assert!(widgets.down.is_some());

        let noop = registry.load("20240101000000-noop").unwrap();
        assert!(noop.up.is_none());
        assert!(noop.down.is_none());

        assert!(matches!(
            registry.load("20240103000000-unknown"),
            Err(MigrateError::ScriptNotFound)
        ));
    }
}
