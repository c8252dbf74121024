//! Error types for the migration engine
//!
//! Every failure that can stop an `apply` or `revert` run is expressed here.
//! A declined lock is not an error; operations report it and return `0`.

use std::path::PathBuf;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Could not connect or could not create the ledger table
    #[error("Migration init error: {0}")]
    Initialization(#[source] sqlx::Error),

    /// Any other database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Revert count was zero or negative
    #[error("Wrong migration number provided: {0}")]
    InvalidCount(i64),

    /// The scripts directory could not be listed
    #[error("Error reading \"{}\" directory: {source}", path.display())]
    ScriptsDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No script exists under the requested name
    #[error("Migration script not found")]
    ScriptNotFound,

    /// The script exists but could not be read
    #[error("Failed to read migration script: {0}")]
    ScriptRead(#[source] std::io::Error),

    /// Failure signalled by a native procedure
    #[error("{0}")]
    Procedure(String),

    /// A failure attributed to one script
    #[error("(file: {name}) {source}")]
    Script {
        name: String,
        #[source]
        source: Box<MigrateError>,
    },
}

impl MigrateError {
    /// Annotate an error with the script it originated from.
    ///
    /// Errors that already carry a script name are returned unchanged.
    pub fn in_script(name: impl Into<String>, err: MigrateError) -> Self {
        match err {
            already @ MigrateError::Script { .. } => already,
            other => MigrateError::Script {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }

    /// Name of the script this error is attributed to, if any
    pub fn script_name(&self) -> Option<&str> {
        match self {
            MigrateError::Script { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Error with script annotation removed
    pub fn root(&self) -> &MigrateError {
        match self {
            MigrateError::Script { source, .. } => source.root(),
            other => other,
        }
    }
}
