//! # elif-migrate: Linear migration ledger for PostgreSQL
//!
//! Applies and reverts an ordered sequence of schema-change scripts, records
//! each applied script in a ledger table, and uses a session-level advisory
//! lock so only one process migrates a given ledger at a time.
//!
//! ```rust,no_run
//! use elif_migrate::{MigrationConfig, Migrator};
//!
//! # async fn example() -> elif_migrate::MigrateResult<()> {
//! let config = MigrationConfig::default().with_scripts_dir("./migrations");
//! let migrator = Migrator::initialize(config).await?;
//!
//! let applied = migrator.apply(None, false).await?;
//! println!("applied {} migration(s)", applied);
//!
//! migrator.revert_last_group(false).await?;
//! migrator.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod migrator;
pub mod reporter;
pub mod scaffold;
pub mod script;

pub use config::*;
pub use error::*;
pub use ledger::*;
pub use lock::*;
pub use migrator::*;
pub use reporter::*;
pub use scaffold::*;
pub use script::*;
