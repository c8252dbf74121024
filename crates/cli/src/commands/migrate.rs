use anyhow::Context;
use elif_migrate::{create_migration_file, MigrateError, MigrationConfig, Migrator};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::CliReporter;
use crate::args::{DownSteps, UpSteps};

pub(crate) async fn connect(config: MigrationConfig) -> anyhow::Result<Migrator> {
    let reporter = Arc::new(CliReporter::new(config.silent));
    Ok(Migrator::initialize_with_reporter(config, reporter).await?)
}

pub async fn up(config: MigrationConfig, steps: UpSteps, dry: bool) -> anyhow::Result<()> {
    let migrator = connect(config).await?;

    let count = match steps {
        UpSteps::All => None,
        UpSteps::Count(n) => Some(n),
    };
    let result = migrator.apply(count, dry).await;
    migrator.close().await;

    let applied = result.context("Migrations exec error")?;
    if !dry {
        info!("Applied {} migration(s)", applied);
    }
    Ok(())
}

pub async fn down(config: MigrationConfig, steps: DownSteps, dry: bool) -> anyhow::Result<()> {
    if let DownSteps::Count(count) = steps {
        if count <= 0 {
            return Err(MigrateError::InvalidCount(count).into());
        }
    }
    let migrator = connect(config).await?;

    let result = match steps {
        DownSteps::All => migrator.revert_all(dry).await,
        DownSteps::Group => migrator.revert_last_group(dry).await,
        DownSteps::Count(n) => migrator.revert(n, dry).await,
    };
    migrator.close().await;

    let reverted = result.context("Migrations rollback error")?;
    if !dry {
        info!("Rolled back {} migration(s)", reverted);
    }
    Ok(())
}

pub fn create(name: &str, dir: &Path) -> anyhow::Result<()> {
    let path = create_migration_file(name, dir)
        .with_context(|| format!("Migration file \"{}\" creation error", name))?;

    println!("Created migration: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elif_migrate::ConnectionTarget;
    use std::fs;

    #[tokio::test]
    async fn test_down_rejects_non_positive_count_before_connecting() {
        // Nothing listens on port 1; connecting would fail with a different error.
        let target = ConnectionTarget {
            port: 1,
            ..ConnectionTarget::default()
        };

        for count in [0, -1] {
            let err = down(MigrationConfig::new(target.clone()), DownSteps::Count(count), false)
                .await
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<MigrateError>(),
                Some(MigrateError::InvalidCount(c)) if *c == count
            ));
        }
    }

    #[test]
    fn test_create_writes_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("db").join("migrations");

        create("Add Orders", &migrations).unwrap();

        let entries: Vec<String> = fs::read_dir(&migrations)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("-add-orders.sql"));
    }
}
