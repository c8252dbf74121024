//! Scaffold generation for new migration files

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::script::SQL_EXTENSION;

/// `YYYYMMDDHHMMSS`
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// File name for a new migration: `<timestamp>-<slug>.sql`
pub fn migration_file_name(name: &str, created_at: DateTime<Utc>) -> String {
    let slug = name
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-");

    format!(
        "{}-{}.{}",
        created_at.format(TIMESTAMP_FORMAT),
        slug,
        SQL_EXTENSION
    )
}

fn template(name: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "-- Migration: {}\n\
         -- Created: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\n",
        name,
        created_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// Write a new, empty migration into `dir`, creating the directory if
/// needed. Returns the path of the new file.
pub fn create_migration_file(name: &str, dir: &Path) -> io::Result<PathBuf> {
    let created_at = Utc::now();
    fs::create_dir_all(dir)?;

    let path = dir.join(migration_file_name(name, created_at));
    fs::write(&path, template(name, created_at))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{parse_sections, ScriptSource, SqlDirectory};
    use chrono::TimeZone;

    #[test]
    fn test_migration_file_name() {
        let created_at = Utc.with_ymd_and_hms(2022, 2, 15, 21, 48, 36).unwrap();

        assert_eq!(
            migration_file_name("Something  to think\tabout", created_at),
            "20220215214836-something-to-think-about.sql"
        );
    }

    #[test]
    fn test_create_migration_file() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");

        let path = create_migration_file("add users", &migrations).unwrap();

        let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(file_name.ends_with("-add-users.sql"));
        assert_eq!(file_name.len(), "YYYYMMDDHHMMSS-add-users.sql".len());

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(parse_sections(&content), (String::new(), String::new()));

        // An empty scaffold loads as a script with no procedures.
        let script = SqlDirectory::new(&migrations).load(&file_name).unwrap();
        assert!(script.up.is_none());
        assert!(script.down.is_none());
    }
}
