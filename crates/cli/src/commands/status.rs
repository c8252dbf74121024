use elif_migrate::{MigrationConfig, ScriptState, ScriptStatus};

use super::migrate::connect;

pub async fn show(config: MigrationConfig, json: bool) -> anyhow::Result<()> {
    let migrator = connect(config).await?;
    let result = migrator.status().await;
    migrator.close().await;
    let statuses = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    if statuses.is_empty() {
        println!("No migrations found");
        return Ok(());
    }
    for status in &statuses {
        println!("  {}", status_line(status));
    }

    Ok(())
}

fn status_line(status: &ScriptStatus) -> String {
    match (&status.record, status.present) {
        (Some(record), true) => format!(
            "[applied {}] {} (group {})",
            record.applied_at.format("%Y-%m-%d %H:%M:%S"),
            status.name,
            record.group_id
        ),
        (Some(record), false) => format!(
            "[applied {}] {} (group {}, file missing)",
            record.applied_at.format("%Y-%m-%d %H:%M:%S"),
            status.name,
            record.group_id
        ),
        (None, _) if status.state == ScriptState::Skipped => {
            format!("[skipped] {} (ordered before the last applied migration, migrate skips it)", status.name)
        }
        (None, _) => format!("[pending] {}", status.name),
    }
}
