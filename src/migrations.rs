//! Embedded, numbered schema migrations tracked in `schema_version`.

use rusqlite::{backup::Backup, Connection};

/// `(version, sql)` in ascending order.
const MIGRATIONS: &[(i32, &str)] = &[
    (1, include_str!("migrations/001_baseline.sql")),
    (2, include_str!("migrations/002_audit_missing_messages.sql")),
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Hot copy to `<db>.pre-migration.bak` when upgrading an existing file.
fn snapshot(conn: &Connection) -> Result<(), String> {
    let file: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to locate database file: {}", e))?;
    if file.is_empty() {
        return Ok(());
    }

    let target = format!("{}.pre-migration.bak", file);
    let mut dest =
        Connection::open(&target).map_err(|e| format!("Failed to open {}: {}", target, e))?;
    Backup::new(conn, &mut dest)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(|e| format!("Pre-migration backup failed: {}", e))?;
    log::info!("migrations: snapshot written to {}", target);
    Ok(())
}

/// Apply pending migrations, returning how many ran.
///
/// Fails on a database whose version is ahead of this build.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    conn.execute_batch(VERSION_TABLE)
        .map_err(|e| format!("Failed to create schema_version: {}", e))?;

    let current = current_version(conn)?;
    let latest = MIGRATIONS.last().map_or(0, |(v, _)| *v);
    if current > latest {
        return Err(format!(
            "Database schema version {} is newer than this build supports ({})",
            current, latest
        ));
    }

    let pending: Vec<_> = MIGRATIONS.iter().filter(|(v, _)| *v > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot(conn)?;
    }

    for (version, sql) in &pending {
        conn.execute_batch(sql)
            .and_then(|_| conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version]))
            .map_err(|e| format!("Migration v{} failed: {}", version, e))?;
        log::info!("migrations: applied v{}", version);
    }
    Ok(pending.len())
}
