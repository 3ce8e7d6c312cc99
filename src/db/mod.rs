//! SQLite-backed pipeline store: connections, stored emails, extracted
//! transactions, rejections, webhook audit log and runtime settings.
//!
//! The database is the only shared mutable resource in the pipeline. Every
//! cross-request guarantee (fetch idempotency, derived email status, the
//! extraction mode switch) is enforced here through constraints and guarded
//! updates rather than in-memory locks, so several server instances can
//! share one database file.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub mod audit;
pub mod connections;
pub mod emails;
pub mod settings;
pub mod types;
pub use audit::{
    AuditCompletion, AuditNotification, AuditStatus, AuditTransition, DbAuditEntry, NewAuditEntry,
};
pub use types::*;

/// Handle shared across request handlers. Lock only for short synchronous
/// sections; never hold the guard across an `.await`.
pub type SharedDb = Arc<parking_lot::Mutex<PipelineDb>>;

pub struct PipelineDb {
    conn: Connection,
}

impl PipelineDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&Self) -> Result<T, String>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| format!("Failed to begin transaction: {e}"))?;
        match f(self) {
            Ok(val) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| format!("Failed to commit transaction: {e}"))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `path` and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets concurrent instances read while one writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.finmail/finmail.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".finmail").join("finmail.db"))
    }

    /// Wrap into the shared handle used by the server.
    pub fn into_shared(self) -> SharedDb {
        Arc::new(parking_lot::Mutex::new(self))
    }

    pub(crate) fn now() -> String {
        Utc::now().to_rfc3339()
    }

    pub(crate) fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Count rows violating status exclusivity. Always zero while the CHECK
    /// constraint holds; exposed for diagnostics.
    pub fn count_status_conflicts(&self) -> Result<i64, String> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM stored_emails
                 WHERE processed_ref IS NOT NULL AND rejected_ref IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .map_err(|e| format!("Failed to count status conflicts: {e}"))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Open a fresh on-disk database in a leaked temp dir.
    pub fn test_db() -> PipelineDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test_finmail.db");
        std::mem::forget(dir);
        PipelineDb::open_at(path).expect("Failed to open test database")
    }

    pub fn sample_connection(id: &str, email: &str) -> DbConnection {
        let now = Utc::now().to_rfc3339();
        DbConnection {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            provider_account_id: format!("acct-{id}"),
            email_address: email.to_string(),
            access_token: "ya29.initial".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            token_expiry: Some((Utc::now() + chrono::Duration::hours(1)).to_rfc3339()),
            watch_enabled: true,
            auto_sync_enabled: false,
            last_history_id: None,
            health: ConnectionHealth::Healthy,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn sample_email(connection_id: &str, message_id: &str, internal_date: i64) -> NewStoredEmail {
        NewStoredEmail {
            connection_id: connection_id.to_string(),
            provider_message_id: message_id.to_string(),
            thread_id: Some(format!("thread-{message_id}")),
            subject: "Transaction alert".to_string(),
            sender: "alerts@bank.example".to_string(),
            recipients: "me@example.com".to_string(),
            snippet: "INR 450.00 debited".to_string(),
            body_text: "INR 450.00 debited from card XX1234 at Cafe Mocha on 12-03-2026."
                .to_string(),
            label_ids: vec!["INBOX".to_string()],
            internal_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_support::*;

    #[test]
    fn test_open_applies_schema() {
        let db = test_db();
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM stored_emails", [], |row| row.get(0))
            .expect("stored_emails table should exist");
        assert_eq!(count, 0);
        assert_eq!(db.count_status_conflicts().unwrap(), 0);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_err() {
        let db = test_db();
        db.upsert_connection(&sample_connection("c1", "a@b.com"))
            .unwrap();

        let result: Result<(), String> = db.with_transaction(|tx| {
            tx.set_last_history_id("c1", "999")?;
            Err("boom".to_string())
        });
        assert!(result.is_err());

        let conn = db.get_connection("c1").unwrap().unwrap();
        assert!(conn.last_history_id.is_none());
    }
}
