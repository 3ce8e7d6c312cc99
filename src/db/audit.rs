use super::*;

use chrono::DateTime;
use serde::Serialize;

/// Lifecycle of one inbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Received,
    Processing,
    Success,
    Failed,
    Skipped,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Received => "received",
            AuditStatus::Processing => "processing",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "received" => Some(AuditStatus::Received),
            "processing" => Some(AuditStatus::Processing),
            "success" => Some(AuditStatus::Success),
            "failed" => Some(AuditStatus::Failed),
            "skipped" => Some(AuditStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuditStatus::Success | AuditStatus::Failed | AuditStatus::Skipped
        )
    }

    /// `received -> processing -> {success|failed|skipped}`, plus the
    /// shortcut `received -> {failed|skipped}` for parse failures and test
    /// payloads.
    pub fn can_transition_to(&self, next: AuditStatus) -> bool {
        use AuditStatus::*;
        matches!(
            (self, next),
            (Received, Processing)
                | (Received, Failed)
                | (Received, Skipped)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Skipped)
        )
    }
}

/// Raw envelope captured before any parsing.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub provider_message_id: Option<String>,
    pub subscription: Option<String>,
    pub raw_headers: serde_json::Value,
    pub raw_body: String,
}

/// Fields learned once the payload has been decoded.
#[derive(Debug, Clone, Default)]
pub struct AuditNotification {
    pub email_address: Option<String>,
    pub history_id: Option<String>,
    pub mailbox_message_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Terminal update for an audit entry.
#[derive(Debug, Clone)]
pub struct AuditCompletion {
    pub status: AuditStatus,
    pub skip_reason: Option<String>,
    pub emails_fetched: u32,
    pub emails_processed: u32,
    pub emails_failed: u32,
    pub transactions_extracted: u32,
    pub messages_missing: u32,
    pub gmail_api_ms: u64,
    pub db_ms: u64,
    pub inference_ms: u64,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub error_code: Option<String>,
}

impl AuditCompletion {
    pub fn new(status: AuditStatus) -> Self {
        Self {
            status,
            skip_reason: None,
            emails_fetched: 0,
            emails_processed: 0,
            emails_failed: 0,
            transactions_extracted: 0,
            messages_missing: 0,
            gmail_api_ms: 0,
            db_ms: 0,
            inference_ms: 0,
            error_message: None,
            error_trace: None,
            error_code: None,
        }
    }
}

/// Outcome of a guarded status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTransition {
    Applied,
    Refused { from: AuditStatus },
    Missing,
}

/// A row from `webhook_audit_log`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAuditEntry {
    pub id: String,
    pub provider_message_id: Option<String>,
    pub subscription: Option<String>,
    pub raw_headers: serde_json::Value,
    pub raw_body: String,
    pub email_address: Option<String>,
    pub history_id: Option<String>,
    pub mailbox_message_id: Option<String>,
    pub connection_id: Option<String>,
    pub status: AuditStatus,
    pub skip_reason: Option<String>,
    pub received_at: String,
    pub processing_started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub emails_fetched: i64,
    pub emails_processed: i64,
    pub emails_failed: i64,
    pub transactions_extracted: i64,
    pub messages_missing: i64,
    pub gmail_api_ms: i64,
    pub db_ms: i64,
    pub inference_ms: i64,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub error_code: Option<String>,
}

const AUDIT_COLUMNS: &str = "id, provider_message_id, subscription, raw_headers, raw_body,
    email_address, history_id, mailbox_message_id, connection_id, status, skip_reason,
    received_at, processing_started_at, completed_at, duration_ms, emails_fetched,
    emails_processed, emails_failed, transactions_extracted, gmail_api_ms, db_ms,
    inference_ms, error_message, error_trace, error_code, messages_missing";

fn map_audit_row(row: &rusqlite::Row) -> rusqlite::Result<DbAuditEntry> {
    let headers: String = row.get(3)?;
    let status: String = row.get(9)?;
    let status = AuditStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(9, status.clone(), rusqlite::types::Type::Text)
    })?;
    Ok(DbAuditEntry {
        id: row.get(0)?,
        provider_message_id: row.get(1)?,
        subscription: row.get(2)?,
        raw_headers: serde_json::from_str(&headers).unwrap_or(serde_json::Value::Null),
        raw_body: row.get(4)?,
        email_address: row.get(5)?,
        history_id: row.get(6)?,
        mailbox_message_id: row.get(7)?,
        connection_id: row.get(8)?,
        status,
        skip_reason: row.get(10)?,
        received_at: row.get(11)?,
        processing_started_at: row.get(12)?,
        completed_at: row.get(13)?,
        duration_ms: row.get(14)?,
        emails_fetched: row.get(15)?,
        emails_processed: row.get(16)?,
        emails_failed: row.get(17)?,
        transactions_extracted: row.get(18)?,
        gmail_api_ms: row.get(19)?,
        db_ms: row.get(20)?,
        inference_ms: row.get(21)?,
        error_message: row.get(22)?,
        error_trace: row.get(23)?,
        error_code: row.get(24)?,
        messages_missing: row.get(25)?,
    })
}

impl PipelineDb {
    // =========================================================================
    // Webhook audit log
    // =========================================================================

    /// Record an inbound notification in the `received` state.
    pub fn insert_audit_entry(&self, entry: &NewAuditEntry) -> Result<String, String> {
        let id = Self::new_id();
        self.conn
            .execute(
                "INSERT INTO webhook_audit_log (
                    id, provider_message_id, subscription, raw_headers, raw_body,
                    status, received_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'received', ?6)",
                params![
                    id,
                    entry.provider_message_id,
                    entry.subscription,
                    entry.raw_headers.to_string(),
                    entry.raw_body,
                    Self::now(),
                ],
            )
            .map_err(|e| format!("Failed to insert audit entry: {e}"))?;
        Ok(id)
    }

    /// Attach decoded notification fields. Terminal entries are left alone.
    pub fn audit_record_notification(
        &self,
        id: &str,
        notification: &AuditNotification,
    ) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE webhook_audit_log SET
                    email_address = COALESCE(?1, email_address),
                    history_id = COALESCE(?2, history_id),
                    mailbox_message_id = COALESCE(?3, mailbox_message_id),
                    connection_id = COALESCE(?4, connection_id)
                 WHERE id = ?5 AND status IN ('received', 'processing')",
                params![
                    notification.email_address,
                    notification.history_id,
                    notification.mailbox_message_id,
                    notification.connection_id,
                    id,
                ],
            )
            .map_err(|e| format!("Failed to record notification on audit {id}: {e}"))?;
        Ok(())
    }

    fn audit_status(&self, id: &str) -> Result<Option<(AuditStatus, String)>, String> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT status, received_at FROM webhook_audit_log WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| format!("Failed to read audit {id}: {e}"))?;
        match row {
            None => Ok(None),
            Some((status, received_at)) => {
                let status = AuditStatus::parse(&status)
                    .ok_or_else(|| format!("Audit {id} has unknown status '{status}'"))?;
                Ok(Some((status, received_at)))
            }
        }
    }

    /// `received -> processing`.
    pub fn audit_mark_processing(&self, id: &str) -> Result<AuditTransition, String> {
        self.with_transaction(|db| {
            let Some((current, _)) = db.audit_status(id)? else {
                return Ok(AuditTransition::Missing);
            };
            if !current.can_transition_to(AuditStatus::Processing) {
                return Ok(AuditTransition::Refused { from: current });
            }
            db.conn
                .execute(
                    "UPDATE webhook_audit_log SET status = 'processing', processing_started_at = ?1
                     WHERE id = ?2 AND status = ?3",
                    params![Self::now(), id, current.as_str()],
                )
                .map_err(|e| format!("Failed to mark audit {id} processing: {e}"))?;
            Ok(AuditTransition::Applied)
        })
    }

    /// Move an entry to a terminal status and record counts, phase timings
    /// and error detail. `duration_ms` is measured from `received_at`.
    pub fn audit_complete(
        &self,
        id: &str,
        completion: &AuditCompletion,
    ) -> Result<AuditTransition, String> {
        self.with_transaction(|db| {
            let Some((current, received_at)) = db.audit_status(id)? else {
                return Ok(AuditTransition::Missing);
            };
            if !current.can_transition_to(completion.status) {
                return Ok(AuditTransition::Refused { from: current });
            }

            let now = Utc::now();
            let duration_ms = DateTime::parse_from_rfc3339(&received_at)
                .map(|t| (now - t.with_timezone(&Utc)).num_milliseconds().max(0))
                .ok();

            db.conn
                .execute(
                    "UPDATE webhook_audit_log SET
                        status = ?1,
                        skip_reason = ?2,
                        completed_at = ?3,
                        duration_ms = ?4,
                        emails_fetched = ?5,
                        emails_processed = ?6,
                        emails_failed = ?7,
                        transactions_extracted = ?8,
                        gmail_api_ms = ?9,
                        db_ms = ?10,
                        inference_ms = ?11,
                        error_message = ?12,
                        error_trace = ?13,
                        error_code = ?14,
                        messages_missing = ?15
                     WHERE id = ?16 AND status = ?17",
                    params![
                        completion.status.as_str(),
                        completion.skip_reason,
                        now.to_rfc3339(),
                        duration_ms,
                        completion.emails_fetched,
                        completion.emails_processed,
                        completion.emails_failed,
                        completion.transactions_extracted,
                        completion.gmail_api_ms as i64,
                        completion.db_ms as i64,
                        completion.inference_ms as i64,
                        completion.error_message,
                        completion.error_trace,
                        completion.error_code,
                        completion.messages_missing,
                        id,
                        current.as_str(),
                    ],
                )
                .map_err(|e| format!("Failed to complete audit {id}: {e}"))?;
            Ok(AuditTransition::Applied)
        })
    }

    pub fn get_audit_entry(&self, id: &str) -> Result<Option<DbAuditEntry>, String> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM webhook_audit_log WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], map_audit_row)
            .optional()
            .map_err(|e| format!("Failed to load audit {id}: {e}"))
    }

    /// Most recent entries first.
    pub fn list_recent_audit(&self, limit: usize) -> Result<Vec<DbAuditEntry>, String> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM webhook_audit_log
             ORDER BY received_at DESC, rowid DESC LIMIT ?1"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| format!("Failed to prepare audit listing: {e}"))?;
        let rows = stmt
            .query_map(params![limit as i64], map_audit_row)
            .map_err(|e| format!("Failed to list audit entries: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read audit row: {e}"))?);
        }
        Ok(results)
    }
}
