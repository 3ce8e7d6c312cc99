use super::*;

use crate::intelligence::extract::ExtractedTransaction;

const EMAIL_COLUMNS: &str = "id, connection_id, provider_message_id, thread_id, subject, sender,
    recipients, snippet, body_text, label_ids, internal_date, processed_ref, rejected_ref,
    created_at";

fn map_email_row(row: &rusqlite::Row) -> rusqlite::Result<DbStoredEmail> {
    let id: String = row.get(0)?;
    let label_json: String = row.get(9)?;
    let processed_ref: Option<String> = row.get(11)?;
    let rejected_ref: Option<String> = row.get(12)?;
    let status = EmailStatus::from_refs(processed_ref, rejected_ref).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(
            11,
            format!("processed_ref/rejected_ref both set on {id}"),
            rusqlite::types::Type::Text,
        )
    })?;
    Ok(DbStoredEmail {
        id,
        connection_id: row.get(1)?,
        provider_message_id: row.get(2)?,
        thread_id: row.get(3)?,
        subject: row.get(4)?,
        sender: row.get(5)?,
        recipients: row.get(6)?,
        snippet: row.get(7)?,
        body_text: row.get(8)?,
        label_ids: serde_json::from_str(&label_json).unwrap_or_default(),
        internal_date: row.get(10)?,
        status,
        created_at: row.get(13)?,
    })
}

fn map_rejection_row(row: &rusqlite::Row) -> rusqlite::Result<DbRejection> {
    let rejection_type: String = row.get(3)?;
    let detail: Option<String> = row.get(4)?;
    Ok(DbRejection {
        id: row.get(0)?,
        email_id: row.get(1)?,
        reason: row.get(2)?,
        rejection_type: RejectionType::parse(&rejection_type),
        error_detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
        rejected_at: row.get(5)?,
    })
}

fn map_transaction_row(row: &rusqlite::Row) -> rusqlite::Result<DbTransaction> {
    Ok(DbTransaction {
        id: row.get(0)?,
        email_id: row.get(1)?,
        occurred_at: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        direction: row.get(5)?,
        merchant_raw: row.get(6)?,
        merchant_normalized: row.get(7)?,
        category: row.get(8)?,
        reference_id: row.get(9)?,
        location: row.get(10)?,
        confidence: row.get(11)?,
        extraction_version: row.get(12)?,
        provider: row.get(13)?,
        model: row.get(14)?,
        notes: row.get(15)?,
        created_at: row.get(16)?,
    })
}

impl PipelineDb {
    // =========================================================================
    // Stored emails
    // =========================================================================

    /// Find the stored row for `(connection_id, provider_message_id)`.
    pub fn find_email_id(
        &self,
        connection_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT id FROM stored_emails
                 WHERE provider_message_id = ?1 AND connection_id = ?2",
                params![provider_message_id, connection_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("Failed to look up message {provider_message_id}: {e}"))
    }

    /// Insert a fetched email in the unprocessed state.
    ///
    /// Returns `(id, created)`. When a concurrent fetch already stored the
    /// same message the unique constraint swallows the insert and the
    /// existing row's id comes back with `created = false`.
    pub fn insert_email(&self, email: &NewStoredEmail) -> Result<(String, bool), String> {
        let id = Self::new_id();
        let labels = serde_json::to_string(&email.label_ids)
            .map_err(|e| format!("Failed to encode labels: {e}"))?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO stored_emails (
                    id, connection_id, provider_message_id, thread_id, subject, sender,
                    recipients, snippet, body_text, label_ids, internal_date, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(provider_message_id, connection_id) DO NOTHING",
                params![
                    id,
                    email.connection_id,
                    email.provider_message_id,
                    email.thread_id,
                    email.subject,
                    email.sender,
                    email.recipients,
                    email.snippet,
                    email.body_text,
                    labels,
                    email.internal_date,
                    Self::now(),
                ],
            )
            .map_err(|e| {
                format!(
                    "Failed to insert message {}: {e}",
                    email.provider_message_id
                )
            })?;

        if inserted == 1 {
            return Ok((id, true));
        }

        match self.find_email_id(&email.connection_id, &email.provider_message_id)? {
            Some(existing) => Ok((existing, false)),
            None => Err(format!(
                "Insert of {} conflicted but no existing row was found",
                email.provider_message_id
            )),
        }
    }

    pub fn get_email(&self, id: &str) -> Result<Option<DbStoredEmail>, String> {
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM stored_emails WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], map_email_row)
            .optional()
            .map_err(|e| format!("Failed to load email {id}: {e}"))
    }

    /// Next batch of unprocessed emails, newest provider timestamp first.
    pub fn get_unprocessed_batch(
        &self,
        connection_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DbStoredEmail>, String> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM stored_emails
             WHERE processed_ref IS NULL AND rejected_ref IS NULL
               AND (?1 IS NULL OR connection_id = ?1)
             ORDER BY internal_date DESC, created_at DESC
             LIMIT ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| format!("Failed to prepare unprocessed batch query: {e}"))?;
        let rows = stmt
            .query_map(params![connection_id, limit as i64], map_email_row)
            .map_err(|e| format!("Failed to query unprocessed batch: {e}"))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| format!("Failed to read email row: {e}"))?);
        }
        Ok(results)
    }

    pub fn count_unprocessed(&self, connection_id: Option<&str>) -> Result<usize, String> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM stored_emails
                 WHERE processed_ref IS NULL AND rejected_ref IS NULL
                   AND (?1 IS NULL OR connection_id = ?1)",
                params![connection_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(|e| format!("Failed to count unprocessed emails: {e}"))
    }

    /// Whether the email is still waiting for a transaction or rejection.
    fn is_unresolved(&self, email_id: &str) -> Result<bool, String> {
        self.conn
            .query_row(
                "SELECT processed_ref IS NULL AND rejected_ref IS NULL
                 FROM stored_emails WHERE id = ?1",
                params![email_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map_err(|e| format!("Failed to read status of {email_id}: {e}"))?
            .ok_or_else(|| format!("Email {email_id} not found"))
    }

    /// Point one reference of an unprocessed email at a new row, guarded on
    /// both references still being NULL.
    fn resolve_email(&self, email_id: &str, column: &str, target_id: &str) -> Result<(), String> {
        let sql = format!(
            "UPDATE stored_emails SET {column} = ?1
             WHERE id = ?2 AND processed_ref IS NULL AND rejected_ref IS NULL"
        );
        let rows = self
            .conn
            .execute(&sql, params![target_id, email_id])
            .map_err(|e| format!("Failed to set {column} on {email_id}: {e}"))?;
        if rows == 0 {
            return Err(format!("Email {email_id} was resolved mid-transaction"));
        }
        Ok(())
    }

    /// Insert the extracted transaction and set `processed_ref` atomically.
    ///
    /// An email that a concurrent drain already resolved yields
    /// `Resolution::AlreadyResolved` and writes nothing.
    pub fn mark_processed(
        &self,
        email_id: &str,
        txn: &ExtractedTransaction,
    ) -> Result<Resolution, String> {
        self.with_transaction(|db| {
            if !db.is_unresolved(email_id)? {
                return Ok(Resolution::AlreadyResolved);
            }
            let id = Self::new_id();
            db.conn
                .execute(
                    "INSERT INTO transactions (
                        id, email_id, occurred_at, amount, currency, direction,
                        merchant_raw, merchant_normalized, category, reference_id, location,
                        confidence, extraction_version, provider, model, notes, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        id,
                        email_id,
                        txn.occurred_at.to_rfc3339(),
                        txn.amount,
                        txn.currency,
                        txn.direction.as_str(),
                        txn.merchant_raw,
                        txn.merchant_normalized,
                        txn.category,
                        txn.reference_id,
                        txn.location,
                        txn.confidence,
                        txn.extraction_version,
                        txn.provider,
                        txn.model,
                        txn.notes,
                        Self::now(),
                    ],
                )
                .map_err(|e| format!("Failed to insert transaction for {email_id}: {e}"))?;
            db.resolve_email(email_id, "processed_ref", &id)?;
            Ok(Resolution::Resolved(id))
        })
    }

    /// Insert a rejection record and set `rejected_ref` atomically.
    pub fn mark_rejected(
        &self,
        email_id: &str,
        rejection: &NewRejection,
    ) -> Result<Resolution, String> {
        self.with_transaction(|db| {
            if !db.is_unresolved(email_id)? {
                return Ok(Resolution::AlreadyResolved);
            }
            let id = Self::new_id();
            let detail = rejection
                .error_detail
                .as_ref()
                .map(|d| d.to_string());
            db.conn
                .execute(
                    "INSERT INTO rejections (id, email_id, reason, rejection_type, error_detail, rejected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        email_id,
                        rejection.reason,
                        rejection.rejection_type.as_str(),
                        detail,
                        Self::now(),
                    ],
                )
                .map_err(|e| format!("Failed to insert rejection for {email_id}: {e}"))?;
            db.resolve_email(email_id, "rejected_ref", &id)?;
            Ok(Resolution::Resolved(id))
        })
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<DbTransaction>, String> {
        self.conn
            .query_row(
                "SELECT id, email_id, occurred_at, amount, currency, direction, merchant_raw,
                        merchant_normalized, category, reference_id, location, confidence,
                        extraction_version, provider, model, notes, created_at
                 FROM transactions WHERE id = ?1",
                params![id],
                map_transaction_row,
            )
            .optional()
            .map_err(|e| format!("Failed to load transaction {id}: {e}"))
    }

    pub fn get_rejection(&self, id: &str) -> Result<Option<DbRejection>, String> {
        self.conn
            .query_row(
                "SELECT id, email_id, reason, rejection_type, error_detail, rejected_at
                 FROM rejections WHERE id = ?1",
                params![id],
                map_rejection_row,
            )
            .optional()
            .map_err(|e| format!("Failed to load rejection {id}: {e}"))
    }
}
