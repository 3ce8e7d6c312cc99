//! Forensic record of each inbound notification.
//!
//! Wraps the `webhook_audit_log` table with the lifecycle
//! `received -> processing -> {success|failed|skipped}` and turns pipeline
//! errors into stored message/trace/code triples. Entries are never deleted.

use serde::Serialize;

use crate::db::{
    AuditCompletion, AuditNotification, AuditStatus, AuditTransition, NewAuditEntry, SharedDb,
};
use crate::error::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit entry {0} not found")]
    NotFound(String),

    #[error("Audit entry {id} cannot move from {} to {}", .from.as_str(), .to.as_str())]
    IllegalTransition {
        id: String,
        from: AuditStatus,
        to: AuditStatus,
    },

    #[error("Audit store: {0}")]
    Store(String),
}

/// Milliseconds spent per external dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub gmail_api_ms: u64,
    pub db_ms: u64,
    pub inference_ms: u64,
}

impl PhaseTimings {
    pub fn add(&mut self, other: PhaseTimings) {
        self.gmail_api_ms += other.gmail_api_ms;
        self.db_ms += other.db_ms;
        self.inference_ms += other.inference_ms;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditCounts {
    pub emails_fetched: u32,
    pub emails_processed: u32,
    pub emails_failed: u32,
    pub transactions_extracted: u32,
    /// History entries whose message was deleted before it could be fetched.
    pub messages_missing: u32,
}

/// Display message, full cause chain and a stable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditErrorDetail {
    pub message: String,
    pub trace: String,
    pub code: String,
}

impl AuditErrorDetail {
    pub fn from_pipeline_error(err: &PipelineError) -> Self {
        Self {
            message: err.to_string(),
            trace: err.trace(),
            code: err.error_code(),
        }
    }
}

/// Terminal outcome handed to [`AuditRecorder::complete`].
#[derive(Debug, Clone)]
pub enum AuditOutcome {
    Success,
    Skipped(String),
    Failed(AuditErrorDetail),
}

impl AuditOutcome {
    fn status(&self) -> AuditStatus {
        match self {
            AuditOutcome::Success => AuditStatus::Success,
            AuditOutcome::Skipped(_) => AuditStatus::Skipped,
            AuditOutcome::Failed(_) => AuditStatus::Failed,
        }
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    db: SharedDb,
}

impl AuditRecorder {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Capture the raw envelope before any parsing. Returns the entry id.
    pub fn begin(&self, entry: &NewAuditEntry) -> Result<String, AuditError> {
        self.db
            .lock()
            .insert_audit_entry(entry)
            .map_err(AuditError::Store)
    }

    pub fn record_notification(
        &self,
        id: &str,
        notification: &AuditNotification,
    ) -> Result<(), AuditError> {
        self.db
            .lock()
            .audit_record_notification(id, notification)
            .map_err(AuditError::Store)
    }

    pub fn mark_processing(&self, id: &str) -> Result<(), AuditError> {
        let result = self
            .db
            .lock()
            .audit_mark_processing(id)
            .map_err(AuditError::Store)?;
        check_transition(id, AuditStatus::Processing, result)
    }

    pub fn complete(
        &self,
        id: &str,
        outcome: AuditOutcome,
        counts: AuditCounts,
        timings: PhaseTimings,
    ) -> Result<(), AuditError> {
        let status = outcome.status();
        let mut completion = AuditCompletion::new(status);
        completion.emails_fetched = counts.emails_fetched;
        completion.emails_processed = counts.emails_processed;
        completion.emails_failed = counts.emails_failed;
        completion.transactions_extracted = counts.transactions_extracted;
        completion.messages_missing = counts.messages_missing;
        completion.gmail_api_ms = timings.gmail_api_ms;
        completion.db_ms = timings.db_ms;
        completion.inference_ms = timings.inference_ms;
        match outcome {
            AuditOutcome::Success => {}
            AuditOutcome::Skipped(reason) => completion.skip_reason = Some(reason),
            AuditOutcome::Failed(detail) => {
                completion.error_message = Some(detail.message);
                completion.error_trace = Some(detail.trace);
                completion.error_code = Some(detail.code);
            }
        }

        let result = self
            .db
            .lock()
            .audit_complete(id, &completion)
            .map_err(AuditError::Store)?;
        check_transition(id, status, result)
    }

    /// Complete without surfacing audit errors to the caller.
    pub fn complete_logged(
        &self,
        id: &str,
        outcome: AuditOutcome,
        counts: AuditCounts,
        timings: PhaseTimings,
    ) {
        if let Err(e) = self.complete(id, outcome, counts, timings) {
            log::warn!("webhook: audit completion failed: {}", e);
        }
    }
}

fn check_transition(
    id: &str,
    to: AuditStatus,
    result: AuditTransition,
) -> Result<(), AuditError> {
    match result {
        AuditTransition::Applied => Ok(()),
        AuditTransition::Missing => Err(AuditError::NotFound(id.to_string())),
        AuditTransition::Refused { from } => Err(AuditError::IllegalTransition {
            id: id.to_string(),
            from,
            to,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::google_api::GoogleApiError;

    fn recorder() -> AuditRecorder {
        AuditRecorder::new(test_db().into_shared())
    }

    #[test]
    fn test_failed_entry_stores_trace_and_code() {
        let audit = recorder();
        let id = audit.begin(&NewAuditEntry::default()).unwrap();
        audit.mark_processing(&id).unwrap();

        let err = PipelineError::from_google("c1", GoogleApiError::AuthExpired);
        audit
            .complete(
                &id,
                AuditOutcome::Failed(AuditErrorDetail::from_pipeline_error(&err)),
                AuditCounts::default(),
                PhaseTimings {
                    gmail_api_ms: 12,
                    ..Default::default()
                },
            )
            .unwrap();

        let entry = audit.db.lock().get_audit_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, AuditStatus::Failed);
        assert_eq!(entry.error_code.as_deref(), Some("auth_expired"));
        assert!(entry
            .error_trace
            .as_deref()
            .unwrap()
            .contains("caused by: Token expired or revoked"));
        assert_eq!(entry.gmail_api_ms, 12);
    }

    #[test]
    fn test_illegal_transition_is_an_error() {
        let audit = recorder();
        let id = audit.begin(&NewAuditEntry::default()).unwrap();
        let err = audit
            .complete(
                &id,
                AuditOutcome::Success,
                AuditCounts::default(),
                PhaseTimings::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AuditError::IllegalTransition {
                from: AuditStatus::Received,
                to: AuditStatus::Success,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_entry() {
        let audit = recorder();
        assert!(matches!(
            audit.mark_processing("nope"),
            Err(AuditError::NotFound(_))
        ));
    }

    #[test]
    fn test_timings_add() {
        let mut total = PhaseTimings::default();
        total.add(PhaseTimings {
            gmail_api_ms: 5,
            db_ms: 1,
            inference_ms: 0,
        });
        total.add(PhaseTimings {
            gmail_api_ms: 5,
            db_ms: 2,
            inference_ms: 40,
        });
        assert_eq!(
            total,
            PhaseTimings {
                gmail_api_ms: 10,
                db_ms: 3,
                inference_ms: 40
            }
        );
    }
}
