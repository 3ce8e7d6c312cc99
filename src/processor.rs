//! Email processing orchestrator.
//!
//! Drains unprocessed emails in fixed-size batches: extract, then either
//! record the transaction or record a rejection. Every email in a batch ends
//! with a terminal status, so each pass shrinks the backlog and the drain
//! terminates.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::db::{EmailStatus, NewRejection, RejectionType, Resolution, SharedDb};
use crate::error::PipelineError;
use crate::intelligence::{ExtractionEngine, ExtractionInput, ExtractionMode};
use crate::latency::{self, Phase};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub processed: u32,
    pub rejected: u32,
    /// Emails another drain resolved while this one was extracting them.
    pub skipped: u32,
    pub batches: u32,
    /// Unprocessed emails left after the last batch. Non-zero only when the
    /// batch cap was reached.
    pub remaining: usize,
    pub mode: String,
    pub inference_ms: u64,
    pub db_ms: u64,
}

pub struct Orchestrator {
    db: SharedDb,
    engine: Arc<ExtractionEngine>,
    batch_size: usize,
    max_batches: usize,
    default_mode: ExtractionMode,
}

impl Orchestrator {
    pub fn new(
        db: SharedDb,
        engine: Arc<ExtractionEngine>,
        batch_size: usize,
        max_batches: usize,
        default_mode: ExtractionMode,
    ) -> Self {
        Self {
            db,
            engine,
            batch_size: batch_size.max(1),
            max_batches: max_batches.max(1),
            default_mode,
        }
    }

    pub fn default_mode(&self) -> ExtractionMode {
        self.default_mode
    }

    /// Process every unprocessed email, optionally scoped to one connection.
    ///
    /// Extraction failures become rejections. An email resolved meanwhile
    /// by an overlapping drain is skipped. Datastore failures abort the
    /// drain.
    pub async fn drain(
        &self,
        connection_id: Option<&str>,
    ) -> Result<ProcessSummary, PipelineError> {
        let started = Instant::now();
        let mode = self
            .db
            .lock()
            .get_extraction_mode(self.default_mode)
            .map_err(PipelineError::Datastore)?;
        let mut summary = ProcessSummary {
            mode: mode.as_str().to_string(),
            ..Default::default()
        };

        let mut remaining = self.count(connection_id, &mut summary)?;
        while remaining > 0 {
            if summary.batches as usize >= self.max_batches {
                log::warn!(
                    "processor: stopping after {} batches with {} emails left",
                    summary.batches,
                    remaining
                );
                break;
            }

            let db_start = Instant::now();
            let batch = self
                .db
                .lock()
                .get_unprocessed_batch(connection_id, self.batch_size)
                .map_err(PipelineError::Datastore)?;
            summary.db_ms += db_start.elapsed().as_millis() as u64;
            if batch.is_empty() {
                break;
            }
            summary.batches += 1;

            for email in &batch {
                let input = ExtractionInput::from_email(email);
                let inference_start = Instant::now();
                let result = self.engine.extract(&input, mode).await;
                let inference_ms = inference_start.elapsed().as_millis() as u64;
                summary.inference_ms += inference_ms;
                latency::record_latency(Phase::Inference, inference_ms);

                let db_start = Instant::now();
                match result {
                    Ok(txn) => {
                        let resolution = self
                            .db
                            .lock()
                            .mark_processed(&email.id, &txn)
                            .map_err(PipelineError::Datastore)?;
                        if resolution == Resolution::AlreadyResolved {
                            log::info!("processor: {} resolved by another drain", email.id);
                            summary.skipped += 1;
                        } else {
                            summary.processed += 1;
                            log::info!(
                                "processor: {} -> {} {} ({})",
                                email.id,
                                txn.amount,
                                txn.currency,
                                txn.provider
                            );
                        }
                    }
                    Err(failure) => {
                        latency::record_failure(Phase::Inference);
                        let rejection = NewRejection {
                            reason: failure.kind.as_str().to_string(),
                            rejection_type: RejectionType::Automatic,
                            error_detail: Some(failure.to_detail()),
                        };
                        let resolution = self
                            .db
                            .lock()
                            .mark_rejected(&email.id, &rejection)
                            .map_err(PipelineError::Datastore)?;
                        if resolution == Resolution::AlreadyResolved {
                            log::info!("processor: {} resolved by another drain", email.id);
                            summary.skipped += 1;
                        } else {
                            summary.rejected += 1;
                            log::info!("processor: {} rejected: {}", email.id, failure);
                        }
                    }
                }
                summary.db_ms += db_start.elapsed().as_millis() as u64;
            }

            remaining = self.count(connection_id, &mut summary)?;
        }

        summary.remaining = remaining;
        let elapsed = started.elapsed().as_millis() as u64;
        latency::record_latency(Phase::Drain, elapsed);
        log::info!(
            "processor: drain finished in {}ms ({} processed, {} rejected, {} batches, mode {})",
            elapsed,
            summary.processed,
            summary.rejected,
            summary.batches,
            summary.mode
        );
        Ok(summary)
    }

    fn count(
        &self,
        connection_id: Option<&str>,
        summary: &mut ProcessSummary,
    ) -> Result<usize, PipelineError> {
        let start = Instant::now();
        let count = self
            .db
            .lock()
            .count_unprocessed(connection_id)
            .map_err(PipelineError::Datastore)?;
        summary.db_ms += start.elapsed().as_millis() as u64;
        Ok(count)
    }

    /// Exclude an email by hand. Only emails still awaiting processing can
    /// be excluded. Returns the rejection id.
    pub fn reject_manually(&self, email_id: &str, reason: &str) -> Result<String, PipelineError> {
        let db = self.db.lock();
        let email = db
            .get_email(email_id)
            .map_err(PipelineError::Datastore)?
            .ok_or_else(|| PipelineError::EmailNotFound(email_id.to_string()))?;
        if email.status != EmailStatus::Fetched {
            return Err(PipelineError::AlreadyResolved(email_id.to_string()));
        }
        let rejection = NewRejection {
            reason: reason.trim().to_string(),
            rejection_type: RejectionType::Manual,
            error_detail: None,
        };
        let id = match db
            .mark_rejected(email_id, &rejection)
            .map_err(PipelineError::Datastore)?
        {
            Resolution::Resolved(id) => id,
            Resolution::AlreadyResolved => {
                return Err(PipelineError::AlreadyResolved(email_id.to_string()))
            }
        };
        log::info!("processor: {} excluded manually", email_id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::intelligence::manager::fakes::ScriptedAdapter;
    use crate::intelligence::{InferenceManager, ModelAdapter};
    use std::time::Duration;

    fn orchestrator(
        db: SharedDb,
        providers: Vec<Arc<dyn ModelAdapter>>,
        batch_size: usize,
        max_batches: usize,
    ) -> Orchestrator {
        let engine = ExtractionEngine::new(
            Arc::new(InferenceManager::new(providers, None)),
            Duration::from_secs(5),
        );
        Orchestrator::new(
            db,
            Arc::new(engine),
            batch_size,
            max_batches,
            ExtractionMode::Real,
        )
    }

    fn seeded(n: usize) -> SharedDb {
        let db = test_db();
        db.upsert_connection(&sample_connection("c1", "me@example.com"))
            .unwrap();
        for i in 0..n {
            let mut email = sample_email("c1", &format!("m{i}"), 1_000 + i as i64);
            email.body_text = format!("Rs {} debited at Swiggy", 100 + i);
            db.insert_email(&email).unwrap();
        }
        db.into_shared()
    }

    #[tokio::test]
    async fn test_failing_extraction_still_drains_everything() {
        let db = seeded(7);
        let failing = Arc::new(ScriptedAdapter::failing("openai"));
        let orch = orchestrator(db.clone(), vec![failing.clone() as Arc<dyn ModelAdapter>], 3, 100);

        let summary = orch.drain(None).await.unwrap();
        assert_eq!(summary.rejected, 7);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.remaining, 0);
        assert_eq!(db.lock().count_unprocessed(None).unwrap(), 0);
        assert_eq!(db.lock().count_status_conflicts().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_mode_processes_without_providers() {
        let db = seeded(2);
        db.lock().set_extraction_mode(ExtractionMode::Mock).unwrap();
        let orch = orchestrator(db.clone(), Vec::new(), 10, 100);

        let summary = orch.drain(Some("c1")).await.unwrap();
        assert_eq!(summary.mode, "mock");
        assert_eq!(summary.processed, 2);

        let batch = db.lock().get_unprocessed_batch(None, 10).unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_real_mode_without_providers_rejects_with_detail() {
        let db = seeded(1);
        let orch = orchestrator(db.clone(), Vec::new(), 10, 100);
        orch.drain(None).await.unwrap();

        let id = db
            .lock()
            .find_email_id("c1", "m0")
            .unwrap()
            .unwrap();
        let email = db.lock().get_email(&id).unwrap().unwrap();
        let rejection_id = match &email.status {
            EmailStatus::Rejected(id) => id.clone(),
            other => panic!("expected rejection, got {:?}", other),
        };
        let rejection = db.lock().get_rejection(&rejection_id).unwrap().unwrap();
        assert_eq!(rejection.reason, "no_provider");
        assert_eq!(rejection.rejection_type, RejectionType::Automatic);
        assert_eq!(rejection.error_detail.unwrap()["kind"], "no_provider");
    }

    #[tokio::test]
    async fn test_batch_cap_bounds_the_drain() {
        let db = seeded(5);
        let failing: Arc<dyn ModelAdapter> = Arc::new(ScriptedAdapter::failing("openai"));
        let orch = orchestrator(db, vec![failing], 2, 1);
        let summary = orch.drain(None).await.unwrap();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.remaining, 3);
    }

    #[tokio::test]
    async fn test_scoped_drain_leaves_other_connections() {
        let db = seeded(1);
        {
            let guard = db.lock();
            guard
                .upsert_connection(&sample_connection("c2", "other@example.com"))
                .unwrap();
            guard.insert_email(&sample_email("c2", "x1", 5)).unwrap();
            guard.set_extraction_mode(ExtractionMode::Mock).unwrap();
        }
        let orch = orchestrator(db.clone(), Vec::new(), 10, 100);
        orch.drain(Some("c1")).await.unwrap();
        assert_eq!(db.lock().count_unprocessed(Some("c2")).unwrap(), 1);
        assert_eq!(db.lock().count_unprocessed(Some("c1")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_drains_resolve_each_email_once() {
        let db = seeded(1);
        let slow = || -> Vec<Arc<dyn ModelAdapter>> {
            vec![Arc::new(
                ScriptedAdapter::ok("openai", r#"{"amount": 99, "direction": "debit"}"#)
                    .with_delay(Duration::from_millis(30)),
            )]
        };
        let a = orchestrator(db.clone(), slow(), 10, 100);
        let b = orchestrator(db.clone(), slow(), 10, 100);

        let (first, second) = tokio::join!(a.drain(Some("c1")), b.drain(None));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.processed + second.processed, 1);
        assert_eq!(first.skipped + second.skipped, 1);
        assert_eq!(first.rejected + second.rejected, 0);

        let transactions: i64 = db
            .lock()
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(transactions, 1);
        assert_eq!(db.lock().count_unprocessed(None).unwrap(), 0);
        assert_eq!(db.lock().count_status_conflicts().unwrap(), 0);
    }

    #[test]
    fn test_manual_exclusion_only_from_fetched() {
        let db = seeded(1);
        let orch = orchestrator(db.clone(), Vec::new(), 10, 100);
        let id = db.lock().find_email_id("c1", "m0").unwrap().unwrap();

        orch.reject_manually(&id, " duplicate alert ").unwrap();
        let email = db.lock().get_email(&id).unwrap().unwrap();
        assert!(matches!(email.status, EmailStatus::Rejected(_)));

        assert!(matches!(
            orch.reject_manually(&id, "again"),
            Err(PipelineError::AlreadyResolved(_))
        ));
        assert!(matches!(
            orch.reject_manually("missing", "x"),
            Err(PipelineError::EmailNotFound(_))
        ));
    }
}
