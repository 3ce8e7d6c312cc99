//! Idempotent message fetcher.
//!
//! `(connection_id, provider_message_id)` is stored at most once. A repeat
//! fetch returns the existing row without calling Gmail; a concurrent
//! duplicate loses the insert race and resolves to the winner's row.

use std::sync::Arc;
use std::time::Instant;

use crate::audit::PhaseTimings;
use crate::db::SharedDb;
use crate::error::PipelineError;
use crate::google_api::gmail::MailboxApi;
use crate::google_api::token_guard::TokenGuard;
use crate::latency::{self, Phase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub email_id: String,
    pub created: bool,
    pub timings: PhaseTimings,
}

/// Result of a history-driven sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub fetched: Vec<FetchOutcome>,
    /// Listed message ids that Gmail no longer has.
    pub missing: Vec<String>,
    pub new_history_id: Option<String>,
    pub timings: PhaseTimings,
}

impl SyncOutcome {
    pub fn created_count(&self) -> u32 {
        self.fetched.iter().filter(|f| f.created).count() as u32
    }
}

pub struct MessageFetcher {
    db: SharedDb,
    mailbox: Arc<dyn MailboxApi>,
    tokens: Arc<TokenGuard>,
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

impl MessageFetcher {
    pub fn new(db: SharedDb, mailbox: Arc<dyn MailboxApi>, tokens: Arc<TokenGuard>) -> Self {
        Self {
            db,
            mailbox,
            tokens,
        }
    }

    async fn token_for(
        &self,
        connection_id: &str,
        timings: &mut PhaseTimings,
    ) -> Result<String, PipelineError> {
        let start = Instant::now();
        let token = self.tokens.access_token(&self.db, connection_id).await;
        timings.gmail_api_ms += elapsed_ms(start);
        token
    }

    /// Fetch one message and store it unless it is already stored.
    ///
    /// The token is validated (and refreshed) before the duplicate check so a
    /// revoked grant surfaces even for redelivered notifications.
    pub async fn fetch(
        &self,
        connection_id: &str,
        message_id: &str,
    ) -> Result<FetchOutcome, PipelineError> {
        let mut timings = PhaseTimings::default();

        let db_start = Instant::now();
        self.db
            .lock()
            .get_connection(connection_id)
            .map_err(PipelineError::Datastore)?
            .ok_or_else(|| PipelineError::ConnectionNotFound(connection_id.to_string()))?;
        timings.db_ms += elapsed_ms(db_start);

        let token = self.token_for(connection_id, &mut timings).await?;

        let db_start = Instant::now();
        let existing = self
            .db
            .lock()
            .find_email_id(connection_id, message_id)
            .map_err(PipelineError::Datastore)?;
        timings.db_ms += elapsed_ms(db_start);
        if let Some(email_id) = existing {
            log::debug!("fetcher: {} already stored as {}", message_id, email_id);
            return Ok(FetchOutcome {
                email_id,
                created: false,
                timings,
            });
        }

        let api_start = Instant::now();
        let message = self.mailbox.get_message(&token, message_id).await;
        let api_ms = elapsed_ms(api_start);
        timings.gmail_api_ms += api_ms;
        latency::record_latency(Phase::GmailApi, api_ms);
        let message = message.map_err(|e| {
            latency::record_failure(Phase::GmailApi);
            if e.is_auth_failure() {
                if let Err(db_err) = self
                    .db
                    .lock()
                    .mark_connection_auth_expired(connection_id, &e.to_string())
                {
                    log::warn!("fetcher: failed to flag {}: {}", connection_id, db_err);
                }
            }
            PipelineError::from_google(connection_id, e)
        })?;

        let row = message.to_new_email(connection_id);
        let db_start = Instant::now();
        let (email_id, created) = self
            .db
            .lock()
            .insert_email(&row)
            .map_err(PipelineError::Datastore)?;
        let db_ms = elapsed_ms(db_start);
        timings.db_ms += db_ms;
        latency::record_latency(Phase::Datastore, db_ms);

        if created {
            log::info!(
                "fetcher: stored {} for {} ({} body chars)",
                message_id,
                connection_id,
                row.body_text.chars().count()
            );
        } else {
            log::info!("fetcher: {} stored concurrently as {}", message_id, email_id);
        }

        Ok(FetchOutcome {
            email_id,
            created,
            timings,
        })
    }

    /// Fetch every message added since the connection's stored history id,
    /// then advance it to `notified_history_id`.
    ///
    /// With no stored history id there is nothing to diff against; the id is
    /// only recorded. Messages deleted before they could be fetched are
    /// skipped; any other failure leaves the stored id untouched.
    pub async fn sync_history(
        &self,
        connection_id: &str,
        notified_history_id: &str,
    ) -> Result<SyncOutcome, PipelineError> {
        let mut outcome = SyncOutcome::default();

        let connection = self
            .db
            .lock()
            .get_connection(connection_id)
            .map_err(PipelineError::Datastore)?
            .ok_or_else(|| PipelineError::ConnectionNotFound(connection_id.to_string()))?;

        let Some(start_id) = connection.last_history_id else {
            log::info!(
                "fetcher: first notification for {}, recording history id {}",
                connection_id,
                notified_history_id
            );
            self.db
                .lock()
                .set_last_history_id(connection_id, notified_history_id)
                .map_err(PipelineError::Datastore)?;
            outcome.new_history_id = Some(notified_history_id.to_string());
            return Ok(outcome);
        };

        let token = self.token_for(connection_id, &mut outcome.timings).await?;
        let api_start = Instant::now();
        let delta = self
            .mailbox
            .list_added_messages(&token, &start_id)
            .await
            .map_err(|e| PipelineError::from_google(connection_id, e))?;
        outcome.timings.gmail_api_ms += elapsed_ms(api_start);

        for message_id in &delta.message_ids {
            match self.fetch(connection_id, message_id).await {
                Ok(fetched) => {
                    outcome.timings.add(fetched.timings);
                    outcome.fetched.push(fetched);
                }
                Err(PipelineError::External(e)) if e.is_not_found() => {
                    log::info!(
                        "fetcher: {} listed in history for {} but already deleted",
                        message_id,
                        connection_id
                    );
                    outcome.missing.push(message_id.clone());
                }
                Err(e) => return Err(e),
            }
        }

        let next = delta
            .history_id
            .unwrap_or_else(|| notified_history_id.to_string());
        self.db
            .lock()
            .set_last_history_id(connection_id, &next)
            .map_err(PipelineError::Datastore)?;
        outcome.new_history_id = Some(next);
        Ok(outcome)
    }
}
