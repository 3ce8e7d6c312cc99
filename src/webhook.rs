//! Push-notification gateway.
//!
//! Accepts the mailbox provider's push envelope, normalizes the two payload
//! shapes it has used over time, and dispatches to the fetcher (and the
//! orchestrator when auto-sync is on). Every request that passes the secret
//! check leaves exactly one audit entry behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::audit::{
    AuditCounts, AuditErrorDetail, AuditOutcome, AuditRecorder, PhaseTimings,
};
use crate::db::{AuditNotification, NewAuditEntry, SharedDb};
use crate::error::PipelineError;
use crate::fetcher::MessageFetcher;
use crate::latency::{self, Phase};
use crate::processor::{Orchestrator, ProcessSummary};
use crate::util::{bare_address, decode_base64_text};

pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// `{ message: { data, messageId, publishTime, attributes? }, subscription }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    #[serde(default)]
    pub message: Option<PushMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "publish_time")]
    pub publish_time: Option<String>,
    #[serde(default)]
    pub attributes: Option<HashMap<String, String>>,
}

/// Decoded notification, identical for both payload shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub email_address: String,
    pub message_id: Option<String>,
    pub history_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPayload {
    Notification(Notification),
    /// Synthetic notification sent while setting up the subscription.
    TestMessage,
}

/// Base64 JSON carried in `message.data` by the legacy shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPayload {
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    history_id: Option<serde_json::Value>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    sender: Option<String>,
}

/// No configured secret means verification is off; otherwise the header
/// must match exactly.
pub fn verify_secret(configured: Option<&str>, presented: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => presented == Some(expected),
    }
}

/// Parse the body and require `message.messageId` plus `data` and/or
/// `attributes`.
pub fn validate_envelope(raw_body: &str) -> Result<PushEnvelope, PipelineError> {
    let envelope: PushEnvelope = serde_json::from_str(raw_body)
        .map_err(|e| PipelineError::MalformedInput(format!("envelope is not valid JSON: {e}")))?;
    let message = envelope
        .message
        .as_ref()
        .ok_or_else(|| PipelineError::MalformedInput("envelope has no message".to_string()))?;
    if non_blank(message.message_id.as_deref()).is_none() {
        return Err(PipelineError::MalformedInput(
            "message has no messageId".to_string(),
        ));
    }
    let has_data = non_blank(message.data.as_deref()).is_some();
    let has_attributes = message.attributes.as_ref().is_some_and(|a| !a.is_empty());
    if !has_data && !has_attributes {
        return Err(PipelineError::MalformedInput(
            "message has neither data nor attributes".to_string(),
        ));
    }
    Ok(envelope)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn owned(value: Option<&str>) -> Option<String> {
    non_blank(value).map(str::to_string)
}

fn is_test_payload(decoded: &str) -> bool {
    decoded.to_lowercase().contains("test")
}

/// Normalize either payload shape.
///
/// The attribute map wins when it carries `emailAddress`; otherwise `data`
/// is decoded as base64 JSON. Decoded text mentioning "test" is a
/// synthetic notification.
pub fn parse_notification(message: &PushMessage) -> Result<ParsedPayload, PipelineError> {
    if let Some(attrs) = message
        .attributes
        .as_ref()
        .filter(|a| non_blank(a.get("emailAddress").map(String::as_str)).is_some())
    {
        let get = |key: &str| owned(attrs.get(key).map(String::as_str));
        return Ok(ParsedPayload::Notification(Notification {
            email_address: bare_address(&get("emailAddress").unwrap_or_default()),
            message_id: get("messageId"),
            history_id: get("historyId"),
            subject: get("subject"),
            sender: get("sender"),
        }));
    }

    let data = non_blank(message.data.as_deref()).ok_or_else(|| {
        PipelineError::MalformedInput("attributes carry no emailAddress and data is empty".into())
    })?;
    let decoded = decode_base64_text(data)
        .ok_or_else(|| PipelineError::MalformedInput("data is not valid base64".to_string()))?;
    if is_test_payload(&decoded) {
        return Ok(ParsedPayload::TestMessage);
    }

    let payload: LegacyPayload = serde_json::from_str(&decoded)
        .map_err(|e| PipelineError::MalformedInput(format!("decoded data is not JSON: {e}")))?;
    let email_address = owned(payload.email_address.as_deref()).ok_or_else(|| {
        PipelineError::MalformedInput("notification has no emailAddress".to_string())
    })?;
    let history_id = match payload.history_id {
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::String(s)) => owned(Some(&s)),
        _ => None,
    };
    Ok(ParsedPayload::Notification(Notification {
        email_address: bare_address(&email_address),
        message_id: owned(payload.message_id.as_deref()),
        history_id,
        subject: owned(payload.subject.as_deref()),
        sender: owned(payload.sender.as_deref()),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Success,
    Skipped,
    TestDetected,
}

/// 200 response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReply {
    pub status: WebhookStatus,
    pub audit_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub email_ids: Vec<String>,
    pub emails_created: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessSummary>,
}

impl WebhookReply {
    fn new(status: WebhookStatus, audit_id: &str) -> Self {
        Self {
            status,
            audit_id: audit_id.to_string(),
            reason: None,
            email_ids: Vec::new(),
            emails_created: 0,
            processing: None,
        }
    }
}

pub struct WebhookGateway {
    db: SharedDb,
    audit: AuditRecorder,
    fetcher: Arc<MessageFetcher>,
    orchestrator: Arc<Orchestrator>,
    shared_secret: Option<String>,
}

impl WebhookGateway {
    pub fn new(
        db: SharedDb,
        audit: AuditRecorder,
        fetcher: Arc<MessageFetcher>,
        orchestrator: Arc<Orchestrator>,
        shared_secret: Option<String>,
    ) -> Self {
        Self {
            db,
            audit,
            fetcher,
            orchestrator,
            shared_secret: shared_secret.filter(|s| !s.is_empty()),
        }
    }

    /// Handle one push delivery. `Ok` maps to 200; errors carry their own
    /// status code (credential failures are still acknowledged with 200).
    pub async fn ingest(
        &self,
        presented_token: Option<&str>,
        raw_headers: serde_json::Value,
        raw_body: &[u8],
    ) -> Result<WebhookReply, PipelineError> {
        if !verify_secret(self.shared_secret.as_deref(), presented_token) {
            log::warn!("webhook: rejected delivery with missing or wrong token");
            return Err(PipelineError::Unauthorized);
        }

        let started = Instant::now();
        let loose: serde_json::Value =
            serde_json::from_slice(raw_body).unwrap_or(serde_json::Value::Null);
        let entry = NewAuditEntry {
            provider_message_id: loose
                .pointer("/message/messageId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            subscription: loose
                .get("subscription")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            raw_headers,
            raw_body: String::from_utf8_lossy(raw_body).into_owned(),
        };
        let audit_id = self
            .audit
            .begin(&entry)
            .map_err(|e| PipelineError::Datastore(e.to_string()))?;

        let result = match std::str::from_utf8(raw_body) {
            Ok(text) => self.handle(&audit_id, text).await,
            Err(e) => Err(self.fail(
                &audit_id,
                PipelineError::MalformedInput(format!("body is not valid UTF-8: {e}")),
                AuditCounts::default(),
                PhaseTimings::default(),
            )),
        };
        let elapsed = started.elapsed().as_millis() as u64;
        latency::record_latency(Phase::Webhook, elapsed);
        if result.is_err() {
            latency::record_failure(Phase::Webhook);
        }
        result
    }

    fn fail(
        &self,
        audit_id: &str,
        err: PipelineError,
        counts: AuditCounts,
        timings: PhaseTimings,
    ) -> PipelineError {
        log::warn!("webhook: audit {} failed: {}", audit_id, err);
        self.audit.complete_logged(
            audit_id,
            AuditOutcome::Failed(AuditErrorDetail::from_pipeline_error(&err)),
            counts,
            timings,
        );
        err
    }

    fn skip(&self, audit_id: &str, status: WebhookStatus, reason: &str) -> WebhookReply {
        log::info!("webhook: audit {} skipped ({})", audit_id, reason);
        self.audit.complete_logged(
            audit_id,
            AuditOutcome::Skipped(reason.to_string()),
            AuditCounts::default(),
            PhaseTimings::default(),
        );
        let mut reply = WebhookReply::new(status, audit_id);
        reply.reason = Some(reason.to_string());
        reply
    }

    async fn handle(&self, audit_id: &str, raw_body: &str) -> Result<WebhookReply, PipelineError> {
        let mut counts = AuditCounts::default();
        let mut timings = PhaseTimings::default();

        let envelope = validate_envelope(raw_body)
            .map_err(|e| self.fail(audit_id, e, counts, timings))?;
        let message = envelope.message.unwrap_or_default();
        let notification = match parse_notification(&message) {
            Ok(ParsedPayload::Notification(n)) => n,
            Ok(ParsedPayload::TestMessage) => {
                return Ok(self.skip(audit_id, WebhookStatus::TestDetected, "test_message"))
            }
            Err(e) => return Err(self.fail(audit_id, e, counts, timings)),
        };

        let db_start = Instant::now();
        let connection = self
            .db
            .lock()
            .get_connection_by_email(&notification.email_address)
            .map_err(PipelineError::Datastore);
        timings.db_ms += db_start.elapsed().as_millis() as u64;
        let connection = connection.map_err(|e| self.fail(audit_id, e, counts, timings))?;

        if let Err(e) = self.audit.record_notification(
            audit_id,
            &AuditNotification {
                email_address: Some(notification.email_address.clone()),
                history_id: notification.history_id.clone(),
                mailbox_message_id: notification.message_id.clone(),
                connection_id: connection.as_ref().map(|c| c.id.clone()),
            },
        ) {
            log::warn!("webhook: could not annotate audit {}: {}", audit_id, e);
        }

        let Some(connection) = connection else {
            return Ok(self.skip(audit_id, WebhookStatus::Skipped, "unknown_connection"));
        };
        if !connection.watch_enabled {
            return Ok(self.skip(audit_id, WebhookStatus::Skipped, "watch_disabled"));
        }
        if notification.message_id.is_none() && notification.history_id.is_none() {
            return Ok(self.skip(audit_id, WebhookStatus::Skipped, "nothing_to_fetch"));
        }

        if let Err(e) = self.audit.mark_processing(audit_id) {
            log::warn!("webhook: could not mark audit {} processing: {}", audit_id, e);
        }

        let fetched = match (&notification.message_id, &notification.history_id) {
            (Some(message_id), _) => self
                .fetcher
                .fetch(&connection.id, message_id)
                .await
                .map(|outcome| vec![outcome]),
            (None, Some(history_id)) => self
                .fetcher
                .sync_history(&connection.id, history_id)
                .await
                .map(|sync| {
                    timings.add(sync.timings);
                    counts.messages_missing = sync.missing.len() as u32;
                    sync.fetched
                }),
            (None, None) => Ok(Vec::new()),
        };
        let fetched = fetched.map_err(|e| self.fail(audit_id, e, counts, timings))?;

        let mut reply = WebhookReply::new(WebhookStatus::Success, audit_id);
        for outcome in &fetched {
            if notification.message_id.is_some() {
                timings.add(outcome.timings);
            }
            if outcome.created {
                reply.emails_created += 1;
            }
            reply.email_ids.push(outcome.email_id.clone());
        }
        counts.emails_fetched = reply.emails_created;

        if connection.auto_sync_enabled {
            let summary = self
                .orchestrator
                .drain(Some(&connection.id))
                .await
                .map_err(|e| self.fail(audit_id, e, counts, timings))?;
            counts.emails_processed = summary.processed;
            counts.emails_failed = summary.rejected;
            counts.transactions_extracted = summary.processed;
            timings.inference_ms += summary.inference_ms;
            timings.db_ms += summary.db_ms;
            reply.processing = Some(summary);
        }

        self.audit
            .complete_logged(audit_id, AuditOutcome::Success, counts, timings);
        log::info!(
            "webhook: audit {} done ({} new of {} fetched for {})",
            audit_id,
            reply.emails_created,
            reply.email_ids.len(),
            connection.id
        );
        Ok(reply)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    pub fn legacy_body(decoded: &str) -> String {
        serde_json::json!({
            "message": {
                "data": STANDARD.encode(decoded),
                "messageId": "pubsub-1",
                "publishTime": "2026-03-12T09:30:00Z"
            },
            "subscription": "projects/demo/subscriptions/gmail-push"
        })
        .to_string()
    }

    pub fn attribute_body(email: &str, message_id: &str) -> String {
        serde_json::json!({
            "message": {
                "data": "",
                "messageId": "pubsub-2",
                "publishTime": "2026-03-12T09:30:00Z",
                "attributes": {"emailAddress": email, "messageId": message_id}
            },
            "subscription": "projects/demo/subscriptions/gmail-push"
        })
        .to_string()
    }
}
