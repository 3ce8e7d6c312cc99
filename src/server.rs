//! HTTP surface: the push webhook plus a small control plane.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::{DbAuditEntry, DbRejection, DbStoredEmail, DbTransaction, EmailStatus};
use crate::error::PipelineError;
use crate::intelligence::{ExtractionMode, ProviderStatus};
use crate::latency::{self, LatencyRollups};
use crate::processor::ProcessSummary;
use crate::state::AppState;
use crate::webhook::{WebhookReply, WEBHOOK_TOKEN_HEADER};

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 500;

/// Headers never copied into the audit log.
const REDACTED_HEADERS: &[&str] = &[WEBHOOK_TOKEN_HEADER, "authorization", "cookie"];

type ApiResult<T> = Result<Json<T>, PipelineError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gmail", post(gmail_webhook))
        .route("/process", post(process))
        .route("/extraction-mode", get(extraction_mode).post(set_extraction_mode))
        .route("/providers", get(providers))
        .route("/emails/:id", get(get_email))
        .route("/emails/:id/exclude", post(exclude_email))
        .route("/audit", get(list_audit))
        .route("/diagnostics/latency", get(latency_rollups))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .filter(|(name, _)| !REDACTED_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

async fn gmail_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookReply> {
    let token = headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    state
        .gateway
        .ingest(token, headers_to_json(&headers), &body)
        .await
        .map(Json)
}

/// Optional JSON body; an empty body means "no fields".
fn parse_optional_body<T: serde::de::DeserializeOwned + Default>(
    body: &[u8],
) -> Result<T, PipelineError> {
    let body = std::str::from_utf8(body)
        .map_err(|e| PipelineError::MalformedInput(format!("body is not valid UTF-8: {e}")))?;
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(body)
        .map_err(|e| PipelineError::MalformedInput(format!("invalid JSON body: {e}")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    #[serde(default)]
    connection_id: Option<String>,
}

async fn process(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<ProcessSummary> {
    let request: ProcessRequest = parse_optional_body(&body)?;
    let connection_id = request.connection_id.filter(|c| !c.trim().is_empty());
    if let Some(id) = connection_id.as_deref() {
        let known = state
            .db
            .lock()
            .get_connection(id)
            .map_err(PipelineError::Datastore)?
            .is_some();
        if !known {
            return Err(PipelineError::ConnectionNotFound(id.to_string()));
        }
    }
    state
        .orchestrator
        .drain(connection_id.as_deref())
        .await
        .map(Json)
}

#[derive(Debug, Default, Deserialize)]
struct ModeRequest {
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModeResponse {
    mode: ExtractionMode,
    mock_enabled: bool,
}

impl From<ExtractionMode> for ModeResponse {
    fn from(mode: ExtractionMode) -> Self {
        Self {
            mode,
            mock_enabled: mode == ExtractionMode::Mock,
        }
    }
}

/// `enable` turns mock mode on, `disable` turns it off.
fn apply_mode_action(state: &AppState, action: Option<&str>) -> Result<ModeResponse, PipelineError> {
    let default = state.orchestrator.default_mode();
    let db = state.db.lock();
    let mode = match action.map(|a| a.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("status") => db.get_extraction_mode(default),
        Some("enable") => db
            .set_extraction_mode(ExtractionMode::Mock)
            .map(|_| ExtractionMode::Mock),
        Some("disable") => db
            .set_extraction_mode(ExtractionMode::Real)
            .map(|_| ExtractionMode::Real),
        Some("toggle") => db.toggle_extraction_mode(default),
        Some(other) => {
            return Err(PipelineError::MalformedInput(format!(
                "unknown action '{other}' (expected enable, disable, toggle or status)"
            )))
        }
    }
    .map_err(PipelineError::Datastore)?;
    if action.is_some_and(|a| !a.eq_ignore_ascii_case("status")) {
        log::info!("Extraction mode is now {}", mode.as_str());
    }
    Ok(mode.into())
}

async fn extraction_mode(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeRequest>,
) -> ApiResult<ModeResponse> {
    apply_mode_action(&state, query.action.as_deref()).map(Json)
}

async fn set_extraction_mode(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeRequest>,
    body: Bytes,
) -> ApiResult<ModeResponse> {
    let from_body: ModeRequest = parse_optional_body(&body)?;
    let action = query.action.or(from_body.action);
    apply_mode_action(&state, action.as_deref()).map(Json)
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvidersResponse {
    default_provider: Option<String>,
    providers: Vec<ProviderStatus>,
}

async fn providers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProvidersQuery>,
) -> Json<ProvidersResponse> {
    let manager = state.engine.manager();
    if query.refresh {
        manager.refresh_health().await;
    }
    Json(ProvidersResponse {
        default_provider: manager.default_provider_name(),
        providers: manager.status(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailView {
    email: DbStoredEmail,
    transaction: Option<DbTransaction>,
    rejection: Option<DbRejection>,
}

async fn get_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<EmailView> {
    let db = state.db.lock();
    let email = db
        .get_email(&id)
        .map_err(PipelineError::Datastore)?
        .ok_or_else(|| PipelineError::EmailNotFound(id.clone()))?;
    let (transaction, rejection) = match &email.status {
        EmailStatus::Fetched => (None, None),
        EmailStatus::Processed(txn_id) => (
            db.get_transaction(txn_id).map_err(PipelineError::Datastore)?,
            None,
        ),
        EmailStatus::Rejected(rejection_id) => (
            None,
            db.get_rejection(rejection_id)
                .map_err(PipelineError::Datastore)?,
        ),
    };
    Ok(Json(EmailView {
        email,
        transaction,
        rejection,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ExcludeRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExcludeResponse {
    email_id: String,
    rejection_id: String,
}

async fn exclude_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<ExcludeResponse> {
    let request: ExcludeRequest = parse_optional_body(&body)?;
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| PipelineError::MalformedInput("reason is required".to_string()))?;
    let rejection_id = state.orchestrator.reject_manually(&id, &reason)?;
    Ok(Json(ExcludeResponse {
        email_id: id,
        rejection_id,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Vec<DbAuditEntry>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    state
        .db
        .lock()
        .list_recent_audit(limit)
        .map(Json)
        .map_err(PipelineError::Datastore)
}

async fn latency_rollups() -> Json<LatencyRollups> {
    Json(latency::get_rollups())
}
