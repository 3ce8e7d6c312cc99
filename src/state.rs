use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditRecorder;
use crate::db::{PipelineDb, SharedDb};
use crate::error::PipelineError;
use crate::fetcher::MessageFetcher;
use crate::google_api::gmail::{GmailClient, MailboxApi};
use crate::google_api::token_guard::{GoogleTokenExchange, TokenExchange, TokenGuard};
use crate::intelligence::{ExtractionEngine, InferenceManager};
use crate::processor::Orchestrator;
use crate::types::Config;
use crate::webhook::WebhookGateway;

/// Per-request HTTP timeout for Gmail, OAuth and inference providers.
const HTTP_TIMEOUT_SECS: u64 = 90;

/// Everything a request handler or the scheduler needs. Shared behind an
/// `Arc`; the datastore handle is the only mutable piece.
pub struct AppState {
    pub config: Config,
    pub db: SharedDb,
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<ExtractionEngine>,
    pub gateway: WebhookGateway,
}

impl AppState {
    /// Open the database and build real Gmail, OAuth and provider clients.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let db_path = match config.database.path.as_deref() {
            Some(path) => PathBuf::from(path),
            None => PipelineDb::default_path().map_err(|e| PipelineError::Datastore(e.to_string()))?,
        };
        log::info!("Opening database at {}", db_path.display());
        let db = PipelineDb::open_at(db_path)
            .map_err(|e| PipelineError::Datastore(e.to_string()))?
            .into_shared();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;

        if config.google.client_id.is_empty() {
            log::warn!("google.clientId is not set; token refreshes will fail");
        }
        let mailbox = Arc::new(GmailClient::new(client.clone(), config.google.api_base.clone()));
        let exchange = Arc::new(GoogleTokenExchange::new(
            client.clone(),
            config.google.oauth_client(),
        ));
        let manager = Arc::new(InferenceManager::from_config(&config.inference, client));

        Ok(Self::from_parts(config, db, mailbox, exchange, manager))
    }

    /// Wire the pipeline around already-built collaborators.
    pub fn from_parts(
        config: Config,
        db: SharedDb,
        mailbox: Arc<dyn MailboxApi>,
        exchange: Arc<dyn TokenExchange>,
        manager: Arc<InferenceManager>,
    ) -> Self {
        let audit = AuditRecorder::new(db.clone());
        let tokens = Arc::new(TokenGuard::new(exchange));
        let fetcher = Arc::new(MessageFetcher::new(db.clone(), mailbox, tokens));
        let engine = Arc::new(ExtractionEngine::new(
            manager,
            Duration::from_secs(config.inference.timeout_secs.max(1)),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            engine.clone(),
            config.processing.batch_size,
            config.processing.max_batches,
            config.inference.default_mode,
        ));
        let gateway = WebhookGateway::new(
            db.clone(),
            audit,
            fetcher,
            orchestrator.clone(),
            config.webhook.shared_secret.clone(),
        );

        Self {
            config,
            db,
            orchestrator,
            engine,
            gateway,
        }
    }
}
