//! Ranked provider list with health tracking and fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use super::providers::{AnthropicAdapter, MockAdapter, OpenAiAdapter};
use super::{InferenceError, InferenceRequest, InferenceResponse, ModelAdapter, ProviderAttempt};
use crate::types::{InferenceConfig, ProviderKind};

/// How long a failed fallback provider is skipped before it is tried again.
pub const UNREACHABLE_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
struct ProviderHealth {
    /// `None` until the first health check or call.
    reachable: Option<bool>,
    last_error: Option<String>,
    last_checked: Option<String>,
    failed_at: Option<Instant>,
}

/// Snapshot of one configured provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub name: String,
    pub model: String,
    pub rank: usize,
    pub is_default: bool,
    pub has_credentials: bool,
    pub reachable: Option<bool>,
    pub last_error: Option<String>,
    pub last_checked: Option<String>,
}

pub struct InferenceManager {
    providers: Vec<Arc<dyn ModelAdapter>>,
    default_provider: Option<String>,
    health: RwLock<HashMap<String, ProviderHealth>>,
    cooldown: Duration,
}

impl InferenceManager {
    /// `providers` are in rank order.
    pub fn new(providers: Vec<Arc<dyn ModelAdapter>>, default_provider: Option<String>) -> Self {
        Self {
            providers,
            default_provider,
            health: RwLock::new(HashMap::new()),
            cooldown: UNREACHABLE_COOLDOWN,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Build adapters from config. Keys come from `apiKeyEnv` first, then
    /// the inline `apiKey`.
    pub fn from_config(config: &InferenceConfig, client: reqwest::Client) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|p| {
                let api_key = p
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .or_else(|| p.api_key.clone());
                let adapter: Arc<dyn ModelAdapter> = match p.kind {
                    ProviderKind::Openai => Arc::new(OpenAiAdapter::new(
                        client.clone(),
                        p.name.clone(),
                        p.model.clone(),
                        api_key,
                        p.base_url.clone(),
                    )),
                    ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(
                        client.clone(),
                        p.name.clone(),
                        p.model.clone(),
                        api_key,
                        p.base_url.clone(),
                    )),
                    ProviderKind::Mock => Arc::new(MockAdapter::new()),
                };
                adapter
            })
            .collect();
        Self::new(providers, config.default_provider.clone())
    }

    /// Configured default if it exists, otherwise the first ranked provider
    /// with credentials.
    pub fn default_provider_name(&self) -> Option<String> {
        if let Some(name) = self.default_provider.as_deref() {
            if self.providers.iter().any(|p| p.name() == name) {
                return Some(name.to_string());
            }
        }
        self.providers
            .iter()
            .find(|p| p.has_credentials())
            .map(|p| p.name().to_string())
    }

    /// `(name, model)` of the provider tried first.
    pub fn default_provider(&self) -> Option<(String, String)> {
        let name = self.default_provider_name()?;
        let model = self
            .providers
            .iter()
            .find(|p| p.name() == name)?
            .model()
            .to_string();
        Some((name, model))
    }

    /// Credentials present, and not marked unreachable within the cooldown.
    fn is_healthy(&self, provider: &dyn ModelAdapter) -> bool {
        if !provider.has_credentials() {
            return false;
        }
        match self.health.read().get(provider.name()) {
            Some(h) if h.reachable == Some(false) => h
                .failed_at
                .map_or(true, |at| at.elapsed() >= self.cooldown),
            _ => true,
        }
    }

    /// Default first, then the remaining healthy providers in rank order.
    fn candidates(&self) -> Vec<Arc<dyn ModelAdapter>> {
        let default = self.default_provider_name();
        let mut ordered: Vec<Arc<dyn ModelAdapter>> = Vec::new();
        if let Some(name) = default.as_deref() {
            if let Some(p) = self.providers.iter().find(|p| p.name() == name) {
                if p.has_credentials() {
                    ordered.push(p.clone());
                }
            }
        }
        for p in &self.providers {
            if Some(p.name()) == default.as_deref() {
                continue;
            }
            if self.is_healthy(p.as_ref()) {
                ordered.push(p.clone());
            }
        }
        ordered
    }

    fn record(&self, name: &str, result: Result<(), String>) {
        let mut health = self.health.write();
        let entry = health.entry(name.to_string()).or_default();
        entry.last_checked = Some(chrono::Utc::now().to_rfc3339());
        match result {
            Ok(()) => {
                entry.reachable = Some(true);
                entry.last_error = None;
                entry.failed_at = None;
            }
            Err(e) => {
                entry.reachable = Some(false);
                entry.last_error = Some(e);
                entry.failed_at = Some(Instant::now());
            }
        }
    }

    /// Try the default provider, then fall back through healthy ones.
    /// The response names the provider that served it.
    pub async fn generate(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, InferenceError> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(InferenceError::NoProvider);
        }

        let mut attempts = Vec::new();
        for provider in candidates {
            match provider.generate(request).await {
                Ok(response) => {
                    self.record(provider.name(), Ok(()));
                    if !attempts.is_empty() {
                        log::info!(
                            "inference: served by fallback {} after {} failure(s)",
                            provider.name(),
                            attempts.len()
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    log::warn!("inference: provider {} failed: {}", provider.name(), e);
                    self.record(provider.name(), Err(e.to_string()));
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        model: provider.model().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Err(InferenceError::AllProvidersFailed { attempts })
    }

    /// Re-run every provider's health check.
    pub async fn refresh_health(&self) {
        for provider in &self.providers {
            if !provider.has_credentials() {
                continue;
            }
            let result = provider.health_check().await.map_err(|e| e.to_string());
            self.record(provider.name(), result);
        }
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        let default = self.default_provider_name();
        let health = self.health.read();
        self.providers
            .iter()
            .enumerate()
            .map(|(rank, p)| {
                let h = health.get(p.name()).cloned().unwrap_or_default();
                ProviderStatus {
                    name: p.name().to_string(),
                    model: p.model().to_string(),
                    rank,
                    is_default: default.as_deref() == Some(p.name()),
                    has_credentials: p.has_credentials(),
                    reachable: h.reachable,
                    last_error: h.last_error,
                    last_checked: h.last_checked,
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::intelligence::TokenUsage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted adapter: replies with `reply`, or fails when `reply` is None.
    /// The first `failures` calls fail regardless.
    pub struct ScriptedAdapter {
        pub name: String,
        pub reply: Option<String>,
        pub credentials: bool,
        pub calls: AtomicUsize,
        pub failures: usize,
        pub delay: Option<Duration>,
    }

    impl ScriptedAdapter {
        pub fn ok(name: &str, reply: &str) -> Self {
            Self {
                name: name.to_string(),
                reply: Some(reply.to_string()),
                credentials: true,
                calls: AtomicUsize::new(0),
                failures: 0,
                delay: None,
            }
        }

        pub fn failing(name: &str) -> Self {
            Self {
                reply: None,
                ..Self::ok(name, "")
            }
        }

        /// Fails `failures` times, then replies.
        pub fn flaky(name: &str, reply: &str, failures: usize) -> Self {
            Self {
                failures,
                ..Self::ok(name, reply)
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn without_key(name: &str) -> Self {
            Self {
                credentials: false,
                ..Self::ok(name, "{}")
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "scripted"
        }

        fn has_credentials(&self) -> bool {
            self.credentials
        }

        async fn health_check(&self) -> Result<(), InferenceError> {
            match self.reply {
                Some(_) => Ok(()),
                None => Err(InferenceError::InvalidResponse("down".into())),
            }
        }

        async fn generate(
            &self,
            _request: &InferenceRequest,
        ) -> Result<InferenceResponse, InferenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = if call < self.failures {
                None
            } else {
                self.reply.as_ref()
            };
            match reply {
                Some(content) => Ok(InferenceResponse {
                    content: content.clone(),
                    provider: self.name.clone(),
                    model: "scripted".to_string(),
                    usage: TokenUsage::default(),
                }),
                None => Err(InferenceError::ProviderStatus {
                    provider: self.name.clone(),
                    status: 503,
                    message: "overloaded".to_string(),
                }),
            }
        }
    }
}
