use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::google_api::{default_token_uri, OAuthClientConfig};
use crate::intelligence::ExtractionMode;

/// Configuration stored in ~/.finmail/config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Defaults to `~/.finmail/finmail.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Expected `X-Webhook-Token`. Verification is skipped when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// Override for the Gmail REST base (tests, proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            token_uri: default_token_uri(),
            api_base: None,
        }
    }
}

impl GoogleConfig {
    pub fn oauth_client(&self) -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            token_uri: self.token_uri.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,
    /// Five-field cron expression for background drains. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batches: default_max_batches(),
            schedule: None,
            timezone: default_timezone(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_max_batches() -> usize {
    100
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Mock,
}

/// One entry in the ranked provider list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    /// Mode used until `runtime_settings` holds an explicit one.
    #[serde(default)]
    pub default_mode: ExtractionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            default_mode: ExtractionMode::default(),
            default_provider: None,
            timeout_secs: default_timeout_secs(),
            providers: Vec::new(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("FINMAIL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".finmail").join("config.json"))
}

/// Load the config file, falling back to defaults when it does not exist,
/// then apply environment overrides.
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;
    let mut config = if path.exists() {
        let content =
            fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;
        parse_config(&content)?
    } else {
        log::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        Config::default()
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config, String> {
    serde_json::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(secret) = non_empty("FINMAIL_WEBHOOK_SECRET") {
        config.webhook.shared_secret = Some(secret);
    }
    if let Some(path) = non_empty("FINMAIL_DB_PATH") {
        config.database.path = Some(path);
    }
    if let Some(bind) = non_empty("FINMAIL_BIND") {
        config.server.bind = bind;
    }
    if let Some(id) = non_empty("GOOGLE_CLIENT_ID") {
        config.google.client_id = id;
    }
    if let Some(secret) = non_empty("GOOGLE_CLIENT_SECRET") {
        config.google.client_secret = Some(secret);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.processing.batch_size, 10);
        assert_eq!(config.processing.max_batches, 100);
        assert_eq!(config.inference.timeout_secs, 60);
        assert_eq!(config.inference.default_mode, ExtractionMode::Real);
        assert_eq!(config.google.token_uri, "https://oauth2.googleapis.com/token");
        assert!(config.webhook.shared_secret.is_none());
    }

    #[test]
    fn test_parse_providers() {
        let config = parse_config(
            r#"{
                "inference": {
                    "defaultMode": "mock",
                    "defaultProvider": "claude",
                    "providers": [
                        {"name": "gpt", "kind": "openai", "model": "gpt-4o-mini", "apiKeyEnv": "OPENAI_API_KEY"},
                        {"name": "claude", "kind": "anthropic", "model": "claude-3-5-haiku-latest"}
                    ]
                },
                "processing": {"batchSize": 25, "schedule": "*/15 * * * *"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.inference.default_mode, ExtractionMode::Mock);
        assert_eq!(config.inference.providers.len(), 2);
        assert_eq!(config.inference.providers[1].kind, ProviderKind::Anthropic);
        assert_eq!(
            config.inference.providers[0].api_key_env.as_deref(),
            Some("OPENAI_API_KEY")
        );
        assert_eq!(config.processing.batch_size, 25);
        assert_eq!(config.processing.max_batches, 100);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FINMAIL_WEBHOOK_SECRET", "s3cret"),
            ("FINMAIL_BIND", "0.0.0.0:9000"),
            ("GOOGLE_CLIENT_ID", ""),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.google.client_id = "from-file".to_string();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.webhook.shared_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.google.client_id, "from-file");
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(parse_config("{not json").is_err());
    }
}
