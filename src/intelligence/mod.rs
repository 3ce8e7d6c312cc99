//! Inference providers and transaction extraction.
//!
//! Provider selection follows a strategy pattern: each backend implements
//! [`ModelAdapter`], and [`manager::InferenceManager`] holds the ranked list,
//! per-provider health and the fallback loop. [`extract::ExtractionEngine`]
//! turns one email into a transaction or a typed failure.

pub mod extract;
pub mod manager;
pub mod providers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use extract::{ExtractionEngine, ExtractionFailure, ExtractionInput, ExtractedTransaction};
pub use manager::{InferenceManager, ProviderStatus};

/// A single completion request, provider-agnostic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Base64 PNG/JPEG, passed through to vision-capable models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// One failed provider attempt inside a fallback chain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttempt {
    pub provider: String,
    pub model: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0} has no API key configured")]
    MissingCredentials(String),

    #[error("{provider} returned {status}: {message}")]
    ProviderStatus {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("No inference provider is available")]
    NoProvider,

    #[error("All providers failed ({})", .attempts.iter().map(|a| format!("{}: {}", a.provider, a.error)).collect::<Vec<_>>().join("; "))]
    AllProvidersFailed { attempts: Vec<ProviderAttempt> },
}

/// Capability interface for a completion backend.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn has_credentials(&self) -> bool;
    async fn health_check(&self) -> Result<(), InferenceError>;
    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

/// Mock routes extraction to the rule-based adapter; real uses the
/// configured providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    Mock,
    #[default]
    Real,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Mock => "mock",
            ExtractionMode::Real => "real",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(ExtractionMode::Mock),
            "real" => Some(ExtractionMode::Real),
            _ => None,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            ExtractionMode::Mock => ExtractionMode::Real,
            ExtractionMode::Real => ExtractionMode::Mock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_and_toggle() {
        assert_eq!(ExtractionMode::parse(" MOCK "), Some(ExtractionMode::Mock));
        assert_eq!(ExtractionMode::parse("nope"), None);
        assert_eq!(ExtractionMode::Mock.toggled(), ExtractionMode::Real);
    }

    #[test]
    fn test_request_wire_shape() {
        let req: InferenceRequest =
            serde_json::from_str(r#"{"prompt": "hi", "systemPrompt": "be terse", "maxTokens": 64}"#)
                .unwrap();
        assert_eq!(req.system_prompt.as_deref(), Some("be terse"));
        assert_eq!(req.max_tokens, Some(64));
        let out = serde_json::to_value(&req).unwrap();
        assert!(out.get("image").is_none());
    }

    #[test]
    fn test_all_failed_message_lists_attempts() {
        let err = InferenceError::AllProvidersFailed {
            attempts: vec![
                ProviderAttempt {
                    provider: "openai".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    error: "timeout".to_string(),
                },
                ProviderAttempt {
                    provider: "anthropic".to_string(),
                    model: "claude-3-5-haiku-latest".to_string(),
                    error: "529".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "All providers failed (openai: timeout; anthropic: 529)"
        );
    }
}
