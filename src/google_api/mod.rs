//! Native Gmail API client.
//!
//! Direct HTTP via reqwest against the Gmail v1 REST API and Google's OAuth2
//! token endpoint. Credentials live on the connection row in the datastore,
//! never on disk next to the binary.
//!
//! Modules:
//! - gmail: full-message fetch, MIME body walk, history listing
//! - token_guard: expiry check + refresh-and-persist before every call

pub mod gmail;
pub mod token_guard;

use std::time::Duration;

use serde::Deserialize;

/// Consider a token expired this many seconds before its recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// OAuth2 client credentials used for the refresh-token grant.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

pub(crate) fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl GoogleApiError {
    /// Revoked grant, missing refresh token or a 401 from the API.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, GoogleApiError::AuthExpired)
    }

    /// Failures that a later redelivery of the same notification may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            GoogleApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GoogleApiError::ApiError { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            GoogleApiError::RefreshFailed(_) => true,
            GoogleApiError::AuthExpired | GoogleApiError::Json(_) => false,
        }
    }

    /// The message or resource no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GoogleApiError::ApiError { status: 404, .. })
    }

    pub fn error_code(&self) -> String {
        match self {
            GoogleApiError::Http(e) if e.is_timeout() => "gmail_timeout".to_string(),
            GoogleApiError::Http(_) => "gmail_transport".to_string(),
            GoogleApiError::AuthExpired => "auth_expired".to_string(),
            GoogleApiError::RefreshFailed(_) => "token_refresh_failed".to_string(),
            GoogleApiError::ApiError { status, .. } => format!("gmail_api_{}", status),
            GoogleApiError::Json(_) => "gmail_invalid_response".to_string(),
        }
    }
}

// ============================================================================
// Transport retry
// ============================================================================

/// Ceiling on a server-provided `Retry-After`.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Bounded per-call retry for rate limits, 408/5xx and connect or timeout
/// errors. A notification that still fails is left to upstream redelivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn retries_status(status: reqwest::StatusCode) -> bool {
        matches!(
            status,
            reqwest::StatusCode::TOO_MANY_REQUESTS | reqwest::StatusCode::REQUEST_TIMEOUT
        ) || status.is_server_error()
    }

    fn retries_transport(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }

    /// Sleep before attempt `attempt + 1`. `Retry-After` seconds win over
    /// exponential backoff.
    fn delay(&self, attempt: u32, retry_after: Option<&reqwest::header::HeaderValue>) -> Duration {
        let hinted = retry_after
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(secs) = hinted {
            return Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS));
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        backoff + Duration::from_millis(jitter_ms())
    }
}

fn jitter_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_micros()) % 150)
        .unwrap_or(0)
}

/// Send `request`, retrying per `policy`. Requests with streaming bodies
/// cannot be cloned and go out once.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, GoogleApiError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let Some(this_try) = request.try_clone() else {
            return Ok(request.send().await?);
        };
        let last = attempt >= attempts;

        let delay = match this_try.send().await {
            Ok(resp) if !last && RetryPolicy::retries_status(resp.status()) => {
                let delay =
                    policy.delay(attempt, resp.headers().get(reqwest::header::RETRY_AFTER));
                log::warn!(
                    "google_api: {} on attempt {}/{}, retrying in {:?}",
                    resp.status(),
                    attempt,
                    attempts,
                    delay
                );
                delay
            }
            Ok(resp) => return Ok(resp),
            Err(e) if !last && RetryPolicy::retries_transport(&e) => {
                let delay = policy.delay(attempt, None);
                log::warn!(
                    "google_api: transport error on attempt {}/{} ({}), retrying in {:?}",
                    attempt,
                    attempts,
                    e,
                    delay
                );
                delay
            }
            Err(e) => return Err(GoogleApiError::Http(e)),
        };

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

// ============================================================================
// Expiry
// ============================================================================

/// Check if a stored expiry (RFC 3339) is past or within the refresh skew.
///
/// A missing or unparseable expiry counts as expired so the caller refreshes.
pub fn is_token_expired(expiry: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> bool {
    match expiry {
        None => true,
        Some(expiry_str) => match chrono::DateTime::parse_from_rfc3339(expiry_str.trim()) {
            Ok(expiry) => expiry <= now + chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            Err(_) => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_token_expired_no_expiry() {
        assert!(is_token_expired(None, chrono::Utc::now()));
    }

    #[test]
    fn test_is_token_expired_future() {
        let now = chrono::Utc::now();
        let future = (now + chrono::Duration::hours(1)).to_rfc3339();
        assert!(!is_token_expired(Some(&future), now));
    }

    #[test]
    fn test_is_token_expired_past() {
        let now = chrono::Utc::now();
        let past = (now - chrono::Duration::hours(1)).to_rfc3339();
        assert!(is_token_expired(Some(&past), now));
    }

    #[test]
    fn test_is_token_expired_within_skew() {
        let now = chrono::Utc::now();
        let soon = (now + chrono::Duration::seconds(30)).to_rfc3339();
        assert!(is_token_expired(Some(&soon), now));
    }

    #[test]
    fn test_is_token_expired_garbage() {
        assert!(is_token_expired(Some("next tuesday"), chrono::Utc::now()));
    }

    #[test]
    fn test_oauth_config_defaults_token_uri() {
        let json = r#"{"clientId": "12345.apps.googleusercontent.com"}"#;
        let cfg: OAuthClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.token_uri, "https://oauth2.googleapis.com/token");
        assert!(cfg.client_secret.is_none());
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(RetryPolicy::retries_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::retries_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!RetryPolicy::retries_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::retries_status(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_retry_after_header_wins() {
        let header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(
            RetryPolicy::default().delay(1, Some(&header)),
            Duration::from_secs(7)
        );
        let huge = reqwest::header::HeaderValue::from_static("3600");
        assert_eq!(
            RetryPolicy::default().delay(1, Some(&huge)),
            Duration::from_secs(MAX_RETRY_AFTER_SECS)
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        let delay = policy.delay(12, None);
        assert!(delay >= policy.max_delay);
        assert!(delay < policy.max_delay + Duration::from_millis(150));
    }

    #[test]
    fn test_transient_classification() {
        let rate_limited = GoogleApiError::ApiError {
            status: 429,
            message: String::new(),
        };
        assert!(rate_limited.is_transient());
        assert!(!GoogleApiError::AuthExpired.is_transient());
        assert!(GoogleApiError::AuthExpired.is_auth_failure());
    }
}
