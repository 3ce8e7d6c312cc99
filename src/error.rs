//! Error types for the ingestion pipeline
//!
//! Errors are classified by recoverability:
//! - Retryable: provider timeouts, rate limits, 5xx responses
//! - NonRetryable: malformed input, missing rows, datastore failures
//! - RequiresUserAction: revoked or expired OAuth grants

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::google_api::GoogleApiError;

/// Error types surfaced by the webhook gateway, fetcher and orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Missing or invalid webhook token")]
    Unauthorized,

    #[error("Connection {connection_id} needs re-authorization")]
    Credential {
        connection_id: String,
        #[source]
        source: GoogleApiError,
    },

    #[error("Mailbox provider error: {0}")]
    External(#[source] GoogleApiError),

    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Email not found: {0}")]
    EmailNotFound(String),

    #[error("Email {0} already has a terminal status")]
    AlreadyResolved(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Wrap a Gmail/OAuth error, splitting credential failures from transient ones.
    pub fn from_google(connection_id: &str, err: GoogleApiError) -> Self {
        if err.is_auth_failure() {
            PipelineError::Credential {
                connection_id: connection_id.to_string(),
                source: err,
            }
        } else {
            PipelineError::External(err)
        }
    }

    /// Returns true if redelivering the same notification may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::External(e) => e.is_transient(),
            PipelineError::Datastore(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            PipelineError::Credential { .. } | PipelineError::Configuration(_)
        )
    }

    /// Stable machine-readable code stored on audit entries.
    pub fn error_code(&self) -> String {
        match self {
            PipelineError::MalformedInput(_) => "parse_error".to_string(),
            PipelineError::Unauthorized => "unauthorized".to_string(),
            PipelineError::Credential { .. } => "auth_expired".to_string(),
            PipelineError::External(e) => e.error_code(),
            PipelineError::Datastore(_) => "datastore".to_string(),
            PipelineError::ConnectionNotFound(_) => "connection_not_found".to_string(),
            PipelineError::EmailNotFound(_) => "email_not_found".to_string(),
            PipelineError::AlreadyResolved(_) => "already_resolved".to_string(),
            PipelineError::Configuration(_) => "configuration".to_string(),
        }
    }

    /// HTTP status returned to callers of the control-plane endpoints.
    ///
    /// Credential failures are acknowledged with 200: a redelivery cannot
    /// succeed until the user re-authorizes the mailbox.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            PipelineError::Credential { .. } => StatusCode::OK,
            PipelineError::External(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Datastore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::ConnectionNotFound(_) | PipelineError::EmailNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::AlreadyResolved(_) => StatusCode::CONFLICT,
            PipelineError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            PipelineError::MalformedInput(_) => "Check the notification payload format.",
            PipelineError::Unauthorized => "Send the configured X-Webhook-Token header.",
            PipelineError::Credential { .. } => {
                "Reconnect the mailbox to grant a fresh OAuth token."
            }
            PipelineError::External(_) => {
                "The mailbox provider failed; the notification will be redelivered."
            }
            PipelineError::Datastore(_) => "Check that the database file is reachable and writable.",
            PipelineError::ConnectionNotFound(_) => "Link the mailbox before enabling push.",
            PipelineError::EmailNotFound(_) => "Verify the email id.",
            PipelineError::AlreadyResolved(_) => {
                "The email was already processed or rejected."
            }
            PipelineError::Configuration(_) => "Check ~/.finmail/config.json.",
        }
    }

    /// Full `source()` chain, one cause per line, for forensic records.
    pub fn trace(&self) -> String {
        error_chain(self)
    }
}

/// Render an error and all of its sources, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![err.to_string()];
    let mut current = err.source();
    while let Some(cause) = current {
        lines.push(format!("caused by: {}", cause));
        current = cause.source();
    }
    lines.join("\n")
}

/// Serializable error representation for HTTP responses
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub status: &'static str,
    pub message: String,
    pub error_code: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&PipelineError> for ApiErrorBody {
    fn from(err: &PipelineError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ApiErrorBody {
            status: "failed",
            message: err.to_string(),
            error_code: err.error_code(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("{}", self.trace());
        }
        (status, Json(ApiErrorBody::from(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_expired_becomes_credential_error() {
        let err = PipelineError::from_google("conn-1", GoogleApiError::AuthExpired);
        assert!(matches!(err, PipelineError::Credential { .. }));
        assert!(err.requires_user_action());
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "auth_expired");
    }

    #[test]
    fn test_server_error_is_retryable() {
        let err = PipelineError::from_google(
            "conn-1",
            GoogleApiError::ApiError {
                status: 503,
                message: "backend unavailable".to_string(),
            },
        );
        assert!(matches!(err, PipelineError::External(_)));
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "gmail_api_503");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = PipelineError::from_google(
            "conn-1",
            GoogleApiError::ApiError {
                status: 404,
                message: "Requested entity was not found.".to_string(),
            },
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_trace_includes_source_chain() {
        let err = PipelineError::Credential {
            connection_id: "conn-1".to_string(),
            source: GoogleApiError::AuthExpired,
        };
        let trace = err.trace();
        assert!(trace.contains("conn-1"));
        assert!(trace.contains("caused by: Token expired or revoked"));
    }

    #[test]
    fn test_api_error_body_classification() {
        let body = ApiErrorBody::from(&PipelineError::MalformedInput("no messageId".into()));
        assert_eq!(body.error_type, ErrorType::NonRetryable);
        assert!(!body.can_retry);
        assert_eq!(body.error_code, "parse_error");
        assert_eq!(body.status, "failed");
    }
}
