use serde::{Deserialize, Serialize};

/// Errors specific to database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// Token health of a linked mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    Healthy,
    AuthExpired,
}

impl ConnectionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionHealth::Healthy => "healthy",
            ConnectionHealth::AuthExpired => "auth_expired",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "auth_expired" => ConnectionHealth::AuthExpired,
            _ => ConnectionHealth::Healthy,
        }
    }
}

/// A row from the `connections` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConnection {
    pub id: String,
    pub user_id: String,
    pub provider_account_id: String,
    pub email_address: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expiry: Option<String>,
    pub watch_enabled: bool,
    pub auto_sync_enabled: bool,
    pub last_history_id: Option<String>,
    pub health: ConnectionHealth,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Email content normalized by the fetcher, ready for insertion.
#[derive(Debug, Clone)]
pub struct NewStoredEmail {
    pub connection_id: String,
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    pub snippet: String,
    pub body_text: String,
    pub label_ids: Vec<String>,
    /// Provider internal timestamp, epoch milliseconds.
    pub internal_date: i64,
}

/// Derived processing state of a stored email.
///
/// Rebuilt from the two nullable references; never stored as a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "ref", rename_all = "snake_case")]
pub enum EmailStatus {
    Fetched,
    Processed(String),
    Rejected(String),
}

impl EmailStatus {
    /// Reconstruct from `(processed_ref, rejected_ref)`.
    ///
    /// Returns `None` if both are set, which the schema forbids.
    pub fn from_refs(processed_ref: Option<String>, rejected_ref: Option<String>) -> Option<Self> {
        match (processed_ref, rejected_ref) {
            (None, None) => Some(EmailStatus::Fetched),
            (Some(p), None) => Some(EmailStatus::Processed(p)),
            (None, Some(r)) => Some(EmailStatus::Rejected(r)),
            (Some(_), Some(_)) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EmailStatus::Fetched => "fetched",
            EmailStatus::Processed(_) => "processed",
            EmailStatus::Rejected(_) => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EmailStatus::Fetched)
    }
}

/// A row from the `stored_emails` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStoredEmail {
    pub id: String,
    pub connection_id: String,
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    pub snippet: String,
    pub body_text: String,
    pub label_ids: Vec<String>,
    pub internal_date: i64,
    pub status: EmailStatus,
    pub created_at: String,
}

/// A row from the `transactions` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTransaction {
    pub id: String,
    pub email_id: String,
    pub occurred_at: String,
    pub amount: f64,
    pub currency: String,
    pub direction: String,
    pub merchant_raw: String,
    pub merchant_normalized: String,
    pub category: String,
    pub reference_id: Option<String>,
    pub location: Option<String>,
    pub confidence: f64,
    pub extraction_version: String,
    pub provider: String,
    pub model: String,
    pub notes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionType {
    Manual,
    Automatic,
}

impl RejectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionType::Manual => "manual",
            RejectionType::Automatic => "automatic",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "manual" => RejectionType::Manual,
            _ => RejectionType::Automatic,
        }
    }
}

/// Result of moving an email out of the `Fetched` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Id of the new transaction or rejection row.
    Resolved(String),
    /// Another writer resolved the email first. Nothing was written.
    AlreadyResolved,
}

/// Rejection to attach to a stored email.
#[derive(Debug, Clone)]
pub struct NewRejection {
    pub reason: String,
    pub rejection_type: RejectionType,
    pub error_detail: Option<serde_json::Value>,
}

/// A row from the `rejections` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRejection {
    pub id: String,
    pub email_id: String,
    pub reason: String,
    pub rejection_type: RejectionType,
    pub error_detail: Option<serde_json::Value>,
    pub rejected_at: String,
}
