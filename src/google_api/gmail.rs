//! Gmail API v1: full-message fetch and history listing.
//!
//! Bodies are pulled with `format=full` and flattened to plain text by
//! walking the MIME tree: top-level body, first `text/plain` part, first
//! `text/html` part (converted with html2text), else empty.

use async_trait::async_trait;
use serde::Deserialize;

use super::{send_with_retry, GoogleApiError, RetryPolicy};
use crate::db::NewStoredEmail;
use crate::util::decode_base64_text;

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Column width for html2text rendering.
const HTML_RENDER_WIDTH: usize = 100;

/// Upper bound on history pages walked for a single notification.
const MAX_HISTORY_PAGES: usize = 20;

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub size: u64,
}

/// One node of a message's MIME tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    /// Epoch milliseconds, sent as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    history_id: Option<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageStub,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

/// Messages added since a history id, plus the mailbox's latest history id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryDelta {
    pub message_ids: Vec<String>,
    pub history_id: Option<String>,
}

// ============================================================================
// Message helpers
// ============================================================================

impl GmailMessage {
    /// First header with `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn internal_date_ms(&self) -> i64 {
        self.internal_date
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Flatten the MIME tree to plain text.
    pub fn body_text(&self) -> String {
        self.payload
            .as_ref()
            .map(extract_body_text)
            .unwrap_or_default()
    }

    /// Normalize into a row for `stored_emails`.
    pub fn to_new_email(&self, connection_id: &str) -> NewStoredEmail {
        let recipients = ["To", "Cc"]
            .iter()
            .filter_map(|h| self.header(h))
            .filter(|v| !v.trim().is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        NewStoredEmail {
            connection_id: connection_id.to_string(),
            provider_message_id: self.id.clone(),
            thread_id: self.thread_id.clone(),
            subject: self.header("Subject").unwrap_or_default().to_string(),
            sender: self.header("From").unwrap_or_default().to_string(),
            recipients,
            snippet: self.snippet.clone(),
            body_text: self.body_text(),
            label_ids: self.label_ids.clone(),
            internal_date: self.internal_date_ms(),
        }
    }
}

/// Body fallback chain: direct body, first text/plain, first text/html.
pub fn extract_body_text(payload: &MessagePart) -> String {
    if let Some(text) = part_data(payload) {
        if payload.mime_type.eq_ignore_ascii_case("text/html") {
            return html_to_text(&text);
        }
        return text;
    }
    if let Some(text) = find_part_text(payload, "text/plain") {
        return text;
    }
    if let Some(html) = find_part_text(payload, "text/html") {
        return html_to_text(&html);
    }
    String::new()
}

fn part_data(part: &MessagePart) -> Option<String> {
    part.body
        .as_ref()?
        .data
        .as_deref()
        .filter(|d| !d.is_empty())
        .and_then(decode_base64_text)
}

/// Depth-first search of child parts for the first `target_mime` body.
fn find_part_text(payload: &MessagePart, target_mime: &str) -> Option<String> {
    for part in &payload.parts {
        if part.mime_type.eq_ignore_ascii_case(target_mime) {
            if let Some(text) = part_data(part) {
                return Some(text);
            }
        }
        if let Some(text) = find_part_text(part, target_mime) {
            return Some(text);
        }
    }
    None
}

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH) {
        Ok(text) => text,
        Err(e) => {
            log::debug!("gmail: html2text failed, keeping raw html: {}", e);
            html.to_string()
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Mailbox seam used by the fetcher.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, GoogleApiError>;

    async fn list_added_messages(
        &self,
        access_token: &str,
        start_history_id: &str,
    ) -> Result<HistoryDelta, GoogleApiError>;
}

pub struct GmailClient {
    client: reqwest::Client,
    api_base: String,
    retry: RetryPolicy,
}

impl GmailClient {
    pub fn new(client: reqwest::Client, api_base: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GoogleApiError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(GoogleApiError::AuthExpired);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GoogleApiError::ApiError {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(resp)
}

#[async_trait]
impl MailboxApi for GmailClient {
    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, GoogleApiError> {
        let url = format!("{}/users/me/messages/{}", self.api_base, message_id);
        let resp = send_with_retry(
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("format", "full")]),
            &self.retry,
        )
        .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn list_added_messages(
        &self,
        access_token: &str,
        start_history_id: &str,
    ) -> Result<HistoryDelta, GoogleApiError> {
        let url = format!("{}/users/me/history", self.api_base);
        let mut delta = HistoryDelta::default();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let mut query: Vec<(&str, String)> = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
            ];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let resp = send_with_retry(
                self.client.get(&url).bearer_auth(access_token).query(&query),
                &self.retry,
            )
            .await?;
            let page: HistoryListResponse = check_status(resp).await?.json().await?;

            for record in page.history {
                for added in record.messages_added {
                    if !delta.message_ids.contains(&added.message.id) {
                        delta.message_ids.push(added.message.id);
                    }
                }
            }
            if page.history_id.is_some() {
                delta.history_id = page.history_id;
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(delta)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(text: &str) -> String {
        use base64::Engine;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)
    }

    #[test]
    fn test_full_message_deserialization() {
        let json = format!(
            r#"{{
                "id": "18c1",
                "threadId": "t1",
                "labelIds": ["INBOX", "CATEGORY_UPDATES"],
                "snippet": "INR 450.00 debited",
                "internalDate": "1767225600000",
                "payload": {{
                    "mimeType": "multipart/alternative",
                    "headers": [
                        {{"name": "From", "value": "HDFC Bank <alerts@hdfc.example>"}},
                        {{"name": "To", "value": "me@example.com"}},
                        {{"name": "Cc", "value": "audit@example.com"}},
                        {{"name": "subject", "value": "Debit alert"}}
                    ],
                    "body": {{"size": 0}},
                    "parts": [
                        {{"mimeType": "text/plain", "body": {{"data": "{}"}}}},
                        {{"mimeType": "text/html", "body": {{"data": "{}"}}}}
                    ]
                }}
            }}"#,
            b64("Rs. 450.00 debited at Cafe Mocha"),
            b64("<p>ignored</p>")
        );

        let msg: GmailMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg.header("Subject"), Some("Debit alert"));
        assert_eq!(msg.internal_date_ms(), 1_767_225_600_000);

        let row = msg.to_new_email("c1");
        assert_eq!(row.provider_message_id, "18c1");
        assert_eq!(row.sender, "HDFC Bank <alerts@hdfc.example>");
        assert_eq!(row.recipients, "me@example.com, audit@example.com");
        assert_eq!(row.body_text, "Rs. 450.00 debited at Cafe Mocha");
        assert_eq!(row.label_ids.len(), 2);
    }

    #[test]
    fn test_direct_body_wins() {
        let payload = MessagePart {
            mime_type: "text/plain".to_string(),
            body: Some(PartBody {
                data: Some(b64("top level")),
                size: 9,
            }),
            parts: vec![MessagePart {
                mime_type: "text/plain".to_string(),
                body: Some(PartBody {
                    data: Some(b64("nested")),
                    size: 6,
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(extract_body_text(&payload), "top level");
    }

    #[test]
    fn test_nested_plain_found_depth_first() {
        let payload = MessagePart {
            mime_type: "multipart/mixed".to_string(),
            parts: vec![MessagePart {
                mime_type: "multipart/alternative".to_string(),
                parts: vec![MessagePart {
                    mime_type: "text/plain".to_string(),
                    body: Some(PartBody {
                        data: Some(b64("deep plain")),
                        size: 10,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(extract_body_text(&payload), "deep plain");
    }

    #[test]
    fn test_html_only_is_converted() {
        let payload = MessagePart {
            mime_type: "multipart/alternative".to_string(),
            parts: vec![MessagePart {
                mime_type: "text/html".to_string(),
                body: Some(PartBody {
                    data: Some(b64("<html><body><p>Amount: INR 99</p></body></html>")),
                    size: 40,
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let text = extract_body_text(&payload);
        assert!(text.contains("Amount: INR 99"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_no_body_is_empty() {
        let payload = MessagePart {
            mime_type: "multipart/mixed".to_string(),
            parts: vec![MessagePart {
                mime_type: "application/pdf".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(extract_body_text(&payload), "");
    }

    #[test]
    fn test_history_response_deserialization() {
        let json = r#"{
            "history": [
                {"id": "1", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                {"id": "2"},
                {"id": "3", "messagesAdded": [{"message": {"id": "m2"}}]}
            ],
            "historyId": "9001"
        }"#;
        let resp: HistoryListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.history.len(), 3);
        assert_eq!(resp.history_id.as_deref(), Some("9001"));
        assert!(resp.next_page_token.is_none());
        assert_eq!(resp.history[2].messages_added[0].message.id, "m2");
    }

    #[test]
    fn test_client_trims_api_base() {
        let client = GmailClient::new(
            reqwest::Client::new(),
            Some("http://localhost:9999/gmail/v1/".to_string()),
        );
        assert_eq!(client.api_base, "http://localhost:9999/gmail/v1");
    }
}
