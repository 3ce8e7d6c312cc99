//! Access-token guard.
//!
//! Every Gmail call goes through [`TokenGuard::access_token`]. Expired tokens
//! are refreshed with the refresh-token grant and persisted to the connection
//! row before the new token is handed out. Refreshes are serialized per
//! connection; different connections refresh concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{is_token_expired, send_with_retry, GoogleApiError, OAuthClientConfig, RetryPolicy};
use crate::db::SharedDb;
use crate::error::PipelineError;

/// Result of one refresh-token grant.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// OAuth token endpoint seam.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, GoogleApiError>;
}

/// Google's OAuth2 token endpoint.
pub struct GoogleTokenExchange {
    client: reqwest::Client,
    config: OAuthClientConfig,
    retry: RetryPolicy,
}

impl GoogleTokenExchange {
    pub fn new(client: reqwest::Client, config: OAuthClientConfig) -> Self {
        Self {
            client,
            config,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl TokenExchange for GoogleTokenExchange {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, GoogleApiError> {
        let mut form = vec![
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let request = self.client.post(&self.config.token_uri).form(&form);
        let resp = send_with_retry(request, &self.retry).await?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(map_refresh_error(status.as_u16(), &body_text));
        }

        let body: serde_json::Value = serde_json::from_str(&body_text)?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| GoogleApiError::RefreshFailed("No access_token in response".into()))?;

        Ok(RefreshedToken {
            access_token: access_token.to_string(),
            refresh_token: body["refresh_token"].as_str().map(|s| s.to_string()),
            expires_in: body["expires_in"].as_i64().unwrap_or(3600),
        })
    }
}

fn map_refresh_error(status: u16, body: &str) -> GoogleApiError {
    let lowered = body.to_lowercase();
    if status == 401
        || (status == 400
            && (lowered.contains("invalid_grant") || lowered.contains("token has been expired")))
    {
        return GoogleApiError::AuthExpired;
    }
    GoogleApiError::RefreshFailed(format!("HTTP {}: {}", status, body))
}

pub struct TokenGuard {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    exchange: Arc<dyn TokenExchange>,
}

impl TokenGuard {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            locks: DashMap::new(),
            exchange,
        }
    }

    fn lock_for(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return a usable access token for `connection_id`, refreshing and
    /// persisting it first when it is expired or about to expire.
    pub async fn access_token(
        &self,
        db: &SharedDb,
        connection_id: &str,
    ) -> Result<String, PipelineError> {
        let connection = load_connection(db, connection_id)?;
        if !is_token_expired(connection.token_expiry.as_deref(), chrono::Utc::now()) {
            return Ok(connection.access_token);
        }

        let lock = self.lock_for(connection_id);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        let connection = load_connection(db, connection_id)?;
        let now = chrono::Utc::now();
        if !is_token_expired(connection.token_expiry.as_deref(), now) {
            return Ok(connection.access_token);
        }

        let Some(refresh_token) = connection.refresh_token.as_deref() else {
            return Err(self.credential_failure(db, connection_id, GoogleApiError::AuthExpired));
        };

        log::info!("token_guard: refreshing access token for {}", connection_id);
        let refreshed = match self.exchange.refresh(refresh_token).await {
            Ok(r) => r,
            Err(e) if e.is_auth_failure() => {
                return Err(self.credential_failure(db, connection_id, e));
            }
            Err(e) => return Err(PipelineError::External(e)),
        };

        let expiry = (chrono::Utc::now() + chrono::Duration::seconds(refreshed.expires_in))
            .to_rfc3339();
        db.lock()
            .update_connection_tokens(
                connection_id,
                &refreshed.access_token,
                refreshed.refresh_token.as_deref(),
                &expiry,
            )
            .map_err(PipelineError::Datastore)?;

        Ok(refreshed.access_token)
    }

    fn credential_failure(
        &self,
        db: &SharedDb,
        connection_id: &str,
        err: GoogleApiError,
    ) -> PipelineError {
        log::warn!(
            "token_guard: connection {} needs re-authorization: {}",
            connection_id,
            err
        );
        if let Err(e) = db
            .lock()
            .mark_connection_auth_expired(connection_id, &err.to_string())
        {
            log::warn!("token_guard: failed to flag {}: {}", connection_id, e);
        }
        PipelineError::from_google(connection_id, err)
    }
}

fn load_connection(
    db: &SharedDb,
    connection_id: &str,
) -> Result<crate::db::DbConnection, PipelineError> {
    db.lock()
        .get_connection(connection_id)
        .map_err(PipelineError::Datastore)?
        .ok_or_else(|| PipelineError::ConnectionNotFound(connection_id.to_string()))
}


#[cfg(test)]
mod tests {
    use super::fakes::CountingExchange;
    use super::*;
    use crate::db::test_support::*;
    use crate::db::ConnectionHealth;

    fn db_with_expired(id: &str) -> SharedDb {
        let db = test_db();
        let mut conn = sample_connection(id, &format!("{id}@example.com"));
        conn.token_expiry = Some((chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339());
        db.upsert_connection(&conn).unwrap();
        db.into_shared()
    }

    #[tokio::test]
    async fn test_fresh_token_skips_refresh() {
        let db = test_db();
        db.upsert_connection(&sample_connection("c1", "a@b.com"))
            .unwrap();
        let db = db.into_shared();
        let exchange = Arc::new(CountingExchange::new());
        let guard = TokenGuard::new(exchange.clone());

        let token = guard.access_token(&db, "c1").await.unwrap();
        assert_eq!(token, "ya29.initial");
        assert_eq!(exchange.count(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_and_persisted() {
        let db = db_with_expired("c1");
        let before = db.lock().get_connection("c1").unwrap().unwrap().token_expiry;
        let exchange = Arc::new(CountingExchange::new());
        let guard = TokenGuard::new(exchange.clone());

        let token = guard.access_token(&db, "c1").await.unwrap();
        assert_eq!(token, "ya29.refreshed-1");
        assert_eq!(exchange.count(), 1);

        let after = db.lock().get_connection("c1").unwrap().unwrap();
        assert_eq!(after.access_token, "ya29.refreshed-1");
        let before = chrono::DateTime::parse_from_rfc3339(&before.unwrap()).unwrap();
        let after_expiry =
            chrono::DateTime::parse_from_rfc3339(after.token_expiry.as_deref().unwrap()).unwrap();
        assert!(after_expiry > before);
    }

    #[tokio::test]
    async fn test_concurrent_callers_refresh_once() {
        let db = db_with_expired("c1");
        let exchange = Arc::new(CountingExchange::new());
        let guard = Arc::new(TokenGuard::new(exchange.clone()));

        let (a, b) = tokio::join!(guard.access_token(&db, "c1"), guard.access_token(&db, "c1"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(exchange.count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_grant_marks_connection() {
        let db = db_with_expired("c1");
        let guard = TokenGuard::new(Arc::new(CountingExchange::revoked()));

        let err = guard.access_token(&db, "c1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Credential { .. }));

        let conn = db.lock().get_connection("c1").unwrap().unwrap();
        assert_eq!(conn.health, ConnectionHealth::AuthExpired);
    }

    #[tokio::test]
    async fn test_missing_connection() {
        let db = test_db().into_shared();
        let guard = TokenGuard::new(Arc::new(CountingExchange::new()));
        let err = guard.access_token(&db, "ghost").await.unwrap_err();
        assert!(matches!(err, PipelineError::ConnectionNotFound(_)));
    }

    #[test]
    fn test_map_refresh_error() {
        assert!(matches!(
            map_refresh_error(400, r#"{"error": "invalid_grant"}"#),
            GoogleApiError::AuthExpired
        ));
        assert!(matches!(
            map_refresh_error(503, "unavailable"),
            GoogleApiError::RefreshFailed(_)
        ));
    }
}
