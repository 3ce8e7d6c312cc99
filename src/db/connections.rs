use super::*;

const CONNECTION_COLUMNS: &str = "id, user_id, provider_account_id, email_address, access_token,
    refresh_token, token_expiry, watch_enabled, auto_sync_enabled, last_history_id,
    health, last_error, created_at, updated_at";

fn map_connection_row(row: &rusqlite::Row) -> rusqlite::Result<DbConnection> {
    let health: String = row.get(10)?;
    Ok(DbConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider_account_id: row.get(2)?,
        email_address: row.get(3)?,
        access_token: row.get(4)?,
        refresh_token: row.get(5)?,
        token_expiry: row.get(6)?,
        watch_enabled: row.get::<_, i32>(7)? != 0,
        auto_sync_enabled: row.get::<_, i32>(8)? != 0,
        last_history_id: row.get(9)?,
        health: ConnectionHealth::parse(&health),
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl PipelineDb {
    // =========================================================================
    // Connections
    // =========================================================================

    /// Insert or replace a mailbox connection. Written by the OAuth callback.
    pub fn upsert_connection(&self, connection: &DbConnection) -> Result<(), String> {
        let now = Self::now();
        self.conn
            .execute(
                "INSERT INTO connections (
                    id, user_id, provider_account_id, email_address, access_token,
                    refresh_token, token_expiry, watch_enabled, auto_sync_enabled,
                    last_history_id, health, last_error, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    provider_account_id = excluded.provider_account_id,
                    email_address = excluded.email_address,
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, connections.refresh_token),
                    token_expiry = excluded.token_expiry,
                    watch_enabled = excluded.watch_enabled,
                    auto_sync_enabled = excluded.auto_sync_enabled,
                    health = excluded.health,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                params![
                    connection.id,
                    connection.user_id,
                    connection.provider_account_id,
                    connection.email_address,
                    connection.access_token,
                    connection.refresh_token,
                    connection.token_expiry,
                    connection.watch_enabled as i32,
                    connection.auto_sync_enabled as i32,
                    connection.last_history_id,
                    connection.health.as_str(),
                    connection.last_error,
                    now,
                ],
            )
            .map_err(|e| format!("Failed to upsert connection {}: {e}", connection.id))?;
        Ok(())
    }

    pub fn get_connection(&self, id: &str) -> Result<Option<DbConnection>, String> {
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], map_connection_row)
            .optional()
            .map_err(|e| format!("Failed to load connection {id}: {e}"))
    }

    /// Look up the connection for a push notification's mailbox address.
    pub fn get_connection_by_email(&self, email: &str) -> Result<Option<DbConnection>, String> {
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE email_address = ?1 COLLATE NOCASE"
        );
        self.conn
            .query_row(&sql, params![email.trim()], map_connection_row)
            .optional()
            .map_err(|e| format!("Failed to look up connection for {email}: {e}"))
    }

    /// Persist a refreshed access token. Clears any previous auth failure.
    ///
    /// A rotated refresh token replaces the stored one; `None` keeps it.
    pub fn update_connection_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expiry: &str,
    ) -> Result<(), String> {
        let rows = self
            .conn
            .execute(
                "UPDATE connections SET
                    access_token = ?1,
                    refresh_token = COALESCE(?2, refresh_token),
                    token_expiry = ?3,
                    health = 'healthy',
                    last_error = NULL,
                    updated_at = ?4
                 WHERE id = ?5",
                params![access_token, refresh_token, expiry, Self::now(), id],
            )
            .map_err(|e| format!("Failed to persist refreshed token for {id}: {e}"))?;
        if rows == 0 {
            return Err(format!("Connection {id} vanished before token persist"));
        }
        Ok(())
    }

    /// Flag a connection whose grant was revoked or expired.
    pub fn mark_connection_auth_expired(&self, id: &str, error: &str) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE connections SET health = 'auth_expired', last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, Self::now(), id],
            )
            .map_err(|e| format!("Failed to mark connection {id} unhealthy: {e}"))?;
        Ok(())
    }

    pub fn set_last_history_id(&self, id: &str, history_id: &str) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE connections SET last_history_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![history_id, Self::now(), id],
            )
            .map_err(|e| format!("Failed to record history id for {id}: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;

    #[test]
    fn test_upsert_and_lookup_by_email_case_insensitive() {
        let db = test_db();
        db.upsert_connection(&sample_connection("c1", "Alerts@Example.com"))
            .unwrap();

        let found = db
            .get_connection_by_email("alerts@example.com")
            .unwrap()
            .expect("connection");
        assert_eq!(found.id, "c1");
        assert!(found.watch_enabled);
        assert_eq!(found.health, ConnectionHealth::Healthy);
    }

    #[test]
    fn test_update_tokens_keeps_refresh_token_when_not_rotated() {
        let db = test_db();
        db.upsert_connection(&sample_connection("c1", "a@b.com"))
            .unwrap();
        db.mark_connection_auth_expired("c1", "invalid_grant").unwrap();

        db.update_connection_tokens("c1", "ya29.new", None, "2030-01-01T00:00:00+00:00")
            .unwrap();

        let conn = db.get_connection("c1").unwrap().unwrap();
        assert_eq!(conn.access_token, "ya29.new");
        assert_eq!(conn.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(conn.token_expiry.as_deref(), Some("2030-01-01T00:00:00+00:00"));
        assert_eq!(conn.health, ConnectionHealth::Healthy);
        assert!(conn.last_error.is_none());
    }

    #[test]
    fn test_update_tokens_missing_connection_errors() {
        let db = test_db();
        let err = db
            .update_connection_tokens("nope", "t", None, "2030-01-01T00:00:00+00:00")
            .unwrap_err();
        assert!(err.contains("vanished"));
    }

    #[test]
    fn test_mark_auth_expired() {
        let db = test_db();
        db.upsert_connection(&sample_connection("c1", "a@b.com"))
            .unwrap();
        db.mark_connection_auth_expired("c1", "Token expired or revoked")
            .unwrap();
        let conn = db.get_connection("c1").unwrap().unwrap();
        assert_eq!(conn.health, ConnectionHealth::AuthExpired);
        assert_eq!(conn.last_error.as_deref(), Some("Token expired or revoked"));
    }
}
