use super::*;

use crate::intelligence::ExtractionMode;

const EXTRACTION_MODE_KEY: &str = "extraction_mode";

impl PipelineDb {
    // =========================================================================
    // Runtime settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT value FROM runtime_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("Failed to read setting {key}: {e}"))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT INTO runtime_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Self::now()],
            )
            .map_err(|e| format!("Failed to write setting {key}: {e}"))?;
        Ok(())
    }

    /// Current extraction mode, or `default` when never set. Unknown stored
    /// values also fall back to `default`.
    pub fn get_extraction_mode(&self, default: ExtractionMode) -> Result<ExtractionMode, String> {
        Ok(self
            .get_setting(EXTRACTION_MODE_KEY)?
            .and_then(|v| ExtractionMode::parse(&v))
            .unwrap_or(default))
    }

    pub fn set_extraction_mode(&self, mode: ExtractionMode) -> Result<(), String> {
        self.set_setting(EXTRACTION_MODE_KEY, mode.as_str())
    }

    /// Flip mock/real in one transaction and return the new mode.
    pub fn toggle_extraction_mode(&self, default: ExtractionMode) -> Result<ExtractionMode, String> {
        self.with_transaction(|db| {
            let next = db.get_extraction_mode(default)?.toggled();
            db.set_extraction_mode(next)?;
            Ok(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;

    #[test]
    fn test_mode_defaults_until_written() {
        let db = test_db();
        assert_eq!(
            db.get_extraction_mode(ExtractionMode::Real).unwrap(),
            ExtractionMode::Real
        );
        db.set_extraction_mode(ExtractionMode::Mock).unwrap();
        assert_eq!(
            db.get_extraction_mode(ExtractionMode::Real).unwrap(),
            ExtractionMode::Mock
        );
    }

    #[test]
    fn test_toggle_flips_and_persists() {
        let db = test_db();
        let first = db.toggle_extraction_mode(ExtractionMode::Real).unwrap();
        assert_eq!(first, ExtractionMode::Mock);
        let second = db.toggle_extraction_mode(ExtractionMode::Real).unwrap();
        assert_eq!(second, ExtractionMode::Real);
        assert_eq!(db.get_setting("extraction_mode").unwrap().as_deref(), Some("real"));
    }

    #[test]
    fn test_unknown_stored_value_falls_back() {
        let db = test_db();
        db.set_setting("extraction_mode", "sideways").unwrap();
        assert_eq!(
            db.get_extraction_mode(ExtractionMode::Mock).unwrap(),
            ExtractionMode::Mock
        );
    }
}
