//! Settings repository.
//!
//! Retention configuration lives inside the settings record's JSON blob
//! under the `"recording"` key and is re-read on every cleanup cycle rather
//! than cached.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use crate::Result;
use crate::database::models::RetentionSettings;

/// Id of the singleton settings record.
const SETTINGS_RECORD_ID: i64 = 1;

/// Settings repository trait.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Load retention settings, falling back to defaults when the record is
    /// missing or unparseable.
    async fn load_retention(&self) -> Result<RetentionSettings>;
}

/// SQLx implementation of [`SettingsRepository`].
pub struct SqlxSettingsRepository {
    pool: SqlitePool,
}

impl SqlxSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for SqlxSettingsRepository {
    async fn load_retention(&self) -> Result<RetentionSettings> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT object_json FROM settings WHERE id = ?")
                .bind(SETTINGS_RECORD_ID)
                .fetch_optional(&self.pool)
                .await?;

        let Some((object_json,)) = row else {
            warn!("Settings record missing, using retention defaults");
            return Ok(RetentionSettings::default());
        };

        let value: serde_json::Value = match serde_json::from_str(&object_json) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Settings record unparseable, using retention defaults");
                return Ok(RetentionSettings::default());
            }
        };

        let settings = match value.get("recording") {
            Some(recording) => match serde_json::from_value::<RetentionSettings>(recording.clone())
            {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(error = %e, "Recording settings unparseable, using defaults");
                    RetentionSettings::default()
                }
            },
            None => RetentionSettings::default(),
        };

        Ok(settings.validated())
    }
}
