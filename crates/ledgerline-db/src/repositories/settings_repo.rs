//! Watermark/settings store backed by `billing_settings`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    traits::{Setting, SettingsStore},
    AppError, AppResult,
};
use sqlx::PgPool;
use tracing::{error, instrument};

pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> AppResult<Option<Setting>> {
        let row: Option<(String, serde_json::Value, DateTime<Utc>)> =
            sqlx::query_as("SELECT key, value, updated_at FROM billing_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    error!("Database error reading setting {}: {}", key, e);
                    AppError::Database(format!("Failed to read setting: {}", e))
                })?;

        Ok(row.map(|(key, value, updated_at)| Setting {
            key,
            value,
            updated_at,
        }))
    }

    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error writing setting {}: {}", key, e);
            AppError::Database(format!("Failed to write setting: {}", e))
        })?;

        Ok(())
    }
}
