//! Rate card lookups
//!
//! Longest Prefix Match over `rate_cards`: the destination is expanded
//! into all of its prefixes and the longest effective one wins, ties going
//! to the higher priority and then the most recently effective card.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{models::RateCard, traits::RateRepository, AppError, AppResult};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

/// PostgreSQL implementation of RateRepository
pub struct PgRateRepository {
    pool: PgPool,
}

impl PgRateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateRepository for PgRateRepository {
    #[instrument(skip(self))]
    async fn find_by_destination(&self, destination: &str) -> AppResult<Option<RateCard>> {
        let prefixes = RateCard::generate_prefixes(destination);
        if prefixes.is_empty() {
            debug!("Destination {:?} has no digits", destination);
            return Ok(None);
        }

        let row = sqlx::query_as::<sqlx::Postgres, RateCardRow>(
            r#"
            SELECT
                id, rate_name, destination_prefix, destination_name,
                rate_per_minute, billing_increment, connection_fee,
                effective_start, effective_end, priority,
                created_at, updated_at
            FROM rate_cards
            WHERE destination_prefix = ANY($1)
              AND effective_start <= NOW()
              AND (effective_end IS NULL OR effective_end > NOW())
            ORDER BY
                LENGTH(destination_prefix) DESC,
                priority DESC,
                effective_start DESC
            LIMIT 1
            "#,
        )
        .bind(&prefixes)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Rate lookup for {} failed: {}", destination, e);
            AppError::Database(format!("Failed to find rate: {}", e))
        })?;

        Ok(row.map(Into::into))
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct RateCardRow {
    id: i32,
    rate_name: Option<String>,
    destination_prefix: String,
    destination_name: String,
    rate_per_minute: Decimal,
    billing_increment: i32,
    connection_fee: Decimal,
    effective_start: DateTime<Utc>,
    effective_end: Option<DateTime<Utc>>,
    priority: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RateCardRow> for RateCard {
    fn from(row: RateCardRow) -> Self {
        Self {
            id: row.id,
            rate_name: row.rate_name,
            destination_prefix: row.destination_prefix,
            destination_name: row.destination_name,
            rate_per_minute: row.rate_per_minute,
            // A zero increment in the table means per-second billing
            billing_increment: row.billing_increment.max(1),
            connection_fee: row.connection_fee,
            effective_start: row.effective_start,
            effective_end: row.effective_end,
            priority: row.priority,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
