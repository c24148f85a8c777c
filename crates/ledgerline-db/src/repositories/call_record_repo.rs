//! Call record repository implementation
//!
//! `call_id` is unique, so inserting a record twice is a no-op and
//! re-ingesting a CDR can never produce a second row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{BillingDetails, BillingStatus, CallRecord, CallStatus},
    traits::CallRecordRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::{types::Json, PgPool};
use tracing::{debug, error, instrument};

const CALL_RECORD_COLUMNS: &str = r#"
    id, call_id, account_id, source, destination,
    start_time, answer_time, end_time, duration, billsec, disposition,
    call_status, rate_per_minute, billing_increment, connection_fee,
    cost, charged_amount, charged_seconds, billing_status, retry_count,
    billing_details, created_at, updated_at
"#;

/// PostgreSQL implementation of CallRecordRepository
pub struct PgCallRecordRepository {
    pool: PgPool,
}

impl PgCallRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select(&self, filter: &str, binds: SelectBinds) -> AppResult<Vec<CallRecord>> {
        let query = format!("SELECT {} FROM call_records {}", CALL_RECORD_COLUMNS, filter);
        let mut q = sqlx::query_as::<sqlx::Postgres, CallRecordRow>(&query);
        q = match binds {
            SelectBinds::None => q,
            SelectBinds::Backlog { stale_before, limit } => q.bind(stale_before).bind(limit),
            SelectBinds::Retry {
                max_retries,
                cooldown_before,
                limit,
            } => q.bind(max_retries).bind(cooldown_before).bind(limit),
        };

        let rows = q.fetch_all(&self.pool).await.map_err(|e| {
            error!("Database error selecting call records: {}", e);
            AppError::Database(format!("Failed to select call records: {}", e))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

enum SelectBinds {
    None,
    Backlog {
        stale_before: DateTime<Utc>,
        limit: i64,
    },
    Retry {
        max_retries: i32,
        cooldown_before: DateTime<Utc>,
        limit: i64,
    },
}

#[async_trait]
impl CallRecordRepository for PgCallRecordRepository {
    #[instrument(skip(self))]
    async fn find_by_call_id(&self, call_id: &str) -> AppResult<Option<CallRecord>> {
        let query = format!(
            "SELECT {} FROM call_records WHERE call_id = $1",
            CALL_RECORD_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, CallRecordRow>(&query)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding call record {}: {}", call_id, e);
                AppError::Database(format!("Failed to find call record: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, record), fields(call_id = %record.call_id))]
    async fn insert(&self, record: &CallRecord) -> AppResult<Option<CallRecord>> {
        let query = format!(
            r#"
            INSERT INTO call_records (
                call_id, account_id, source, destination,
                start_time, answer_time, end_time, duration, billsec, disposition,
                call_status, rate_per_minute, billing_increment, connection_fee,
                cost, charged_amount, charged_seconds, billing_status, retry_count,
                billing_details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (call_id) DO NOTHING
            RETURNING {}
            "#,
            CALL_RECORD_COLUMNS
        );

        let row = sqlx::query_as::<sqlx::Postgres, CallRecordRow>(&query)
            .bind(&record.call_id)
            .bind(record.account_id)
            .bind(&record.source)
            .bind(&record.destination)
            .bind(record.start_time)
            .bind(record.answer_time)
            .bind(record.end_time)
            .bind(record.duration)
            .bind(record.billsec)
            .bind(&record.disposition)
            .bind(record.call_status.to_string())
            .bind(record.rate_per_minute)
            .bind(record.billing_increment)
            .bind(record.connection_fee)
            .bind(record.cost)
            .bind(record.charged_amount)
            .bind(record.charged_seconds)
            .bind(record.billing_status.as_str())
            .bind(record.retry_count)
            .bind(Json(&record.billing_details))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error inserting call record: {}", e);
                AppError::Database(format!("Failed to insert call record: {}", e))
            })?;

        if row.is_none() {
            debug!("Call record {} already exists", record.call_id);
        }

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, record), fields(call_id = %record.call_id, status = %record.billing_status))]
    async fn save(&self, record: &CallRecord) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE call_records
            SET account_id = $2,
                answer_time = $3,
                end_time = $4,
                duration = $5,
                billsec = $6,
                disposition = $7,
                call_status = $8,
                rate_per_minute = $9,
                billing_increment = $10,
                connection_fee = $11,
                cost = $12,
                charged_amount = $13,
                charged_seconds = $14,
                billing_status = $15,
                retry_count = $16,
                billing_details = $17,
                updated_at = NOW()
            WHERE call_id = $1
            "#,
        )
        .bind(&record.call_id)
        .bind(record.account_id)
        .bind(record.answer_time)
        .bind(record.end_time)
        .bind(record.duration)
        .bind(record.billsec)
        .bind(&record.disposition)
        .bind(record.call_status.to_string())
        .bind(record.rate_per_minute)
        .bind(record.billing_increment)
        .bind(record.connection_fee)
        .bind(record.cost)
        .bind(record.charged_amount)
        .bind(record.charged_seconds)
        .bind(record.billing_status.as_str())
        .bind(record.retry_count)
        .bind(Json(&record.billing_details))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error saving call record {}: {}", record.call_id, e);
            AppError::Database(format!("Failed to save call record: {}", e))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::CallRecordNotFound(record.call_id.clone()));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_charge(
        &self,
        call_id: &str,
        amount: Decimal,
        charged_seconds: i64,
        shortfall: Decimal,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE call_records
            SET charged_amount = charged_amount + $2,
                charged_seconds = GREATEST(charged_seconds, $3),
                billing_details = jsonb_set(
                    billing_details,
                    '{shortfall}',
                    to_jsonb(COALESCE((billing_details->>'shortfall')::numeric, 0) + $4)
                ),
                updated_at = NOW()
            WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .bind(amount)
        .bind(charged_seconds)
        .bind(shortfall)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error recording increment for {}: {}", call_id, e);
            AppError::Database(format!("Failed to record increment: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self, call_ids), fields(calls = call_ids.len()))]
    async fn mark_seen(&self, call_ids: &[String], seen_at: DateTime<Utc>) -> AppResult<()> {
        if call_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE call_records
            SET billing_details = jsonb_set(billing_details, '{last_seen_at}', to_jsonb($2::timestamptz))
            WHERE call_id = ANY($1)
              AND call_status = 'connected'
            "#,
        )
        .bind(call_ids)
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error marking {} calls seen: {}", call_ids.len(), e);
            AppError::Database(format!("Failed to mark calls seen: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_backlog(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CallRecord>> {
        self.select(
            r#"
            WHERE (billing_status = 'pending' AND call_status <> 'connected')
               OR (billing_status = 'processing' AND updated_at < $1)
            ORDER BY id
            LIMIT $2
            "#,
            SelectBinds::Backlog {
                stale_before,
                limit: limit as i64,
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn find_retryable(
        &self,
        max_retries: i32,
        cooldown_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CallRecord>> {
        self.select(
            r#"
            WHERE billing_status = 'failed'
              AND retry_count < $1
              AND updated_at < $2
            ORDER BY updated_at, id
            LIMIT $3
            "#,
            SelectBinds::Retry {
                max_retries,
                cooldown_before,
                limit: limit as i64,
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn find_connected(&self) -> AppResult<Vec<CallRecord>> {
        self.select(
            r#"
            WHERE call_status = 'connected'
              AND billing_status = 'pending'
            ORDER BY answer_time NULLS LAST, id
            "#,
            SelectBinds::None,
        )
        .await
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct CallRecordRow {
    id: i64,
    call_id: String,
    account_id: Option<i32>,
    source: String,
    destination: String,
    start_time: DateTime<Utc>,
    answer_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    duration: i64,
    billsec: i64,
    disposition: Option<String>,
    call_status: String,
    rate_per_minute: Option<Decimal>,
    billing_increment: Option<i32>,
    connection_fee: Decimal,
    cost: Option<Decimal>,
    charged_amount: Decimal,
    charged_seconds: i64,
    billing_status: String,
    retry_count: i32,
    billing_details: Json<BillingDetails>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CallRecordRow> for CallRecord {
    fn from(row: CallRecordRow) -> Self {
        Self {
            id: row.id,
            call_id: row.call_id,
            account_id: row.account_id,
            source: row.source,
            destination: row.destination,
            start_time: row.start_time,
            answer_time: row.answer_time,
            end_time: row.end_time,
            duration: row.duration,
            billsec: row.billsec,
            disposition: row.disposition,
            call_status: CallStatus::from_str(&row.call_status).unwrap_or_default(),
            rate_per_minute: row.rate_per_minute,
            billing_increment: row.billing_increment,
            connection_fee: row.connection_fee,
            cost: row.cost,
            charged_amount: row.charged_amount,
            charged_seconds: row.charged_seconds,
            // Unknown statuses are treated as terminal so nothing re-bills them
            billing_status: BillingStatus::from_str(&row.billing_status)
                .unwrap_or(BillingStatus::PermanentlyFailed),
            retry_count: row.retry_count,
            billing_details: row.billing_details.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
