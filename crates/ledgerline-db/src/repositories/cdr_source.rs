//! Raw CDR source
//!
//! Reads final CDRs from the table the switch writes them to (by default
//! `freeswitch_cdrs`, as produced by `mod_cdr_pg_csv`).

use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{CdrCursor, RawCdr},
    AppError, AppResult,
};
use sqlx::PgPool;
use tracing::{debug, error, instrument};

pub struct PgCdrSource {
    pool: PgPool,
    table: String,
}

impl PgCdrSource {
    /// `table` must be a plain identifier; it is interpolated into SQL
    pub fn new(pool: PgPool, table: impl Into<String>) -> AppResult<Self> {
        let table = table.into();
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(AppError::Config(format!("invalid CDR table name: {:?}", table)));
        }
        Ok(Self { pool, table })
    }

    /// CDRs of calls that ended in `[start, end)`, keyset-paged on
    /// `(end_stamp, uuid)` after `after`
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&CdrCursor>,
        limit: usize,
    ) -> AppResult<Vec<RawCdr>> {
        let query = format!(
            r#"
            SELECT uuid, caller_id_number, destination_number,
                   start_stamp, answer_stamp, end_stamp,
                   duration, billsec, hangup_cause
            FROM {}
            WHERE end_stamp >= $1 AND end_stamp < $2
              AND ($3::timestamptz IS NULL OR (end_stamp, uuid) > ($3, $4))
            ORDER BY end_stamp, uuid
            LIMIT $5
            "#,
            self.table
        );

        let rows = sqlx::query_as::<sqlx::Postgres, SwitchCdrRow>(&query)
            .bind(start)
            .bind(end)
            .bind(after.map(|c| c.end_time))
            .bind(after.map(|c| c.call_id.as_str()).unwrap_or_default())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to read CDRs from {}: {}", self.table, e);
                AppError::Telephony(format!("Failed to fetch CDRs: {}", e))
            })?;

        debug!("Fetched {} CDRs between {} and {}", rows.len(), start, end);
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SwitchCdrRow {
    uuid: String,
    caller_id_number: String,
    destination_number: String,
    start_stamp: DateTime<Utc>,
    answer_stamp: Option<DateTime<Utc>>,
    end_stamp: DateTime<Utc>,
    duration: i64,
    billsec: Option<i64>,
    hangup_cause: String,
}

impl From<SwitchCdrRow> for RawCdr {
    fn from(row: SwitchCdrRow) -> Self {
        Self {
            call_id: row.uuid,
            source: row.caller_id_number,
            destination: row.destination_number,
            start_time: row.start_stamp,
            answer_time: row.answer_stamp,
            end_time: Some(row.end_stamp),
            duration: row.duration,
            billsec: row.billsec,
            disposition: row.hangup_cause,
        }
    }
}
