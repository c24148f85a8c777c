//! Billable resource repository
//!
//! `bill_chunk` runs a whole chunk of the monthly sweep in one
//! transaction: every resource and owner row it touches is locked, ledger
//! entries and history appends share the same commit, and any error rolls
//! the chunk back without affecting chunks already committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{
        BillableResource, BillingHistory, BillingPeriod, ChargeRequest, HistoryEntry,
        RecurringDecision, ReferenceType, ResourceStatus,
    },
    traits::{ResourceOutcome, ResourceRepository},
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::{types::Json, PgConnection, PgPool};
use tracing::{debug, error, info, instrument, warn};

use super::ledger_repo::{apply_charge, lock_balance};

const RESOURCE_COLUMNS: &str = r#"
    id, number, owner_account_id, monthly_cost, status,
    assigned_at, expires_at, suspended_at, suspension_reason,
    billing_history, created_at, updated_at
"#;

/// PostgreSQL implementation of ResourceRepository
pub struct PgResourceRepository {
    pool: PgPool,
}

impl PgResourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn bill_one(
        conn: &mut PgConnection,
        period: BillingPeriod,
        resource_id: i64,
        suspend_insufficient: bool,
    ) -> AppResult<Option<ResourceOutcome>> {
        let query = format!(
            "SELECT {} FROM billable_resources WHERE id = $1 FOR UPDATE",
            RESOURCE_COLUMNS
        );
        let resource: BillableResource = match sqlx::query_as::<sqlx::Postgres, ResourceRow>(&query)
            .bind(resource_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| AppError::Database(format!("Failed to lock resource: {}", e)))?
        {
            Some(row) => row.into(),
            None => return Ok(None),
        };

        // Re-checked under lock: another sweep may have billed it meanwhile
        if !resource.is_due(period) {
            debug!("Resource {} no longer due for {}", resource.number, period);
            return Ok(None);
        }
        let Some(owner) = resource.owner_account_id else {
            return Ok(None);
        };

        let balance = lock_balance(conn, owner).await?;
        let decision = RecurringDecision::decide(resource.monthly_cost, balance, suspend_insufficient);

        let mut outcome = ResourceOutcome {
            resource_id: resource.id,
            number: resource.number.clone(),
            owner_account_id: owner,
            amount: resource.monthly_cost,
            decision,
            balance_before: balance,
            balance_after: balance,
            transaction_id: None,
        };

        if decision != RecurringDecision::Suspend && resource.monthly_cost > Decimal::ZERO {
            let charge = apply_charge(
                conn,
                &ChargeRequest::debit(
                    owner,
                    resource.monthly_cost,
                    format!("Monthly charge for {} ({})", resource.number, period),
                    ReferenceType::RecurringCharge,
                    resource.id.to_string(),
                    resource.charge_key(period),
                ),
            )
            .await?;
            outcome.balance_before = charge.balance_before;
            outcome.balance_after = charge.balance_after;
            outcome.transaction_id = Some(charge.transaction_id);
        }

        let entry = HistoryEntry {
            period,
            amount: resource.monthly_cost,
            status: decision.history_status(),
            transaction_id: outcome.transaction_id,
            reason: (decision == RecurringDecision::Suspend).then(|| insufficient_reason(&outcome)),
            recorded_at: Utc::now(),
        };

        let update = match decision {
            RecurringDecision::Suspend => sqlx::query(
                r#"
                UPDATE billable_resources
                SET status = 'suspended',
                    suspended_at = NOW(),
                    suspension_reason = $3,
                    billing_history = billing_history || $2::jsonb,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(resource.id)
            .bind(Json(vec![entry.clone()]))
            .bind(entry.reason.clone()),
            RecurringDecision::Charge | RecurringDecision::ChargeOverdue => sqlx::query(
                r#"
                UPDATE billable_resources
                SET expires_at = $3,
                    billing_history = billing_history || $2::jsonb,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(resource.id)
            .bind(Json(vec![entry.clone()]))
            .bind(period.end()),
        };

        update.execute(&mut *conn).await.map_err(|e| {
            error!("Failed to update resource {}: {}", resource.number, e);
            AppError::Database(format!("Failed to update resource: {}", e))
        })?;

        Ok(Some(outcome))
    }
}

fn insufficient_reason(outcome: &ResourceOutcome) -> String {
    format!(
        "Insufficient balance: required {}, available {}",
        outcome.amount, outcome.balance_before
    )
}

#[async_trait]
impl ResourceRepository for PgResourceRepository {
    #[instrument(skip(self))]
    async fn find_due(
        &self,
        period: BillingPeriod,
        after_id: i64,
        limit: usize,
    ) -> AppResult<Vec<BillableResource>> {
        let query = format!(
            r#"
            SELECT {}
            FROM billable_resources
            WHERE status = 'assigned'
              AND owner_account_id IS NOT NULL
              AND assigned_at < $1
              AND id > $2
              AND NOT (billing_history @> $3::jsonb)
            ORDER BY id
            LIMIT $4
            "#,
            RESOURCE_COLUMNS
        );

        let rows = sqlx::query_as::<sqlx::Postgres, ResourceRow>(&query)
            .bind(period.end())
            .bind(after_id)
            .bind(serde_json::json!([{ "period": period }]))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error selecting due resources: {}", e);
                AppError::Database(format!("Failed to select resources: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, resource_ids), fields(chunk = resource_ids.len()))]
    async fn bill_chunk(
        &self,
        period: BillingPeriod,
        resource_ids: &[i64],
        suspend_insufficient: bool,
    ) -> AppResult<Vec<ResourceOutcome>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        let mut outcomes = Vec::with_capacity(resource_ids.len());
        for &id in resource_ids {
            match Self::bill_one(&mut *tx, period, id, suspend_insufficient).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    warn!("Rolling back chunk at resource {}: {}", id, e);
                    // Dropping the transaction rolls it back
                    return Err(e);
                }
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        info!(
            "Committed {} recurring outcomes for {}",
            outcomes.len(),
            period
        );
        Ok(outcomes)
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    id: i64,
    number: String,
    owner_account_id: Option<i32>,
    monthly_cost: Decimal,
    status: String,
    assigned_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    suspended_at: Option<DateTime<Utc>>,
    suspension_reason: Option<String>,
    billing_history: Json<BillingHistory>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ResourceRow> for BillableResource {
    fn from(row: ResourceRow) -> Self {
        Self {
            id: row.id,
            number: row.number,
            owner_account_id: row.owner_account_id,
            monthly_cost: row.monthly_cost,
            status: ResourceStatus::from_str(&row.status).unwrap_or_default(),
            assigned_at: row.assigned_at,
            expires_at: row.expires_at,
            suspended_at: row.suspended_at,
            suspension_reason: row.suspension_reason,
            billing_history: row.billing_history.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_reason() {
        let outcome = ResourceOutcome {
            resource_id: 1,
            number: "15550001".to_string(),
            owner_account_id: 1,
            amount: dec!(5.00),
            decision: RecurringDecision::Suspend,
            balance_before: dec!(3.00),
            balance_after: dec!(3.00),
            transaction_id: None,
        };
        assert_eq!(
            insufficient_reason(&outcome),
            "Insufficient balance: required 5.00, available 3.00"
        );
    }

    #[test]
    fn test_history_containment_filter_shape() {
        let period = BillingPeriod::parse("2024-05").unwrap();
        assert_eq!(
            serde_json::json!([{ "period": period }]).to_string(),
            r#"[{"period":"2024-05"}]"#
        );
    }
}
