//! Balance ledger
//!
//! Every balance change goes through [`apply_charge`]: it locks the account
//! row with `SELECT ... FOR UPDATE`, appends one `balance_transactions`
//! row and writes the new cached balance, all on the caller's connection.
//! [`PgLedger`] wraps it in its own transaction; the recurring sweep runs
//! it inside a chunk transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{BalanceTransaction, ChargeRequest, ChargeResult, Direction, ReferenceType},
    traits::Ledger,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, info, instrument};

const TRANSACTION_COLUMNS: &str = r#"
    id, account_id, amount, direction, balance_before, balance_after,
    reason, reference_type, reference_id, idempotency_key, created_at
"#;

/// PostgreSQL implementation of the ledger
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Lock the account row and return its cached balance
pub(crate) async fn lock_balance(conn: &mut PgConnection, account_id: i32) -> AppResult<Decimal> {
    let row: Option<(Decimal,)> =
        sqlx::query_as("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                error!("Failed to lock account {}: {}", account_id, e);
                AppError::Database(format!("Failed to lock account: {}", e))
            })?;

    row.map(|(balance,)| balance)
        .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
}

/// Apply a charge on an open transaction
///
/// The caller owns commit/rollback.
pub(crate) async fn apply_charge(
    conn: &mut PgConnection,
    request: &ChargeRequest,
) -> AppResult<ChargeResult> {
    request.validate()?;

    let balance_before = lock_balance(conn, request.account_id).await?;

    // Same key means same account, so the row lock serializes racers
    let query = format!(
        "SELECT {} FROM balance_transactions WHERE idempotency_key = $1",
        TRANSACTION_COLUMNS
    );
    let existing = sqlx::query_as::<sqlx::Postgres, TransactionRow>(&query)
        .bind(&request.idempotency_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::Database(format!("Failed to check idempotency key: {}", e)))?;

    if let Some(row) = existing {
        let tx: BalanceTransaction = row.into();
        debug!(
            "Charge {} already booked as transaction {}",
            request.idempotency_key, tx.id
        );
        return Ok(ChargeResult::duplicate_of(&tx));
    }

    let pending = BalanceTransaction::from_request(0, request, balance_before);

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO balance_transactions (
            account_id, amount, direction, balance_before, balance_after,
            reason, reference_type, reference_id, idempotency_key
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(pending.account_id)
    .bind(pending.amount)
    .bind(pending.direction.to_string())
    .bind(pending.balance_before)
    .bind(pending.balance_after)
    .bind(&pending.reason)
    .bind(pending.reference_type.to_string())
    .bind(&pending.reference_id)
    .bind(&pending.idempotency_key)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to append ledger entry: {}", e);
        AppError::Database(format!("Failed to append ledger entry: {}", e))
    })?;

    sqlx::query(
        r#"
        UPDATE accounts
        SET balance = $2,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(pending.account_id)
    .bind(pending.balance_after)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to update account balance: {}", e);
        AppError::Database(format!("Failed to update balance: {}", e))
    })?;

    let tx = BalanceTransaction { id, ..pending };
    Ok(ChargeResult::applied(&tx))
}

#[async_trait]
impl Ledger for PgLedger {
    #[instrument(skip(self, request), fields(account_id = request.account_id, key = %request.idempotency_key))]
    async fn charge_account(&self, request: &ChargeRequest) -> AppResult<ChargeResult> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        let result = apply_charge(&mut *tx, request).await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        if !result.duplicate {
            info!(
                "Ledger {} {} on account {}: {} -> {}",
                request.direction,
                request.amount,
                request.account_id,
                result.balance_before,
                result.balance_after
            );
        }

        Ok(result)
    }

    #[instrument(skip(self))]
    async fn transactions(&self, account_id: i32) -> AppResult<Vec<BalanceTransaction>> {
        let query = format!(
            "SELECT {} FROM balance_transactions WHERE account_id = $1 ORDER BY id",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, TransactionRow>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error loading ledger for {}: {}", account_id, e);
                AppError::Database(format!("Failed to load ledger: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    account_id: i32,
    amount: Decimal,
    direction: String,
    balance_before: Decimal,
    balance_after: Decimal,
    reason: String,
    reference_type: String,
    reference_id: String,
    idempotency_key: String,
    created_at: DateTime<Utc>,
}

impl From<TransactionRow> for BalanceTransaction {
    fn from(row: TransactionRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            direction: Direction::from_str(&row.direction).unwrap_or(Direction::Debit),
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            reason: row.reason,
            reference_type: ReferenceType::from_str(&row.reference_type)
                .unwrap_or(ReferenceType::Adjustment),
            reference_id: row.reference_id,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerline_core::config::DatabaseConfig;
    use rust_decimal_macros::dec;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_charge_is_idempotent() {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/ledgerline_test".to_string()),
            ..Default::default()
        };
        let pool = crate::create_pool(&config).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();

        let (account_id,): (i32,) = sqlx::query_as(
            "INSERT INTO accounts (account_number, balance) VALUES ($1, 10) RETURNING id",
        )
        .bind(format!("test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()))
        .fetch_one(&pool)
        .await
        .unwrap();

        let ledger = PgLedger::new(pool);
        let request = ChargeRequest::debit(
            account_id,
            dec!(0.15),
            "test call",
            ReferenceType::CallRecord,
            "call-1",
            format!("cdr:test-{}", account_id),
        );

        let first = ledger.charge_account(&request).await.unwrap();
        assert_eq!(first.balance_after, dec!(9.85));

        let second = ledger.charge_account(&request).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.transaction_id, first.transaction_id);
        assert_eq!(ledger.transactions(account_id).await.unwrap().len(), 1);
    }
}
