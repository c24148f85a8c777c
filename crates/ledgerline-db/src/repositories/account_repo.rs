//! Account repository implementation
//!
//! Read access to payer accounts. Balances are never written here; see
//! [`PgLedger`](super::PgLedger).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{Account, AccountType},
    traits::AccountRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

pub(crate) const ACCOUNT_COLUMNS: &str = r#"
    id, account_number, account_name, customer_phone,
    account_type, balance, credit_limit, currency,
    auto_terminate, created_at, updated_at
"#;

/// PostgreSQL implementation of AccountRepository
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    /// Create a new account repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i32) -> AppResult<Option<Account>> {
        debug!("Finding account by id: {}", id);

        let query = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let result = sqlx::query_as::<sqlx::Postgres, AccountRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding account {}: {}", id, e);
                AppError::Database(format!("Failed to find account: {}", e))
            })?;

        Ok(result.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_by_phone(&self, phone: &str) -> AppResult<Option<Account>> {
        debug!("Finding account by phone: {}", phone);

        let normalized = Account::normalize_phone(phone);
        if normalized.is_empty() {
            return Ok(None);
        }

        let query = format!(
            "SELECT {} FROM accounts WHERE customer_phone = $1 OR account_number = $1 ORDER BY id LIMIT 1",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<sqlx::Postgres, AccountRow>(&query)
            .bind(&normalized)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding account by phone: {}", e);
                AppError::Database(format!("Failed to find account: {}", e))
            })?;

        Ok(result.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> AppResult<Vec<Account>> {
        let query = format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS);
        let rows = sqlx::query_as::<sqlx::Postgres, AccountRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing accounts: {}", e);
                AppError::Database(format!("Failed to fetch accounts: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AccountRow {
    id: i32,
    account_number: String,
    account_name: Option<String>,
    customer_phone: Option<String>,
    account_type: String,
    balance: Decimal,
    credit_limit: Decimal,
    currency: String,
    auto_terminate: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            account_number: row.account_number,
            account_name: row.account_name,
            customer_phone: row.customer_phone,
            account_type: AccountType::from_str(&row.account_type).unwrap_or_default(),
            balance: row.balance,
            credit_limit: row.credit_limit,
            currency: row.currency,
            auto_terminate: row.auto_terminate,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
