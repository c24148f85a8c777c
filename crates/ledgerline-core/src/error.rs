//! Unified error handling for Ledgerline
//!
//! This module provides a single error type covering every failure the
//! billing jobs can hit, together with the transient/permanent
//! classification the retry machinery relies on.

use thiserror::Error;

/// Main application error type
///
/// All errors in the application should be converted to this type.
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Database Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    // ==================== Cache Errors ====================
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache connection failed: {0}")]
    CacheConnection(String),

    // ==================== Business Logic Errors ====================
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Rate not found for destination: {0}")]
    RateNotFound(String),

    #[error("Call record not found: {0}")]
    CallRecordNotFound(String),

    #[error("Invalid billing transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    // ==================== Job Errors ====================
    #[error("Lock held by another process: {0}")]
    LockContention(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    // ==================== Validation Errors ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Resource Errors ====================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ==================== External Service Errors ====================
    #[error("Telephony provider error: {0}")]
    Telephony(String),

    #[error("ESL connection error: {0}")]
    EslConnection(String),

    #[error("ESL command failed: {0}")]
    EslCommand(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),
}

impl AppError {
    /// Returns the error code used in logs, billing details and notifications
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Transaction(_) => "transaction_error",
            AppError::Cache(_) => "cache_error",
            AppError::CacheConnection(_) => "cache_connection_error",
            AppError::AccountNotFound(_) => "account_not_found",
            AppError::InsufficientBalance { .. } => "insufficient_balance",
            AppError::RateNotFound(_) => "rate_not_found",
            AppError::CallRecordNotFound(_) => "call_record_not_found",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::MalformedRecord(_) => "malformed_record",
            AppError::LockContention(_) => "lock_contention",
            AppError::Timeout(_) => "timeout",
            AppError::LedgerInconsistency(_) => "ledger_inconsistency",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Telephony(_) => "telephony_error",
            AppError::EslConnection(_) => "esl_connection_error",
            AppError::EslCommand(_) => "esl_command_error",
            AppError::Notification(_) => "notification_error",
        }
    }

    /// Whether a later attempt may succeed without operator intervention
    ///
    /// Retryable errors leave a record in `failed` so the retry phase can
    /// pick it up after the cooldown. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Pool(_)
                | AppError::Transaction(_)
                | AppError::Cache(_)
                | AppError::CacheConnection(_)
                | AppError::RateNotFound(_)
                | AppError::AccountNotFound(_)
                | AppError::Timeout(_)
                | AppError::Telephony(_)
                | AppError::EslConnection(_)
                | AppError::EslCommand(_)
                | AppError::Internal(_)
        )
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
