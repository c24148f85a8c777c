//! Ledgerline Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the Ledgerline billing jobs. It includes:
//!
//! - Domain models (Account, CallRecord, BalanceTransaction, BillableResource, etc.)
//! - Billing math and the call record state machine
//! - Store and collaborator traits
//! - Unified error handling with retry classification
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
