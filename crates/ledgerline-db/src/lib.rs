//! Ledgerline Database Layer
//!
//! This crate provides PostgreSQL database access and store implementations
//! for the Ledgerline billing jobs. It includes:
//!
//! - Connection pool management and embedded migrations
//! - The balance ledger with row-locked, idempotent charges
//! - Call record, rate, billable resource and settings stores
//! - The raw CDR table reader

pub mod pool;
pub mod repositories;

pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use ledgerline_core::{AppError, AppResult};
pub use sqlx::PgPool;
