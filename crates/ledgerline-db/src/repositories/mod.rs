//! Repository implementations
//!
//! This module contains concrete implementations of the store traits
//! defined in ledgerline-core, using sqlx for PostgreSQL access.

pub mod account_repo;
pub mod call_record_repo;
pub mod cdr_source;
pub mod ledger_repo;
pub mod rate_repo;
pub mod resource_repo;
pub mod settings_repo;

pub use account_repo::PgAccountRepository;
pub use call_record_repo::PgCallRecordRepository;
pub use cdr_source::PgCdrSource;
pub use ledger_repo::PgLedger;
pub use rate_repo::PgRateRepository;
pub use resource_repo::PgResourceRepository;
pub use settings_repo::PgSettingsStore;
