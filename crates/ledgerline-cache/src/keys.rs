//! Redis key names
//!
//! - `ledgerline:rate:{destination}`: cached rate card
//! - `ledgerline:lock:{job}`: job lock, value is the JSON lock holder

/// Namespace shared by every key this crate writes
pub const NAMESPACE: &str = "ledgerline";

/// Default TTL for cached rate cards (5 minutes)
pub const RATE_TTL_SECS: u64 = 300;

/// Cache key for the rate resolved for a destination
pub fn rate_key(destination: &str) -> String {
    format!("{}:rate:{}", NAMESPACE, destination)
}

/// Lock key for a job name
pub fn lock_key(job: &str) -> String {
    format!("{}:lock:{}", NAMESPACE, job)
}
