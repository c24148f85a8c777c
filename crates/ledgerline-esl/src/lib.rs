//! FreeSWITCH integration for Ledgerline
//!
//! ```text
//!  freeswitch_cdrs table ──► PgCdrSource ──┐
//!                                          ├─► FreeSwitchProvider (TelephonyProvider)
//!  ESL socket ──► EslConnection ───────────┘     fetch_cdrs / active_calls / terminate_call
//! ```

pub mod calls;
pub mod connection;
pub mod message;
pub mod provider;

pub use calls::parse_active_calls;
pub use connection::EslConnection;
pub use message::EslMessage;
pub use provider::FreeSwitchProvider;
