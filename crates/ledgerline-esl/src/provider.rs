//! FreeSWITCH as the telephony collaborator
//!
//! Final CDRs come from the switch's CDR table; connected calls and
//! hangups go over ESL. The ESL socket is opened on first use and dropped
//! after any failure so the next call reconnects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    config::FreeSwitchConfig,
    models::{ActiveCall, CdrCursor, RawCdr},
    traits::TelephonyProvider,
    AppError, AppResult,
};
use ledgerline_db::PgCdrSource;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::calls::{parse_active_calls, SHOW_CALLS};
use crate::connection::EslConnection;
use crate::message::EslMessage;

pub struct FreeSwitchProvider {
    config: FreeSwitchConfig,
    cdrs: PgCdrSource,
    conn: Mutex<Option<EslConnection>>,
}

impl FreeSwitchProvider {
    pub fn new(config: FreeSwitchConfig, cdrs: PgCdrSource) -> Self {
        Self {
            config,
            cdrs,
            conn: Mutex::new(None),
        }
    }

    async fn api(&self, command: &str) -> AppResult<EslMessage> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(EslConnection::connect(&self.config).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(AppError::EslConnection("no ESL connection".to_string()));
        };

        let result = conn.api(command).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

/// `uuid_kill` command for a call
pub fn kill_command(call_id: &str) -> String {
    format!("uuid_kill {} NORMAL_CLEARING", call_id)
}

#[async_trait]
impl TelephonyProvider for FreeSwitchProvider {
    async fn fetch_cdrs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&CdrCursor>,
        limit: usize,
    ) -> AppResult<Vec<RawCdr>> {
        self.cdrs.fetch(start, end, after, limit).await
    }

    #[instrument(skip(self))]
    async fn active_calls(&self) -> AppResult<Vec<ActiveCall>> {
        let reply = self.api(SHOW_CALLS).await?;
        parse_active_calls(reply.body().unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn terminate_call(&self, call_id: &str) -> AppResult<bool> {
        let reply = self.api(&kill_command(call_id)).await?;
        if reply.is_ok() {
            info!("Terminated call {}", call_id);
            Ok(true)
        } else {
            warn!(
                "Switch refused to terminate {}: {}",
                call_id,
                reply.error_message().unwrap_or_default()
            );
            Ok(false)
        }
    }
}
