//! Connected-call discovery from `show calls as json`

use chrono::{DateTime, TimeZone, Utc};
use ledgerline_core::{models::ActiveCall, AppError, AppResult};
use serde::Deserialize;
use tracing::warn;

pub const SHOW_CALLS: &str = "show calls as json";

#[derive(Debug, Deserialize)]
struct CallsReply {
    #[serde(default)]
    rows: Vec<CallRow>,
}

/// Subset of a `show calls` row; FreeSWITCH renders every value as a string
#[derive(Debug, Deserialize)]
struct CallRow {
    uuid: String,
    #[serde(default)]
    cid_num: String,
    #[serde(default)]
    dest: String,
    #[serde(default)]
    created_epoch: String,
    #[serde(default)]
    answered_epoch: Option<String>,
    #[serde(default)]
    callstate: String,
}

fn epoch(value: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = value.trim().parse().ok()?;
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

impl CallRow {
    fn into_active_call(self) -> Option<ActiveCall> {
        if !self.callstate.eq_ignore_ascii_case("ACTIVE") {
            return None;
        }
        let start_time = epoch(&self.created_epoch)?;
        // `show calls` has no answer column on older switches
        let answer_time = self
            .answered_epoch
            .as_deref()
            .and_then(epoch)
            .unwrap_or(start_time);

        Some(ActiveCall {
            call_id: self.uuid,
            source: self.cid_num,
            destination: self.dest,
            start_time,
            answer_time,
        })
    }
}

/// Answered calls in a `show calls as json` body
///
/// Ringing or held-up-in-setup calls are left out; rows without a usable
/// creation time are skipped with a warning.
pub fn parse_active_calls(body: &str) -> AppResult<Vec<ActiveCall>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(err) = body.strip_prefix("-ERR") {
        return Err(AppError::EslCommand(format!("show calls: {}", err.trim())));
    }

    let reply: CallsReply = serde_json::from_str(body)
        .map_err(|e| AppError::Telephony(format!("unreadable call list: {}", e)))?;

    let mut calls = Vec::with_capacity(reply.rows.len());
    for row in reply.rows {
        let uuid = row.uuid.clone();
        let is_active = row.callstate.eq_ignore_ascii_case("ACTIVE");
        match row.into_active_call() {
            Some(call) => calls.push(call),
            None if is_active => warn!("Skipping call {} without a start time", uuid),
            None => {}
        }
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_calls() {
        assert!(parse_active_calls(r#"{"row_count":0}"#).unwrap().is_empty());
        assert!(parse_active_calls("").unwrap().is_empty());
    }

    #[test]
    fn test_only_answered_calls() {
        let body = r#"{
            "row_count": 2,
            "rows": [
                {"uuid": "a-1", "cid_num": "59170000001", "dest": "59122222222",
                 "created_epoch": "1715000000", "callstate": "ACTIVE"},
                {"uuid": "b-2", "cid_num": "59170000002", "dest": "59133333333",
                 "created_epoch": "1715000100", "callstate": "RINGING"}
            ]
        }"#;
        let calls = parse_active_calls(body).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "a-1");
        assert_eq!(calls[0].answer_time.timestamp(), 1715000000);
    }

    #[test]
    fn test_answered_epoch_preferred() {
        let body = r#"{"rows": [{"uuid": "a-1", "created_epoch": "1715000000",
            "answered_epoch": "1715000007", "callstate": "active"}]}"#;
        let calls = parse_active_calls(body).unwrap();
        assert_eq!(calls[0].answer_time.timestamp(), 1715000007);
    }

    #[test]
    fn test_error_reply() {
        assert!(matches!(
            parse_active_calls("-ERR no reply"),
            Err(AppError::EslCommand(_))
        ));
    }
}
