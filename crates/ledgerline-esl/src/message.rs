//! ESL message parsing
//!
//! Every frame FreeSWITCH sends on the socket is a block of
//! `Header: value` lines, an empty line, and an optional body whose size
//! is given by `Content-Length`.

use std::collections::HashMap;
use std::fmt;

/// One parsed ESL frame
#[derive(Debug, Clone, Default)]
pub struct EslMessage {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslMessage {
    /// Parse a header block; header values are URL-decoded
    pub fn parse_headers(raw: &str) -> Self {
        let mut headers = HashMap::new();

        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim();
                let decoded = urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string());
                headers.insert(key.trim().to_string(), decoded);
            }
        }

        Self {
            headers,
            body: None,
        }
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|s| s.parse().ok())
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.header("Reply-Text")
    }

    pub fn is_auth_request(&self) -> bool {
        self.content_type() == Some("auth/request")
    }

    /// `command/reply` or `api/response`; events and log lines are neither
    pub fn is_reply(&self) -> bool {
        matches!(
            self.content_type(),
            Some("command/reply") | Some("api/response")
        )
    }

    /// Success of a command or API call
    ///
    /// Command replies carry the verdict in `Reply-Text`, API responses in
    /// the body.
    pub fn is_ok(&self) -> bool {
        let text = match self.content_type() {
            Some("api/response") => self.body(),
            _ => self.reply_text(),
        };
        text.map(|t| t.trim_start().starts_with("+OK")).unwrap_or(false)
    }

    /// Error text of a `-ERR` reply or response
    pub fn error_message(&self) -> Option<String> {
        let text = self.reply_text().or(self.body())?.trim();
        text.strip_prefix("-ERR")
            .map(|rest| rest.trim().to_string())
    }
}

impl fmt::Display for EslMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EslMessage {{ Content-Type: {}, Headers: {}, Body: {} bytes }}",
            self.content_type().unwrap_or("-"),
            self.headers.len(),
            self.body.as_ref().map(|b| b.len()).unwrap_or(0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_request() {
        let msg = EslMessage::parse_headers("Content-Type: auth/request\n\n");
        assert!(msg.is_auth_request());
        assert!(!msg.is_reply());
    }

    #[test]
    fn test_command_reply_ok() {
        let msg = EslMessage::parse_headers("Content-Type: command/reply\nReply-Text: +OK accepted\n\n");
        assert!(msg.is_reply());
        assert!(msg.is_ok());
        assert!(msg.error_message().is_none());
    }

    #[test]
    fn test_api_response_reads_body() {
        let msg = EslMessage::parse_headers("Content-Type: api/response\nContent-Length: 24\n\n")
            .with_body("-ERR No such channel!\n".to_string());
        assert_eq!(msg.content_length(), Some(24));
        assert!(!msg.is_ok());
        assert_eq!(msg.error_message(), Some("No such channel!".to_string()));
    }

    #[test]
    fn test_url_decoding_and_crlf() {
        let msg = EslMessage::parse_headers("Caller-Destination-Number: 1234%20test\r\n\r\n");
        assert_eq!(msg.header("Caller-Destination-Number"), Some("1234 test"));
    }
}
