//! Inbound ESL connection
//!
//! A single authenticated socket used for `api` commands only; no event
//! subscription is made, so every frame read after a command is its
//! reply (log or disconnect notices are skipped).

use ledgerline_core::{config::FreeSwitchConfig, AppError, AppResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::message::EslMessage;

pub struct EslConnection {
    reader: BufReader<TcpStream>,
    server_id: String,
    command_timeout: Duration,
}

impl EslConnection {
    /// Connect and authenticate, each step bounded by the command timeout
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub async fn connect(config: &FreeSwitchConfig) -> AppResult<Self> {
        let server_id = format!("{}:{}", config.host, config.port);
        let command_timeout = config.command_timeout();
        info!("Connecting to FreeSWITCH ESL: {}", server_id);

        let stream = timeout(command_timeout, TcpStream::connect(&server_id))
            .await
            .map_err(|_| AppError::Timeout(format!("connecting to {}", server_id)))?
            .map_err(|e| AppError::EslConnection(format!("{}: {}", server_id, e)))?;

        let mut conn = Self {
            reader: BufReader::new(stream),
            server_id,
            command_timeout,
        };

        let greeting = conn.read_message().await?;
        if !greeting.is_auth_request() {
            return Err(AppError::EslConnection(format!(
                "unexpected greeting from {}: {}",
                conn.server_id, greeting
            )));
        }

        let reply = conn.send(&format!("auth {}", config.password)).await?;
        if !reply.is_ok() {
            return Err(AppError::EslConnection(format!(
                "authentication rejected by {}",
                conn.server_id
            )));
        }

        info!("Authenticated to FreeSWITCH: {}", conn.server_id);
        Ok(conn)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Run `api <command>` and return the response frame
    #[instrument(skip(self), fields(server = %self.server_id))]
    pub async fn api(&mut self, command: &str) -> AppResult<EslMessage> {
        let reply = self.send(&format!("api {}", command)).await?;
        debug!("api {} -> {}", command, reply);
        Ok(reply)
    }

    async fn send(&mut self, command: &str) -> AppResult<EslMessage> {
        let limit = self.command_timeout;
        let server_id = self.server_id.clone();
        let verb = command.split_whitespace().next().unwrap_or_default().to_string();

        timeout(limit, self.exchange(command))
            .await
            .map_err(|_| AppError::Timeout(format!("{} on {}", verb, server_id)))?
    }

    async fn exchange(&mut self, command: &str) -> AppResult<EslMessage> {
        self.write_command(command).await?;
        loop {
            let message = self.read_message().await?;
            if message.is_reply() {
                return Ok(message);
            }
            debug!("Skipping {} while waiting for reply", message);
        }
    }

    async fn write_command(&mut self, command: &str) -> AppResult<()> {
        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{}\n\n", command).as_bytes())
            .await
            .map_err(|e| AppError::EslCommand(format!("write failed: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| AppError::EslCommand(format!("flush failed: {}", e)))?;
        Ok(())
    }

    async fn read_message(&mut self) -> AppResult<EslMessage> {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| AppError::EslConnection(format!("read failed: {}", e)))?;
            if read == 0 {
                warn!("FreeSWITCH {} closed the socket", self.server_id);
                return Err(AppError::EslConnection(format!(
                    "{} closed the connection",
                    self.server_id
                )));
            }
            let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
            if trimmed.is_empty() {
                if head.is_empty() {
                    // Stray separator between frames
                    continue;
                }
                break;
            }
            head.push_str(trimmed);
            head.push('\n');
        }

        let message = EslMessage::parse_headers(&head);
        match message.content_length() {
            Some(len) if len > 0 => {
                let mut body = vec![0u8; len];
                self.reader
                    .read_exact(&mut body)
                    .await
                    .map_err(|e| AppError::EslConnection(format!("short body: {}", e)))?;
                Ok(message.with_body(String::from_utf8_lossy(&body).into_owned()))
            }
            _ => Ok(message),
        }
    }
}
