//! Client side of the channel.
//!
//! A [`Client`] keeps one connection open for any number of requests;
//! [`send_command`] opens, sends one request, reads one response, and closes.

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transport::{self, ClientStream};
use bytes::BytesMut;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Cache server not running")]
    ServerNotRunning,
    #[error("command of {size} bytes exceeds the {limit}-byte message limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("response is not valid UTF-8: {0}")]
    InvalidResponse(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Open connection to the cache server
pub struct Client {
    stream: ClientStream,
    buffer: BytesMut,
    max_message_size: usize,
}

impl Client {
    /// Connect to the server listening on `name`.
    pub async fn connect(name: &str) -> Result<Self, ClientError> {
        let stream = match transport::connect(name).await {
            Ok(stream) => stream,
            Err(e) if transport::is_server_absent(&e) => {
                debug!(name, error = %e, "No server listening");
                return Err(ClientError::ServerNotRunning);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(DEFAULT_MAX_MESSAGE_SIZE),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Send one command and wait for its response.
    pub async fn request(&mut self, command: &str) -> Result<String, ClientError> {
        // Zero-length messages are indistinguishable from a hang-up, so an
        // empty command travels as a bare newline.
        let payload = if command.is_empty() { "\n" } else { command };
        if payload.len() > self.max_message_size {
            return Err(ClientError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_message_size,
            });
        }

        let n = self.stream.write(payload.as_bytes()).await?;
        if n != payload.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "request was not sent whole").into());
        }
        self.stream.flush().await?;

        self.buffer.clear();
        self.buffer.resize(self.max_message_size, 0);
        let n = self.stream.read(&mut self.buffer[..]).await?;

        // A zero-length reply is an empty value.
        Ok(std::str::from_utf8(&self.buffer[..n])?.to_string())
    }
}

/// Connect, send a single command, read the response, and close.
pub async fn send_command(name: &str, command: &str) -> Result<String, ClientError> {
    let mut client = Client::connect(name).await?;
    let response = client.request(command).await?;
    debug!(command, response = %response, "Command completed");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ClientError::ServerNotRunning.to_string(),
            "Cache server not running"
        );
        assert_eq!(
            ClientError::MessageTooLarge {
                size: 5000,
                limit: 4096
            }
            .to_string(),
            "command of 5000 bytes exceeds the 4096-byte message limit"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_server() {
        let name = std::env::temp_dir()
            .join(format!("pipe-cache-client-absent-{}.sock", std::process::id()))
            .display()
            .to_string();

        match send_command(&name, "GET city").await {
            Err(ClientError::ServerNotRunning) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
