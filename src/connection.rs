//! Per-connection request/response loop.
//!
//! Each accepted client gets its own [`Connection`], driven through
//! `Connected -> Serving -> Closed`. One request message is read, dispatched
//! against the shared cache, and answered with one response message before
//! the next request is read.

use crate::cache::Cache;
use crate::config::{Config, DEFAULT_MAX_MESSAGE_SIZE};
use crate::protocol::{dispatch, Response};
use crate::transport;
use bytes::BytesMut;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::{debug, error, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, not yet serving.
    Connected,
    /// Inside the request loop.
    Serving,
    /// Channel released.
    Closed,
}

/// Why a connection stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the channel.
    ClientDisconnected,
    /// No request arrived within the idle timeout.
    IdleTimeout,
    /// Request was not valid UTF-8.
    InvalidUtf8,
    /// Transport error while reading.
    ReadFailed,
    /// Transport error while writing.
    WriteFailed,
    /// Dispatch panicked; the client was sent `SERVER ERROR`.
    InternalFault,
}

/// Per-connection limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Read buffer size; longer messages are not accepted whole.
    pub max_message_size: usize,
    /// Close the connection after this long without a request.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: None,
        }
    }
}

impl From<&Config> for ConnectionOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_message_size: config.max_message_size,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Maps one request line to its response.
pub type Dispatcher = fn(&str, &Cache) -> Response;

/// A single client connection.
pub struct Connection<S, D = Dispatcher> {
    id: u64,
    stream: S,
    cache: Arc<Cache>,
    options: ConnectionOptions,
    state: ConnState,
    buffer: BytesMut,
    dispatcher: D,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection in the connected state.
    pub fn new(id: u64, stream: S, cache: Arc<Cache>, options: ConnectionOptions) -> Self {
        Connection::with_dispatcher(id, stream, cache, options, dispatch as Dispatcher)
    }
}

impl<S, D> Connection<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Fn(&str, &Cache) -> Response,
{
    /// Create a connection that answers requests with `dispatcher`.
    pub fn with_dispatcher(
        id: u64,
        stream: S,
        cache: Arc<Cache>,
        options: ConnectionOptions,
        dispatcher: D,
    ) -> Self {
        let buffer = BytesMut::with_capacity(options.max_message_size);
        Self {
            id,
            stream,
            cache,
            options,
            state: ConnState::Connected,
            buffer,
            dispatcher,
        }
    }

    #[cfg(test)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Serve requests until the client goes away, then release the channel.
    pub async fn serve(mut self) -> CloseReason {
        self.state = ConnState::Serving;
        trace!(id = self.id, "Client connected, starting communication loop");

        let reason = self.serve_loop().await;
        self.close(reason).await;
        reason
    }

    async fn serve_loop(&mut self) -> CloseReason {
        loop {
            let request = match self.read_request().await {
                Ok(request) => request,
                Err(reason) => return reason,
            };

            debug!(command = %request, "Received command");
            let response = self.execute(&request);

            if let Err(reason) = self.write_response(&response).await {
                return reason;
            }

            if let Response::ServerError(_) = response {
                return CloseReason::InternalFault;
            }
        }
    }

    /// Read one message and decode it as trimmed UTF-8 text.
    async fn read_request(&mut self) -> Result<String, CloseReason> {
        self.buffer.clear();
        self.buffer.resize(self.options.max_message_size, 0);

        let read = self.stream.read(&mut self.buffer[..]);
        let result = match self.options.idle_timeout {
            Some(limit) => time::timeout(limit, read)
                .await
                .map_err(|_| CloseReason::IdleTimeout)?,
            None => read.await,
        };

        let n = result.map_err(|e| {
            if transport::is_message_too_large(&e) {
                warn!(
                    limit = self.options.max_message_size,
                    "Request exceeds the message size limit"
                );
            } else {
                debug!(error = %e, "Read failed");
            }
            CloseReason::ReadFailed
        })?;

        if n == 0 {
            trace!("Connection closed by client");
            return Err(CloseReason::ClientDisconnected);
        }

        self.buffer.truncate(n);
        match std::str::from_utf8(&self.buffer) {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) => {
                warn!(error = %e, len = n, "Request is not valid UTF-8");
                Err(CloseReason::InvalidUtf8)
            }
        }
    }

    /// Dispatch a request, turning a panic into a `SERVER ERROR` response.
    fn execute(&self, request: &str) -> Response {
        let cache = &self.cache;
        let dispatcher = &self.dispatcher;

        match panic::catch_unwind(AssertUnwindSafe(|| dispatcher(request, cache))) {
            Ok(Response::UnknownCommand) => {
                warn!(command = %request, "Unknown command format");
                Response::UnknownCommand
            }
            Ok(response) => response,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(command = %request, error = %message, "Error processing command");
                Response::ServerError(message)
            }
        }
    }

    /// Write the response as a single message.
    async fn write_response(&mut self, response: &Response) -> Result<(), CloseReason> {
        let payload = response.to_string();
        debug!(response = %payload, "Sending response");

        let write_failed = |e: io::Error| {
            debug!(error = %e, "Write failed");
            CloseReason::WriteFailed
        };

        // An empty value still goes out as a zero-length message.
        let n = self
            .stream
            .write(payload.as_bytes())
            .await
            .map_err(write_failed)?;
        if n != payload.len() {
            return Err(write_failed(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {n} of {} bytes", payload.len()),
            )));
        }

        self.stream.flush().await.map_err(write_failed)
    }

    /// Release the channel exactly once.
    async fn close(&mut self, reason: CloseReason) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;

        match self.stream.shutdown().await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!("Peer already gone during cleanup");
            }
            Err(e) => warn!(error = %e, "Error while cleaning up connection"),
        }

        debug!(?reason, "Client disconnected");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unexpected internal error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn connection<S>(stream: S, cache: &Arc<Cache>) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Connection::new(1, stream, Arc::clone(cache), ConnectionOptions::default())
    }

    #[tokio::test]
    async fn test_session_until_disconnect() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"SET city dubai")
            .write(b"OK")
            .read(b"GET city")
            .write(b"dubai")
            .read(b"G city")
            .write(b"dubai")
            .build();

        let conn = connection(mock, &cache);
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(conn.serve().await, CloseReason::ClientDisconnected);
        assert_eq!(cache.get("city"), "dubai");
    }

    #[tokio::test]
    async fn test_errors_keep_connection_open() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"  \r\n")
            .write(b"ERROR: Empty command")
            .read(b"SET onlykey")
            .write(b"ERROR: Unknown command")
            .read(b"SET onlykey now")
            .write(b"OK")
            .build();

        assert_eq!(
            connection(mock, &cache).serve().await,
            CloseReason::ClientDisconnected
        );
        assert_eq!(cache.get("onlykey"), "now");
    }

    #[tokio::test]
    async fn test_trailing_newline_is_trimmed() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"SET greeting hello   world\n")
            .write(b"OK")
            .read(b"GET greeting\r\n")
            .write(b"hello world")
            .build();

        connection(mock, &cache).serve().await;
        assert_eq!(cache.get("greeting"), "hello world");
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"SET a 1")
            .write(b"OK")
            .read(&[0x53, 0x45, 0x54, 0x20, 0xff, 0xfe])
            .build();

        assert_eq!(
            connection(mock, &cache).serve().await,
            CloseReason::InvalidUtf8
        );
        assert_eq!(cache.get("a"), "1");
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        assert_eq!(
            connection(mock, &cache).serve().await,
            CloseReason::ReadFailed
        );
    }

    #[tokio::test]
    async fn test_write_error_closes_after_mutation() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"SET k v")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        assert_eq!(
            connection(mock, &cache).serve().await,
            CloseReason::WriteFailed
        );
        assert_eq!(cache.get("k"), "v");
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let cache = Cache::new();
        let mock = Builder::new().wait(Duration::from_secs(5)).build();
        let options = ConnectionOptions {
            idle_timeout: Some(Duration::from_millis(20)),
            ..ConnectionOptions::default()
        };

        let conn = Connection::new(7, mock, Arc::clone(&cache), options);
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.serve().await, CloseReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_dispatch_panic_answers_and_closes() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"SET a 1")
            .write(b"SERVER ERROR: boom")
            .build();

        let conn = Connection::with_dispatcher(
            3,
            mock,
            Arc::clone(&cache),
            ConnectionOptions::default(),
            |_: &str, _: &Cache| -> Response { panic!("boom") },
        );

        // Closing right after the error write means no further read was
        // attempted; a read would have hit end-of-stream instead.
        assert_eq!(conn.serve().await, CloseReason::InternalFault);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_custom_dispatcher_serves_requests() {
        let cache = Cache::new();
        let mock = Builder::new()
            .read(b"anything")
            .write(b"OK")
            .build();

        let conn = Connection::with_dispatcher(
            4,
            mock,
            Arc::clone(&cache),
            ConnectionOptions::default(),
            |line: &str, cache: &Cache| -> Response {
                cache.set("seen", line);
                Response::Ok
            },
        );

        assert_eq!(conn.serve().await, CloseReason::ClientDisconnected);
        assert_eq!(cache.get("seen"), "anything");
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = panic::catch_unwind(|| panic!("code {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 42");

        let payload = panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unexpected internal error");
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            max_message_size: 512,
            idle_timeout: Some(Duration::from_secs(3)),
            ..Config::default()
        };

        let options = ConnectionOptions::from(&config);
        assert_eq!(options.max_message_size, 512);
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(3)));
    }
}
