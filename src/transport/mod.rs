//! Platform channel primitive.
//!
//! A named, bidirectional, message-framed local channel:
//! - Windows: named pipe `\\.\pipe\<name>` in message mode
//! - Unix: `SOCK_SEQPACKET` Unix domain socket
//!
//! Both backends expose the same surface:
//! - `Listener::bind(name)` creates the endpoint factory
//! - `Listener::accept()` waits for the next client
//! - `connect(name)` opens the client side
//!
//! Every read returns exactly one message and every write sends one.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{connect, endpoint_path, ClientStream, Listener, SeqPacketStream, ServerStream};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{connect, endpoint_path, ClientStream, Listener, ServerStream};

/// How the acceptor recovers from an endpoint error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Create a fresh endpoint right away
    Immediate,
    /// Wait for the configured backoff first
    Backoff,
}

/// Windows `ERROR_BROKEN_PIPE`
const ERROR_BROKEN_PIPE: i32 = 109;
/// Windows `ERROR_PIPE_BUSY`
pub(crate) const ERROR_PIPE_BUSY: i32 = 231;
/// Windows `ERROR_NO_DATA`
const ERROR_NO_DATA: i32 = 232;
/// Windows `ERROR_MORE_DATA`
const ERROR_MORE_DATA: i32 = 234;

/// Classify an error raised while creating an endpoint or waiting for a client.
pub fn classify(err: &io::Error) -> Recovery {
    if cfg!(windows) {
        match err.raw_os_error() {
            Some(ERROR_PIPE_BUSY) => return Recovery::Backoff,
            Some(ERROR_BROKEN_PIPE) | Some(ERROR_NO_DATA) => return Recovery::Immediate,
            _ => {}
        }
    }

    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => Recovery::Immediate,
        _ => Recovery::Backoff,
    }
}

/// Whether a client-side open failed because nobody is listening.
pub fn is_server_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// Whether a read failed because the message did not fit the buffer.
///
/// Only message-mode pipes report this; a `SOCK_SEQPACKET` socket silently
/// truncates the packet instead.
pub fn is_message_too_large(err: &io::Error) -> bool {
    cfg!(windows) && err.raw_os_error() == Some(ERROR_MORE_DATA)
}
