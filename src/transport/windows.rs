//! Windows named pipe backend.
//!
//! Pipes are created in message mode, so reads and writes carry whole
//! messages. A new server instance is created right after each client
//! connects, keeping one instance available for the next client.
//!
//! A message longer than the read buffer fails the read with
//! `ERROR_MORE_DATA`. The handler does not stitch the remainder onto a
//! partial command; it logs the oversized request and closes the connection.
//! Clients refuse to send commands over the limit, so only foreign clients
//! reach this path.

use super::ERROR_PIPE_BUSY;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, PipeMode, ServerOptions,
};
use tokio::time;
use tracing::warn;

pub type ServerStream = NamedPipeServer;
pub type ClientStream = NamedPipeClient;

/// In/out buffer size for each pipe instance
const BUFFER_SIZE: u32 = 4096;

/// Client retries while every instance is busy
const BUSY_RETRIES: u32 = 5;
const BUSY_DELAY: Duration = Duration::from_millis(50);

/// Resolve a channel name to a pipe path.
pub fn endpoint_path(name: &str) -> PathBuf {
    if name.starts_with(r"\\") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }
}

fn create_instance(path: &Path, first: bool) -> io::Result<NamedPipeServer> {
    // Instance count is left unlimited.
    ServerOptions::new()
        .first_pipe_instance(first)
        .access_inbound(true)
        .access_outbound(true)
        .pipe_mode(PipeMode::Message)
        .in_buffer_size(BUFFER_SIZE)
        .out_buffer_size(BUFFER_SIZE)
        .reject_remote_clients(true)
        .create(path)
}

/// Pipe instance factory holding the instance the next client will reach.
#[derive(Debug)]
pub struct Listener {
    path: PathBuf,
    pending: Option<NamedPipeServer>,
}

impl Listener {
    /// Create the first pipe instance. Fails if another server owns the name.
    pub fn bind(name: &str) -> io::Result<Self> {
        let path = endpoint_path(name);
        let first = create_instance(&path, true)?;
        Ok(Self {
            path,
            pending: Some(first),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for a client on the pending instance.
    ///
    /// A failed instance is discarded; the next call creates a fresh one.
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let server = match self.pending.take() {
            Some(server) => server,
            None => create_instance(&self.path, false)?,
        };

        server.connect().await?;

        match create_instance(&self.path, false) {
            Ok(next) => self.pending = Some(next),
            Err(e) => warn!(error = %e, "Failed to prepare next pipe instance"),
        }

        Ok(server)
    }
}

/// Open the client side of the channel.
pub async fn connect(name: &str) -> io::Result<ClientStream> {
    let path = endpoint_path(name);
    let mut attempts = 0;

    loop {
        match ClientOptions::new().pipe_mode(PipeMode::Message).open(&path) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < BUSY_RETRIES => {
                attempts += 1;
            }
            Err(e) => return Err(e),
        }

        time::sleep(BUSY_DELAY).await;
    }
}
