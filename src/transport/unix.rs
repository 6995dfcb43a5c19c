//! `SOCK_SEQPACKET` Unix domain socket backend.
//!
//! Sequenced-packet sockets keep message boundaries: one `recv` returns
//! exactly one client message. Sockets are registered with the tokio reactor
//! through [`AsyncFd`], and read readiness is only cleared when a receive
//! reports `WouldBlock`, so packets already queued behind a short read are
//! still picked up.

use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time;
use tracing::{debug, trace, warn};

pub type ServerStream = SeqPacketStream;
pub type ClientStream = SeqPacketStream;

const BACKLOG: i32 = 1024;

/// Delay between connect attempts while the server's backlog is full
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Resolve a channel name to a socket path.
///
/// Bare names live in the temp directory; names containing `/` are paths.
pub fn endpoint_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        std::env::temp_dir().join(format!("{name}.sock"))
    }
}

fn seqpacket_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Remove a socket file left behind by a server that is no longer running.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    let socket = seqpacket_socket()?;
    match socket.connect(&SockAddr::unix(path)?) {
        // A full backlog still means somebody is listening.
        Ok(()) => Err(in_use(path)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(in_use(path)),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}

fn in_use(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("a server is already listening on {}", path.display()),
    )
}

/// One connected sequenced-packet socket.
///
/// Each `poll_read` returns one message (truncated to the buffer) and each
/// `poll_write` sends one message.
#[derive(Debug)]
pub struct SeqPacketStream {
    inner: AsyncFd<Socket>,
}

impl SeqPacketStream {
    /// Register a non-blocking, connected socket with the reactor.
    fn new(socket: Socket) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }
}

impl AsyncRead for SeqPacketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();

            match guard.try_io(|inner| io::Read::read(&mut inner.get_ref(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SeqPacketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().send(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}

/// Listening socket; every accepted connection is a fresh endpoint.
#[derive(Debug)]
pub struct Listener {
    inner: AsyncFd<Socket>,
    path: PathBuf,
}

impl Listener {
    /// Bind the channel. Must be called from within a tokio runtime.
    pub fn bind(name: &str) -> io::Result<Self> {
        let path = endpoint_path(name);
        remove_stale_socket(&path)?;

        let socket = seqpacket_socket()?;
        socket.bind(&SockAddr::unix(&path)?)?;
        socket.listen(BACKLOG)?;

        let inner = AsyncFd::new(socket)?;
        Ok(Self { inner, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        loop {
            let mut guard = self.inner.readable().await?;

            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((socket, _))) => {
                    socket.set_nonblocking(true)?;
                    return SeqPacketStream::new(socket);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

/// Open the client side of the channel.
///
/// Unix sockets connect immediately or fail with `WouldBlock` when the
/// backlog is full; the latter is retried without blocking the runtime.
pub async fn connect(name: &str) -> io::Result<ClientStream> {
    let address = SockAddr::unix(endpoint_path(name))?;
    let socket = seqpacket_socket()?;

    loop {
        match socket.connect(&address) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("Server backlog full, retrying connect");
                time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }

    SeqPacketStream::new(socket)
}
