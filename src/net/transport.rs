//! Socket primitives under the connection layer.
//!
//! Bind and listen happen synchronously with `socket2` so configuration
//! errors surface before any task is spawned; the resulting std sockets are
//! converted to tokio types inside the owning loop's runtime. Accepted and
//! connected TCP sockets get `TCP_NODELAY`.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::SeqCst};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp, unix, TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

/// One established endpoint, TCP or Unix-domain.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub(crate) fn remote_endpoint(&self) -> String {
        match self {
            Stream::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            Stream::Unix(stream) => {
                let path = stream
                    .peer_addr()
                    .ok()
                    .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()));
                match path {
                    Some(path) => format!("unix:{path}"),
                    None => "unix:<unnamed>".to_string(),
                }
            }
        }
    }

    pub(crate) fn apply_low_latency_options(&self) {
        if let Stream::Tcp(stream) = self {
            if let Err(err) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY: {err}");
            }
        }
    }

    pub(crate) fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Stream::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Tcp(read), WriteHalf::Tcp(write))
            }
            Stream::Unix(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Unix(read), WriteHalf::Unix(write))
            }
        }
    }
}

pub(crate) enum ReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

impl ReadHalf {
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Tcp(half) => half.read(buf).await,
            ReadHalf::Unix(half) => half.read(buf).await,
        }
    }
}

pub(crate) enum WriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl WriteHalf {
    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            WriteHalf::Tcp(half) => half.write_all(bytes).await,
            WriteHalf::Unix(half) => half.write_all(bytes).await,
        }
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Tcp(half) => half.shutdown().await,
            WriteHalf::Unix(half) => half.shutdown().await,
        }
    }
}

/// A bound-but-unregistered acceptor, produced synchronously. Converted to
/// the tokio flavour inside the owning loop.
pub(crate) enum StdAcceptor {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl StdAcceptor {
    /// Registers the listener with the current runtime. Must be called from
    /// within the owning loop.
    pub(crate) fn into_tokio(self) -> io::Result<Acceptor> {
        match self {
            StdAcceptor::Tcp(listener) => Ok(Acceptor::Tcp(TcpListener::from_std(listener)?)),
            StdAcceptor::Unix(listener) => Ok(Acceptor::Unix(UnixListener::from_std(listener)?)),
        }
    }
}

pub(crate) enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Acceptor {
    pub(crate) async fn accept(&self) -> io::Result<Stream> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Stream::Tcp(stream))
            }
            Acceptor::Unix(listener) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("{host}:{port} resolved to no addresses"))
}

/// Resolve, bind and listen synchronously. Reports the actual bound address
/// so callers can ask for an ephemeral port.
pub(crate) fn bind_tcp(
    host: &str,
    port: u16,
    reuse_address: bool,
) -> Result<(StdAcceptor, SocketAddr)> {
    let addr = resolve(host, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("creating listen socket")?;
    socket
        .set_reuse_address(reuse_address)
        .context("setting SO_REUSEADDR")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding {addr}"))?;
    socket.listen(1024).context("listening")?;
    socket.set_nonblocking(true)?;

    let listener: std::net::TcpListener = socket.into();
    let local = listener.local_addr()?;
    debug!(%local, "tcp acceptor bound");
    Ok((StdAcceptor::Tcp(listener), local))
}

/// Binds a Unix-domain listener, removing a stale socket file first.
pub(crate) fn bind_unix(path: &Path) -> Result<StdAcceptor> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket file {}", path.display()))?;
    }
    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("binding {}", path.display()))?;
    listener.set_nonblocking(true)?;
    debug!(path = %path.display(), "unix acceptor bound");
    Ok(StdAcceptor::Unix(listener))
}

/// Connects over TCP, force-failing after `timeout_ms` when non-zero
/// (zero means the platform default applies).
pub(crate) async fn connect_tcp(host: &str, port: u16, timeout_ms: u64) -> Result<Stream> {
    let connect = TcpStream::connect((host, port));
    let stream = if timeout_ms > 0 {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), connect).await {
            Ok(connected) => connected,
            Err(_) => bail!("connect to {host}:{port} timed out after {timeout_ms} ms"),
        }
    } else {
        connect.await
    }
    .with_context(|| format!("connecting to {host}:{port}"))?;
    Ok(Stream::Tcp(stream))
}

pub(crate) async fn connect_unix(path: &PathBuf) -> Result<Stream> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connecting to {}", path.display()))?;
    Ok(Stream::Unix(stream))
}

/// A counted gate for async continuations.
///
/// Completion dispatches take a [`ScopeLock`] for the duration of their
/// callbacks; tearing a connection down raises the stop bit, refusing every
/// future continuation, and then waits for in-flight ones to exit before
/// the socket story ends. Holding a lock across an await point is not
/// allowed.
pub(crate) struct ScopeRunner {
    refused: AtomicBool,
    inflight: AtomicI64,
}

pub(crate) struct ScopeLock<'a> {
    inflight: &'a AtomicI64,
}

impl Drop for ScopeLock<'_> {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, SeqCst);
    }
}

impl ScopeRunner {
    pub(crate) fn new() -> Self {
        ScopeRunner {
            refused: AtomicBool::new(false),
            inflight: AtomicI64::new(0),
        }
    }

    /// Returns `None` once the stop bit is up, a lock otherwise.
    pub(crate) fn continue_lock(&self) -> Option<ScopeLock<'_>> {
        if self.refused.load(SeqCst) {
            return None;
        }
        self.inflight.fetch_add(1, SeqCst);
        if self.refused.load(SeqCst) {
            // Lost the race against begin_stop; back out.
            self.inflight.fetch_sub(1, SeqCst);
            return None;
        }
        Some(ScopeLock {
            inflight: &self.inflight,
        })
    }

    /// Refuses all future continuations. Does not wait.
    pub(crate) fn begin_stop(&self) {
        self.refused.store(true, SeqCst);
    }

    /// Spins until in-flight continuations have exited. Callbacks are short
    /// and never hold the lock across awaits, so the wait is bounded.
    pub(crate) fn wait_drained(&self) {
        while self.inflight.load(SeqCst) > 0 {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_runner_refuses_after_stop() {
        let gate = ScopeRunner::new();
        {
            let lock = gate.continue_lock();
            assert!(lock.is_some());
        }
        gate.begin_stop();
        assert!(gate.continue_lock().is_none());
        gate.wait_drained();
    }

    #[test]
    fn scope_runner_drains_inflight_locks() {
        let gate = ScopeRunner::new();
        let lock = gate.continue_lock().unwrap();
        gate.begin_stop();
        assert!(gate.continue_lock().is_none());
        drop(lock);
        gate.wait_drained();
    }

    #[test]
    fn bind_tcp_reports_ephemeral_port() {
        let (_acceptor, local) = bind_tcp("127.0.0.1", 0, true).unwrap();
        assert!(local.port() > 0);
    }

    #[test]
    fn bind_unix_removes_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"stale").unwrap();
        let _acceptor = bind_unix(&path).unwrap();
        // The stale regular file was replaced by a socket.
        assert!(path.exists());
    }
}
