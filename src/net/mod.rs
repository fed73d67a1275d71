//! # Connection-Oriented Networking
//!
//! A small stack over TCP and Unix-domain sockets:
//!
//! ```text
//! ┌──────────┐   accepts    ┌──────────────┐   framed units   ┌─────────────┐
//! │  Server  │─────────────▶│  Connection  │◀────────────────▶│ application │
//! └──────────┘              └──────────────┘    callbacks     └─────────────┘
//! ┌──────────┐   connects         ▲
//! │  Client  │────────────────────┘
//! └──────────┘
//! ```
//!
//! Servers and clients own a worker loop; every user callback (receive,
//! disconnect, new-connection, connect, fail) runs on that loop. Each
//! connection holds a fresh parser minted from the configured
//! [`Framer`](crate::framing::Framer) prototype.
//!
//! Configuration is fluent and validated at start/connect time; a
//! synchronous configuration failure is reported both through the returned
//! error and through the registered fail callback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};

use crate::defaults;
use crate::framing::Framer;

pub mod client;
pub mod connection;
pub mod server;
pub(crate) mod transport;

pub use client::Client;
pub use connection::Connection;
pub use server::Server;

fn validate_common(
    protocol: &Option<Arc<dyn Framer>>,
    chunk_size: usize,
    worker_name: &str,
) -> Result<Arc<dyn Framer>> {
    ensure!(
        chunk_size > 0 && chunk_size <= u32::MAX as usize,
        "chunk size {chunk_size} is out of range"
    );
    ensure!(!worker_name.is_empty(), "worker thread name must not be empty");
    protocol
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no protocol configured"))
}

// ---------------------------------------------------------------------------
// server configuration
// ---------------------------------------------------------------------------

/// Fluent configuration for a TCP server. Obtained from
/// [`Server::configure_tcp`].
#[derive(Clone)]
pub struct TcpServerConfig {
    host: String,
    port: u16,
    reuse_address: bool,
    worker_threads: usize,
    chunk_size: usize,
    protocol: Option<Arc<dyn Framer>>,
    worker_name: String,
}

impl TcpServerConfig {
    pub(crate) fn new() -> Self {
        TcpServerConfig {
            host: defaults::HOST.to_string(),
            port: 0,
            reuse_address: true,
            worker_threads: 1,
            chunk_size: defaults::CHUNK_SIZE,
            protocol: None,
            worker_name: defaults::SERVER_WORKER_NAME.to_string(),
        }
    }

    /// Listen address. Port 0 asks the OS for an ephemeral port.
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Listen port on the default host.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The framing codec cloned per accepted connection.
    pub fn protocol(mut self, framer: impl Framer + 'static) -> Self {
        self.protocol = Some(Arc::new(framer));
        self
    }

    /// Worker threads for the server loop. Defaults to 1.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Turn `SO_REUSEADDR` off; it is on by default.
    pub fn disable_reuse_address(mut self) -> Self {
        self.reuse_address = false;
        self
    }

    /// Read chunk size per connection. Defaults to 4096.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Name for the worker thread(s).
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

/// Fluent configuration for a Unix-domain server. Obtained from
/// [`Server::configure_unix`].
#[derive(Clone)]
pub struct UnixServerConfig {
    path: Option<PathBuf>,
    unlink_on_stop: bool,
    worker_threads: usize,
    chunk_size: usize,
    protocol: Option<Arc<dyn Framer>>,
    worker_name: String,
}

impl UnixServerConfig {
    pub(crate) fn new() -> Self {
        UnixServerConfig {
            path: None,
            unlink_on_stop: true,
            worker_threads: 1,
            chunk_size: defaults::CHUNK_SIZE,
            protocol: None,
            worker_name: defaults::SERVER_WORKER_NAME.to_string(),
        }
    }

    /// Bind to an explicit filesystem path.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Generate a process-unique socket path under `dir`. Any stale file at
    /// the generated path is removed before bind, and the file is unlinked
    /// on shutdown unless [`keep_socket_file_on_stop`] says otherwise.
    ///
    /// [`keep_socket_file_on_stop`]: Self::keep_socket_file_on_stop
    pub fn preserve_socket_file(mut self, dir: impl Into<PathBuf>) -> Self {
        let file = format!("keel-{}.sock", uuid::Uuid::new_v4());
        self.path = Some(dir.into().join(file));
        self
    }

    /// Leave the socket file in place when the server stops.
    pub fn keep_socket_file_on_stop(mut self) -> Self {
        self.unlink_on_stop = false;
        self
    }

    /// The path this configuration will bind to, once set.
    pub fn current_socket_path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// The framing codec cloned per accepted connection.
    pub fn protocol(mut self, framer: impl Framer + 'static) -> Self {
        self.protocol = Some(Arc::new(framer));
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

pub(crate) enum ServerKind {
    Tcp {
        host: String,
        port: u16,
        reuse_address: bool,
    },
    Unix {
        path: PathBuf,
        unlink_on_stop: bool,
    },
}

/// Normalized server configuration, produced from either fluent config.
pub struct ServerBinding {
    pub(crate) kind: ServerKind,
    pub(crate) protocol: Option<Arc<dyn Framer>>,
    pub(crate) worker_threads: usize,
    pub(crate) chunk_size: usize,
    pub(crate) worker_name: String,
}

impl ServerBinding {
    pub(crate) fn validate(&self) -> Result<Arc<dyn Framer>> {
        ensure!(self.worker_threads > 0, "at least one worker thread is required");
        if let ServerKind::Tcp { host, .. } = &self.kind {
            // Port 0 is allowed here: the OS assigns an ephemeral port and
            // `local_endpoint` reports it.
            ensure!(!host.is_empty(), "listen host must not be empty");
        }
        validate_common(&self.protocol, self.chunk_size, &self.worker_name)
    }
}

impl From<TcpServerConfig> for ServerBinding {
    fn from(config: TcpServerConfig) -> Self {
        ServerBinding {
            kind: ServerKind::Tcp {
                host: config.host,
                port: config.port,
                reuse_address: config.reuse_address,
            },
            protocol: config.protocol,
            worker_threads: config.worker_threads,
            chunk_size: config.chunk_size,
            worker_name: config.worker_name,
        }
    }
}

impl From<UnixServerConfig> for ServerBinding {
    fn from(config: UnixServerConfig) -> Self {
        ServerBinding {
            kind: ServerKind::Unix {
                path: config.path.unwrap_or_default(),
                unlink_on_stop: config.unlink_on_stop,
            },
            protocol: config.protocol,
            worker_threads: config.worker_threads,
            chunk_size: config.chunk_size,
            worker_name: config.worker_name,
        }
    }
}

// ---------------------------------------------------------------------------
// client configuration
// ---------------------------------------------------------------------------

/// Fluent configuration for a TCP client. Obtained from
/// [`Client::configure_tcp`].
#[derive(Clone)]
pub struct TcpClientConfig {
    host: String,
    port: u16,
    timeout_connect_ms: u64,
    chunk_size: usize,
    protocol: Option<Arc<dyn Framer>>,
    worker_name: String,
}

impl TcpClientConfig {
    pub(crate) fn new() -> Self {
        TcpClientConfig {
            host: defaults::HOST.to_string(),
            port: 0,
            timeout_connect_ms: 0,
            chunk_size: defaults::CHUNK_SIZE,
            protocol: None,
            worker_name: defaults::CLIENT_WORKER_NAME.to_string(),
        }
    }

    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Abort the connect attempt after `timeout`. Without this the platform
    /// default applies.
    ///
    /// # Panics
    ///
    /// Panics on a sub-millisecond timeout; one millisecond is the minimum
    /// waiting accuracy.
    pub fn timeout_connect(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        assert!(ms > 0, "1 millisecond is minimum waiting accuracy");
        self.timeout_connect_ms = ms;
        self
    }

    pub fn protocol(mut self, framer: impl Framer + 'static) -> Self {
        self.protocol = Some(Arc::new(framer));
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

/// Fluent configuration for a Unix-domain client. Obtained from
/// [`Client::configure_unix`].
#[derive(Clone)]
pub struct UnixClientConfig {
    path: Option<PathBuf>,
    chunk_size: usize,
    protocol: Option<Arc<dyn Framer>>,
    worker_name: String,
}

impl UnixClientConfig {
    pub(crate) fn new() -> Self {
        UnixClientConfig {
            path: None,
            chunk_size: defaults::CHUNK_SIZE,
            protocol: None,
            worker_name: defaults::CLIENT_WORKER_NAME.to_string(),
        }
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn protocol(mut self, framer: impl Framer + 'static) -> Self {
        self.protocol = Some(Arc::new(framer));
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

pub(crate) enum ClientKind {
    Tcp {
        host: String,
        port: u16,
        timeout_ms: u64,
    },
    Unix {
        path: PathBuf,
    },
}

/// Normalized client configuration, produced from either fluent config.
pub struct ClientBinding {
    pub(crate) kind: ClientKind,
    pub(crate) protocol: Option<Arc<dyn Framer>>,
    pub(crate) chunk_size: usize,
    pub(crate) worker_name: String,
}

impl ClientBinding {
    pub(crate) fn validate(&self) -> Result<Arc<dyn Framer>> {
        match &self.kind {
            ClientKind::Tcp { host, port, .. } => {
                ensure!(*port > 0, "port 0 is not a connect address");
                ensure!(!host.is_empty(), "connect host must not be empty");
            }
            ClientKind::Unix { path } => {
                ensure!(
                    !path.as_os_str().is_empty(),
                    "a socket path is required to connect"
                );
            }
        }
        validate_common(&self.protocol, self.chunk_size, &self.worker_name)
    }
}

impl From<TcpClientConfig> for ClientBinding {
    fn from(config: TcpClientConfig) -> Self {
        ClientBinding {
            kind: ClientKind::Tcp {
                host: config.host,
                port: config.port,
                timeout_ms: config.timeout_connect_ms,
            },
            protocol: config.protocol,
            chunk_size: config.chunk_size,
            worker_name: config.worker_name,
        }
    }
}

impl From<UnixClientConfig> for ClientBinding {
    fn from(config: UnixClientConfig) -> Self {
        ClientBinding {
            kind: ClientKind::Unix {
                path: config.path.unwrap_or_default(),
            },
            protocol: config.protocol,
            chunk_size: config.chunk_size,
            worker_name: config.worker_name,
        }
    }
}
