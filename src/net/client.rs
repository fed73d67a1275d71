//! # Client
//!
//! Establishes one outbound connection and owns it. Connect resolves and
//! dials on the client's worker loop; success surfaces through `on_connect`
//! with the new [`Connection`], asynchronous failure (including the connect
//! timeout) through `on_fail`. The client exposes no disconnect event of its
//! own (subscribe on the connection), but it clears its slot when the
//! connection goes away, after the user's disconnect handlers have run.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::event_loop::EventLoop;
use crate::net::connection::Connection;
use crate::net::transport;
use crate::net::{ClientBinding, ClientKind, TcpClientConfig, UnixClientConfig};
use crate::observer::Subscription;

type ConnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type FailCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ConnectionSlot {
    connection: Arc<Connection>,
    _removal: Subscription,
}

struct ClientShared {
    connection: Mutex<Option<ConnectionSlot>>,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_fail: Mutex<Option<FailCallback>>,
}

/// An async unit client. See the module docs.
pub struct Client {
    shared: Arc<ClientShared>,
    worker: Option<EventLoop>,
}

impl Client {
    pub fn new() -> Self {
        Client {
            shared: Arc::new(ClientShared {
                connection: Mutex::new(None),
                on_connect: Mutex::new(None),
                on_fail: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// A TCP client configuration to refine.
    pub fn configure_tcp() -> TcpClientConfig {
        TcpClientConfig::new()
    }

    /// A Unix-domain client configuration to refine.
    pub fn configure_unix() -> UnixClientConfig {
        UnixClientConfig::new()
    }

    /// Invoke `callback` on the worker loop when the connection is
    /// established.
    pub fn on_connect(&self, callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> &Self {
        *self.shared.on_connect.lock() = Some(Arc::new(callback));
        self
    }

    /// Invoke `callback` when connecting fails, synchronously or not, with
    /// a human-readable reason.
    pub fn on_fail(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        *self.shared.on_fail.lock() = Some(Arc::new(callback));
        self
    }

    /// Starts connecting. Returns `Ok(true)` when the attempt is under way,
    /// `Ok(false)` when it was aborted synchronously (the client already
    /// owns a connection, or its worker loop could not start). An invalid
    /// configuration is an error, reported through the return value and
    /// `on_fail` alike; asynchronous failure, including the connect
    /// timeout, goes through `on_fail` only.
    pub fn connect(&mut self, config: impl Into<ClientBinding>) -> Result<bool> {
        let binding = config.into();
        let protocol = match binding.validate() {
            Ok(protocol) => protocol,
            Err(err) => {
                warn!(reason = %err, "client configuration rejected");
                if let Some(callback) = self.shared.on_fail.lock().clone() {
                    callback(&err.to_string());
                }
                return Err(err);
            }
        };
        if self.shared.connection.lock().is_some() {
            warn!("connect refused: client already owns a connection");
            return Ok(false);
        }

        // The worker loop survives reconnects.
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => EventLoop::named(&binding.worker_name),
        };
        if let Err(err) = worker.start() {
            warn!(reason = %err, "connect aborted: worker loop failed to start");
            if let Some(callback) = self.shared.on_fail.lock().clone() {
                callback(&err.to_string());
            }
            return Ok(false);
        }
        let handle = worker.handle();
        self.worker = Some(worker);

        let shared = self.shared.clone();
        let chunk_size = binding.chunk_size;
        let task_handle = handle.clone();
        handle.spawn(async move {
            let dialed = match &binding.kind {
                ClientKind::Tcp {
                    host,
                    port,
                    timeout_ms,
                } => transport::connect_tcp(host, *port, *timeout_ms).await,
                ClientKind::Unix { path } => transport::connect_unix(path).await,
            };
            match dialed {
                Ok(stream) => {
                    let connection =
                        Connection::spawn(stream, protocol, chunk_size, task_handle);
                    // Registered before the user sees the connection, so the
                    // slot clears after their disconnect handlers.
                    let removal = {
                        let shared = shared.clone();
                        connection.on_disconnect(move |id| {
                            debug!(id, "client connection slot cleared");
                            shared.connection.lock().take();
                        })
                    };
                    *shared.connection.lock() = Some(ConnectionSlot {
                        connection: connection.clone(),
                        _removal: removal,
                    });
                    info!(
                        id = connection.id(),
                        remote = connection.remote_endpoint(),
                        "client connected"
                    );
                    if let Some(callback) = shared.on_connect.lock().clone() {
                        callback(&connection);
                    }
                }
                Err(err) => {
                    warn!(reason = %err, "connect failed");
                    if let Some(callback) = shared.on_fail.lock().clone() {
                        callback(&err.to_string());
                    }
                }
            }
        });
        Ok(true)
    }

    /// The owned connection, while one exists.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map(|slot| slot.connection.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connection().map_or(false, |c| c.is_connected())
    }

    /// Runs `task` on the client's worker loop, the thread the receive
    /// callbacks dispatch on, which spares callers their own locking.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match &self.worker {
            Some(worker) => worker.post(task),
            None => false,
        }
    }

    /// Drops the current connection, if any.
    pub fn disconnect(&self) {
        let connection = self
            .shared
            .connection
            .lock()
            .as_ref()
            .map(|slot| slot.connection.clone());
        if let Some(connection) = connection {
            connection.disconnect();
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}
