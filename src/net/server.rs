//! # Server
//!
//! Accepts inbound connections, owns their lifetimes, and fans events out to
//! the application. The sequence on `start`: resolve → bind → listen →
//! register the accept task → invoke `on_start` on the worker loop. Bind and
//! listen failures are synchronous, reported through the returned error and
//! the `on_fail` callback; asynchronous accept failures also route to
//! `on_fail` but leave the server running unless the acceptor itself died.
//! An accept error on a dead listener descriptor, or an unbroken streak of
//! accept failures, releases the acceptor and marks the server not running.
//!
//! Every accepted endpoint becomes a [`Connection`] with a fresh parser
//! cloned off the configured protocol, registered in the `id -> Connection`
//! map. The removal hook is wired before the connection is published, so on
//! disconnect the user's handlers run first and the map entry goes last.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::event_loop::{EventLoop, LoopHandle, MtEventLoop};
use crate::framing::Framer;
use crate::net::connection::Connection;
use crate::net::transport::{self, StdAcceptor};
use crate::net::{ServerBinding, ServerKind, TcpServerConfig, UnixServerConfig};
use crate::observer::Subscription;

/// Worker loop in either width, chosen by `worker_threads`.
enum WorkerLoop {
    Single(EventLoop),
    Multi(MtEventLoop),
}

impl WorkerLoop {
    fn build(threads: usize, name: &str) -> Self {
        if threads > 1 {
            let worker = MtEventLoop::new(threads);
            worker.change_thread_name(name);
            WorkerLoop::Multi(worker)
        } else {
            WorkerLoop::Single(EventLoop::named(name))
        }
    }

    fn start(&mut self) -> Result<()> {
        match self {
            WorkerLoop::Single(worker) => worker.start(),
            WorkerLoop::Multi(worker) => worker.start(),
        }
    }

    fn stop(&mut self) {
        match self {
            WorkerLoop::Single(worker) => worker.stop(),
            WorkerLoop::Multi(worker) => worker.stop(),
        }
    }

    fn handle(&self) -> LoopHandle {
        match self {
            WorkerLoop::Single(worker) => worker.handle(),
            WorkerLoop::Multi(worker) => worker.handle(),
        }
    }
}

struct ConnectionEntry {
    connection: Arc<Connection>,
    _removal: Subscription,
}

/// Tracks accept failures and decides when the acceptor is beyond
/// recovery: either a fatal error on the listener descriptor itself, or an
/// unbroken streak of failures with no successful accept in between.
struct AcceptorHealth {
    consecutive_failures: u32,
}

impl AcceptorHealth {
    const MAX_CONSECUTIVE_FAILURES: u32 = 16;

    fn new() -> Self {
        AcceptorHealth {
            consecutive_failures: 0,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns `true` when the acceptor cannot recover and must be
    /// released.
    fn record_failure(&mut self, err: &io::Error) -> bool {
        self.consecutive_failures += 1;
        Self::is_fatal(err) || self.consecutive_failures >= Self::MAX_CONSECUTIVE_FAILURES
    }

    /// Errors that mean the listener descriptor itself is gone; retrying
    /// the same accept can never succeed. Per-connection failures like
    /// ECONNABORTED, and resource pressure like EMFILE, are transient.
    fn is_fatal(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK)
        )
    }
}

type StartCallback = Box<dyn FnOnce() + Send>;
type NewConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type FailCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ServerShared {
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    running: AtomicBool,
    stopping: AtomicBool,
    local_endpoint: Mutex<Option<String>>,
    started: (Mutex<bool>, Condvar),
    on_start: Mutex<Option<StartCallback>>,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
    on_fail: Mutex<Option<FailCallback>>,
}

impl ServerShared {
    fn fail(&self, reason: &str) {
        warn!(reason, "server failure");
        if let Some(callback) = self.on_fail.lock().clone() {
            callback(reason);
        }
    }
}

/// An async unit server. See the module docs.
pub struct Server {
    shared: Arc<ServerShared>,
    worker: Option<WorkerLoop>,
    stop_tx: Option<watch::Sender<bool>>,
    unlink_on_stop: Option<PathBuf>,
}

impl Server {
    pub fn new() -> Self {
        Server {
            shared: Arc::new(ServerShared {
                connections: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                local_endpoint: Mutex::new(None),
                started: (Mutex::new(false), Condvar::new()),
                on_start: Mutex::new(None),
                on_new_connection: Mutex::new(None),
                on_fail: Mutex::new(None),
            }),
            worker: None,
            stop_tx: None,
            unlink_on_stop: None,
        }
    }

    /// A TCP server configuration to refine.
    pub fn configure_tcp() -> TcpServerConfig {
        TcpServerConfig::new()
    }

    /// A Unix-domain server configuration to refine.
    pub fn configure_unix() -> UnixServerConfig {
        UnixServerConfig::new()
    }

    /// Invoke `callback` on the worker loop once the server accepts
    /// requests. Consumed by the next `start`.
    pub fn on_start(&self, callback: impl FnOnce() + Send + 'static) -> &Self {
        *self.shared.on_start.lock() = Some(Box::new(callback));
        self
    }

    /// Invoke `callback` on the worker loop for every accepted connection.
    pub fn on_new_connection(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> &Self {
        *self.shared.on_new_connection.lock() = Some(Arc::new(callback));
        self
    }

    /// Invoke `callback` for start failures and asynchronous accept
    /// failures, with a human-readable reason.
    pub fn on_fail(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        *self.shared.on_fail.lock() = Some(Arc::new(callback));
        self
    }

    /// Starts the server with a TCP or Unix-domain configuration.
    pub fn start(&mut self, config: impl Into<ServerBinding>) -> Result<()> {
        let binding = config.into();
        if self.worker.is_some() {
            // Covers both a running server and one whose acceptor died;
            // stop() is the cleanup path either way.
            bail!("server is already started; stop it first");
        }

        let protocol = match binding.validate() {
            Ok(protocol) => protocol,
            Err(err) => {
                self.shared.fail(&err.to_string());
                return Err(err);
            }
        };

        let (acceptor, endpoint, unlink_on_stop) = match &binding.kind {
            ServerKind::Tcp {
                host,
                port,
                reuse_address,
            } => match transport::bind_tcp(host, *port, *reuse_address) {
                Ok((acceptor, local)) => (acceptor, local.to_string(), None),
                Err(err) => {
                    self.shared.fail(&err.to_string());
                    return Err(err);
                }
            },
            ServerKind::Unix {
                path,
                unlink_on_stop,
            } => match transport::bind_unix(path) {
                Ok(acceptor) => (
                    acceptor,
                    format!("unix:{}", path.display()),
                    unlink_on_stop.then(|| path.clone()),
                ),
                Err(err) => {
                    self.shared.fail(&err.to_string());
                    return Err(err);
                }
            },
        };

        let mut worker = WorkerLoop::build(binding.worker_threads, &binding.worker_name);
        worker.start()?;
        let handle = worker.handle();

        *self.shared.local_endpoint.lock() = Some(endpoint.clone());
        self.unlink_on_stop = unlink_on_stop;
        self.shared.stopping.store(false, SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        handle.spawn(accept_loop(
            self.shared.clone(),
            handle.clone(),
            acceptor,
            protocol,
            binding.chunk_size,
            stop_rx,
        ));
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        self.shared.running.store(true, SeqCst);

        let shared = self.shared.clone();
        handle.post(move || {
            {
                let mut flag = shared.started.0.lock();
                *flag = true;
                shared.started.1.notify_all();
            }
            if let Some(callback) = shared.on_start.lock().take() {
                callback();
            }
        });

        info!(%endpoint, "server started");
        Ok(())
    }

    /// True between a successful `start` and the end of `stop`.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(SeqCst)
    }

    /// Blocks until the start sequence completed on the worker loop.
    /// Returns `false` if it did not complete within a few seconds.
    pub fn wait(&self) -> bool {
        let (lock, condvar) = &self.shared.started;
        let mut flag = lock.lock();
        if !*flag {
            condvar.wait_for(&mut flag, Duration::from_secs(5));
        }
        *flag
    }

    /// The actual bound address, available once running. For ephemeral
    /// ports this is where the port number comes from.
    pub fn local_endpoint(&self) -> Option<String> {
        self.shared.local_endpoint.lock().clone()
    }

    /// Runs `task` on the server's worker loop.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match &self.worker {
            Some(worker) => worker.handle().post(task),
            None => false,
        }
    }

    /// Currently connected ids, mostly for diagnostics.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Stops accepting, disconnects every connection, and releases the
    /// acceptor. With `wait_for_removal` the call blocks (bounded) until
    /// the disconnect handlers have drained the connection map.
    ///
    /// Also the cleanup path after the accept loop declared its acceptor
    /// unrecoverable: `is_running` is already false then, but the worker
    /// loop and any established connections still need tearing down.
    pub fn stop(&mut self, wait_for_removal: bool) {
        if self.worker.is_none() {
            return;
        }
        info!("server stopping");
        self.shared.stopping.store(true, SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }

        let connections: Vec<Arc<Connection>> = self
            .shared
            .connections
            .lock()
            .values()
            .map(|entry| entry.connection.clone())
            .collect();
        for connection in connections {
            connection.disconnect();
        }

        if wait_for_removal {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.shared.connections.lock().is_empty() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.shared.connections.lock().clear();
        if let Some(path) = self.unlink_on_stop.take() {
            let _ = std::fs::remove_file(&path);
        }
        *self.shared.local_endpoint.lock() = None;
        *self.shared.started.0.lock() = false;
        self.shared.running.store(false, SeqCst);
        info!("server stopped");
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop(false);
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    handle: LoopHandle,
    acceptor: StdAcceptor,
    protocol: Arc<dyn Framer>,
    chunk_size: usize,
    mut stop_rx: watch::Receiver<bool>,
) {
    let acceptor = match acceptor.into_tokio() {
        Ok(acceptor) => acceptor,
        Err(err) => {
            shared.fail(&format!("acceptor registration failed: {err}"));
            return;
        }
    };

    let mut health = AcceptorHealth::new();
    loop {
        let accepted = tokio::select! {
            _ = stop_rx.changed() => break,
            result = acceptor.accept() => result,
        };
        match accepted {
            Ok(stream) => {
                health.record_success();
                if shared.stopping.load(SeqCst) {
                    // Refused; dropping the stream closes it.
                    continue;
                }
                let connection =
                    Connection::spawn(stream, protocol.clone(), chunk_size, handle.clone());

                // Registered before the connection is published, so it runs
                // after every user disconnect handler.
                let removal = {
                    let shared = shared.clone();
                    connection.on_disconnect(move |id| {
                        shared.connections.lock().remove(&id);
                        debug!(id, "connection removed from server map");
                    })
                };
                shared.connections.lock().insert(
                    connection.id(),
                    ConnectionEntry {
                        connection: connection.clone(),
                        _removal: removal,
                    },
                );
                debug!(
                    id = connection.id(),
                    remote = connection.remote_endpoint(),
                    "connection accepted"
                );
                if let Some(callback) = shared.on_new_connection.lock().clone() {
                    callback(&connection);
                }
            }
            Err(err) => {
                let unrecoverable = health.record_failure(&err);
                shared.fail(&format!("accept failed: {err}"));
                if unrecoverable {
                    // A dead listener would otherwise spin here forever.
                    warn!(%err, "acceptor is unrecoverable, releasing it");
                    shared.fail("acceptor is unrecoverable; server is no longer accepting");
                    shared.running.store(false, SeqCst);
                    break;
                }
            }
        }
    }
    debug!("acceptor released");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_descriptor_is_immediately_unrecoverable() {
        let mut health = AcceptorHealth::new();
        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert!(health.record_failure(&ebadf));

        let mut health = AcceptorHealth::new();
        let enotsock = io::Error::from_raw_os_error(libc::ENOTSOCK);
        assert!(health.record_failure(&enotsock));
    }

    #[test]
    fn transient_errors_only_trip_after_a_streak() {
        let mut health = AcceptorHealth::new();
        let aborted = io::Error::from_raw_os_error(libc::ECONNABORTED);
        for _ in 0..AcceptorHealth::MAX_CONSECUTIVE_FAILURES - 1 {
            assert!(!health.record_failure(&aborted));
        }
        assert!(health.record_failure(&aborted));
    }

    #[test]
    fn a_successful_accept_resets_the_streak() {
        let mut health = AcceptorHealth::new();
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        for _ in 0..AcceptorHealth::MAX_CONSECUTIVE_FAILURES - 1 {
            assert!(!health.record_failure(&emfile));
        }
        health.record_success();
        assert!(!health.record_failure(&emfile));
    }
}
