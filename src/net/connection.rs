//! # Connections
//!
//! A [`Connection`] binds one transport endpoint to one framing parser and
//! exposes unit-level send/receive. It is used identically on both sides:
//! servers hand one to `on_new_connection`, clients to `on_connect`.
//!
//! The connection owns its task set, a reader task and a writer task
//! spawned on the owning loop, and cancels both when it disconnects, so no
//! completion callback can outlive it:
//!
//! - **Receive**: the reader pulls up to `chunk_size` bytes at a time,
//!   appends them to a residual buffer, and feeds the parser in a loop,
//!   dispatching every completed unit to the receive observers. Short reads
//!   are normal; a partially fed frame simply waits for the next chunk.
//! - **Send**: [`post`](Connection::post) serialises into a mutex-guarded
//!   send buffer; [`commit`](Connection::commit) takes the buffer whole and
//!   hands it to the writer task, which performs one write per commit. Many
//!   posts batched into one write is under the caller's control;
//!   [`send`](Connection::send) is the post-and-commit shorthand.
//!
//! Disconnects (local, remote close, read/write error, or stream error
//! from the parser) funnel through one teardown path that fires the
//! disconnect observers exactly once, in reverse registration order, on the
//! owning loop. After teardown every operation returns `false`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::event_loop::LoopHandle;
use crate::framing::{Framer, UnitParser};
use crate::net::transport::{ReadHalf, ScopeRunner, Stream, WriteHalf};
use crate::observer::{Observers, Subscription};
use crate::unit::Unit;

/// Monotonic per-process connection ids. 64 bits never wrap in practice.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type ReceiveCallback = dyn Fn(&Arc<Connection>, Unit) + Send + Sync;
type DisconnectCallback = dyn Fn(u64) + Send + Sync;

/// One framed, bidirectional connection. See the module docs.
pub struct Connection {
    id: u64,
    remote: String,
    loop_handle: LoopHandle,
    connected: AtomicBool,
    framer: Arc<dyn Framer>,
    send_buffer: Mutex<Vec<u8>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    receive_observers: Observers<ReceiveCallback>,
    disconnect_observers: Observers<DisconnectCallback>,
    gate: ScopeRunner,
}

impl Connection {
    /// Wraps an established endpoint, spawning its reader and writer tasks
    /// on `loop_handle`. The loop must be running.
    pub(crate) fn spawn(
        stream: Stream,
        framer: Arc<dyn Framer>,
        chunk_size: usize,
        loop_handle: LoopHandle,
    ) -> Arc<Connection> {
        stream.apply_low_latency_options();
        let remote = stream.remote_endpoint();
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let parser = framer.new_parser();

        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, SeqCst),
            remote,
            loop_handle,
            connected: AtomicBool::new(true),
            framer,
            send_buffer: Mutex::new(Vec::new()),
            write_tx,
            shutdown_tx,
            receive_observers: Observers::new(),
            disconnect_observers: Observers::new(),
            gate: ScopeRunner::new(),
        });
        debug!(id = connection.id, remote = %connection.remote, "connection established");

        let reader = connection.clone();
        connection.loop_handle.spawn(read_pipeline(
            reader,
            read_half,
            parser,
            chunk_size,
            shutdown_rx.clone(),
        ));
        let writer = connection.clone();
        connection
            .loop_handle
            .spawn(write_pipeline(writer, write_half, write_rx, shutdown_rx));

        connection
    }

    /// Unique, process-monotonic id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Printable form of the remote end.
    pub fn remote_endpoint(&self) -> &str {
        &self.remote
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(SeqCst)
    }

    /// The framing codec this connection speaks.
    pub fn protocol(&self) -> &Arc<dyn Framer> {
        &self.framer
    }

    /// Serialises `unit` into the send buffer without transmitting.
    /// Returns `false` after disconnect.
    pub fn post(&self, unit: &Unit) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_buffer.lock().extend_from_slice(&unit.to_wire_bytes());
        true
    }

    /// Frames `payload` with this connection's codec and posts it.
    pub fn post_bytes(&self, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.post(&self.framer.create(payload))
    }

    /// Takes the accumulated send buffer and submits it as one write.
    pub fn commit(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let pending = std::mem::take(&mut *self.send_buffer.lock());
        if pending.is_empty() {
            return true;
        }
        self.write_tx.send(pending).is_ok()
    }

    /// [`post`](Self::post) then [`commit`](Self::commit).
    pub fn send(&self, unit: &Unit) -> bool {
        self.post(unit) && self.commit()
    }

    /// Frames `payload` and sends it immediately.
    pub fn send_bytes(&self, payload: &[u8]) -> bool {
        self.post_bytes(payload) && self.commit()
    }

    /// Observe received units. Callbacks run on the owning loop.
    pub fn on_receive(
        &self,
        callback: impl Fn(&Arc<Connection>, Unit) + Send + Sync + 'static,
    ) -> Subscription {
        self.receive_observers.subscribe(Arc::new(callback))
    }

    /// Observe disconnection. Fires exactly once per connection lifetime,
    /// on the owning loop, in reverse registration order, with the
    /// connection id.
    pub fn on_disconnect(&self, callback: impl Fn(u64) + Send + Sync + 'static) -> Subscription {
        self.disconnect_observers.subscribe(Arc::new(callback))
    }

    /// Closes the connection. After this returns, no further read or write
    /// completion callbacks fire for it.
    pub fn disconnect(self: &Arc<Self>) {
        self.teardown("local disconnect");
    }

    fn teardown(self: &Arc<Self>, reason: &str) {
        if !self.connected.swap(false, SeqCst) {
            return;
        }
        debug!(id = self.id, reason, "connection closing");
        self.gate.begin_stop();
        let _ = self.shutdown_tx.send(true);

        let connection = self.clone();
        let posted = self.loop_handle.post(move || {
            // In-flight completion dispatches finish before the handlers
            // run; new dispatches were refused when the stop bit went up.
            connection.gate.wait_drained();
            for callback in connection.disconnect_observers.drain_reversed() {
                callback(connection.id);
            }
            trace!(id = connection.id, "disconnect handlers completed");
        });
        if !posted {
            // Loop already gone; keep the exactly-once promise inline.
            self.gate.wait_drained();
            for callback in self.disconnect_observers.drain_reversed() {
                callback(self.id);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Chunked read loop: read, feed, dispatch, repeat.
async fn read_pipeline(
    connection: Arc<Connection>,
    mut read_half: ReadHalf,
    mut parser: Box<dyn UnitParser>,
    chunk_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut chunk = vec![0u8; chunk_size];
    let mut residual: Vec<u8> = Vec::new();

    loop {
        let received = tokio::select! {
            _ = shutdown_rx.changed() => return,
            result = read_half.read(&mut chunk) => match result {
                // A zero-byte read is the remote half-close.
                Ok(0) => {
                    connection.teardown("remote endpoint closed");
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    debug!(id = connection.id, %err, "read failed");
                    connection.teardown("read error");
                    return;
                }
            },
        };
        residual.extend_from_slice(&chunk[..received]);

        loop {
            let before = residual.len();
            if let Err(err) = parser.feed(&mut residual) {
                warn!(id = connection.id, %err, "stream error, tearing connection down");
                connection.teardown("stream error");
                return;
            }
            if parser.ready() {
                let unit = parser.take();
                parser.reset();
                let lock = match connection.gate.continue_lock() {
                    Some(lock) => lock,
                    None => return,
                };
                if !connection.is_connected() {
                    return;
                }
                for callback in connection.receive_observers.snapshot() {
                    // Callbacks never propagate panics past the loop.
                    let dispatch = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback(&connection, unit.clone())
                    }));
                    if dispatch.is_err() {
                        tracing::error!(id = connection.id, "receive callback panicked");
                    }
                }
                drop(lock);
                continue;
            }
            if residual.is_empty() || residual.len() == before {
                break;
            }
        }
    }
}

/// Serialised write loop: one outstanding write at a time, graceful
/// shutdown of the write half on exit.
async fn write_pipeline(
    connection: Arc<Connection>,
    mut write_half: WriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            message = write_rx.recv() => match message {
                Some(bytes) => {
                    if let Err(err) = write_half.write_all(&bytes).await {
                        debug!(id = connection.id, %err, "write failed");
                        connection.teardown("write error");
                        break;
                    }
                    trace!(id = connection.id, bytes = bytes.len(), "write completed");
                }
                None => break,
            },
        }
    }
    let _ = write_half.shutdown().await;
}
