//! # keel
//!
//! A reusable foundation for long-running network servers and clients: the
//! concurrency core plus the protocol-framed networking core on which
//! applications are built.
//!
//! - [`event_loop`]: single- and multi-thread cooperative task executors
//!   with posted work, scheduled timers, thread-affinity queries, and named
//!   worker threads
//! - [`app`]: the process lifecycle controller (startup, shutdown on
//!   termination signals, user-signal control, crash handling) driving a
//!   distinguished main loop
//! - [`net`]: accept/connect machinery over TCP and Unix-domain sockets
//!   with per-connection framed read/write pipelines
//! - [`framing`]: the pluggable codec abstraction with raw,
//!   varint-length-prefixed, and delimiter-terminated codecs
//!
//! Bytes arrive at the transport, are pushed into the connection's parser,
//! and come out as zero-or-more completed [`unit::Unit`]s in the receive
//! callback; outbound, units are created via the codec and serialized into
//! batched writes. Every application callback runs on an event loop.

pub mod app;
pub mod crash;
pub mod event_loop;
pub mod framing;
pub mod logging;
pub mod net;
pub mod observer;
pub mod signals;
pub mod timers;
pub mod unit;

pub use app::{Application, ControlSignal};
pub use event_loop::{EventLoop, LoopHandle, MainLoop, MtEventLoop};
pub use framing::{DstreamFramer, FrameError, Framer, MsgFramer, RawFramer, UnitParser};
pub use net::{Client, Connection, Server};
pub use observer::Subscription;
pub use signals::PipeBlock;
pub use timers::{PeriodicalTimer, Timer};
pub use unit::Unit;

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default read chunk size per connection, in bytes.
    pub const CHUNK_SIZE: usize = 4096;

    /// Default payload bound of the msg codec, in bytes.
    pub const MSG_MAX_SIZE: usize = 1024;

    /// Default delimiter of the dstream codec.
    pub const DSTREAM_DELIMITER: &[u8] = b"\r\n\r\n";

    /// Default host for TCP configurations.
    pub const HOST: &str = "localhost";

    /// OS limit for thread names; longer names are silently truncated.
    pub const THREAD_NAME_MAX: usize = 15;

    /// Default worker-thread name for servers.
    pub const SERVER_WORKER_NAME: &str = "server";

    /// Default worker-thread name for clients.
    pub const CLIENT_WORKER_NAME: &str = "client";
}
