//! # Application Controller
//!
//! A process-wide controller owning the main loop and the process's signal
//! story. Created once, explicitly, near the top of `main`:
//!
//! ```no_run
//! use keel::app::Application;
//!
//! let app = Application::init(Application::configure().enable_corefile(true));
//! app.on_start(|| println!("up"));
//! std::process::exit(app.run());
//! ```
//!
//! Signal routing:
//!
//! - interrupt / terminate: the exit callback is posted on the main loop,
//!   then the process exits with the stored exit code (default 0)
//! - user-1 / user-2: the control callback is posted on the main loop with a
//!   tag identifying which signal arrived
//! - fatal signals: handled on the faulting thread by [`crate::crash`]: a
//!   raw stack dump, the fail callback, then the OS default (core dump)
//!
//! The controller is a singleton by necessity (signal dispositions are
//! process-global), but construction is explicit: `init` must run before
//! anything else, and [`Application::instance`] is only a convenience
//! accessor for code that already knows init happened.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::SeqCst};
use std::sync::{Arc, OnceLock};

use libc::c_int;
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use nix::unistd::{fork, setsid, ForkResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::crash;
use crate::event_loop::MainLoop;
use crate::signals;

/// Which control signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Usr1,
    Usr2,
}

/// Process-level configuration, applied once by [`Application::init`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    stdump_path: Option<PathBuf>,
    enable_corefile: bool,
    corefile_disable_excl_policy: bool,
    corefile_fail_thread_only: bool,
    lock_io: bool,
    daemon: bool,
}

impl Config {
    /// On crash, write a raw stack dump to `path`. The dump complements the
    /// core file and can be demangled later with
    /// [`crash::save_pretty_dump`].
    pub fn enable_stdump(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdump_path = Some(path.into());
        self
    }

    /// Raise `RLIMIT_CORE` so the system actually produces a core file.
    /// With `disable_excl_policy`, an existing `core` file is renamed before
    /// the crash writes a new one.
    pub fn enable_corefile(mut self, disable_excl_policy: bool) -> Self {
        self.enable_corefile = true;
        self.corefile_disable_excl_policy = disable_excl_policy;
        self
    }

    /// Restrict the OS-produced core dump to the thread that faulted.
    /// Recorded as a request; the kernel-side restriction is
    /// implementation-defined.
    pub fn corefile_fail_thread_only(mut self) -> Self {
        self.corefile_fail_thread_only = true;
        self
    }

    /// Silently drop writes to stdout/stderr. For daemonized processes.
    pub fn lock_io(mut self) -> Self {
        self.lock_io = true;
        self
    }

    /// Detach from the controlling terminal. Applied before any thread is
    /// spawned.
    pub fn make_daemon(mut self) -> Self {
        self.daemon = true;
        self
    }
}

type StartCallback = Box<dyn FnOnce() + Send>;
type ExitCallback = Arc<dyn Fn(i32) + Send + Sync>;
type ControlCallback = Arc<dyn Fn(ControlSignal) + Send + Sync>;

static INSTANCE: OnceLock<Application> = OnceLock::new();

/// The process lifecycle controller. See the module docs.
pub struct Application {
    main_loop: MainLoop,
    exit_code: AtomicI32,
    stopping: AtomicBool,
    started: (Mutex<bool>, Condvar),
    on_start: Mutex<Option<StartCallback>>,
    on_exit: Mutex<Option<ExitCallback>>,
    on_control: Mutex<Option<ControlCallback>>,
}

impl Application {
    /// A default configuration to refine.
    pub fn configure() -> Config {
        Config::default()
    }

    /// Creates the controller, applies process-level configuration, and
    /// installs all signal handlers. Call before spawning any thread.
    ///
    /// # Panics
    ///
    /// Panics when called twice, or when a handler cannot be installed;
    /// there is no sensible way to continue without the signal story the
    /// caller asked for.
    pub fn init(config: Config) -> &'static Application {
        if config.daemon {
            daemonize();
        }
        if config.lock_io {
            lock_io();
        }

        crash::install_fatal_handlers(
            config.stdump_path.as_deref(),
            config.corefile_disable_excl_policy,
        )
        .expect("fatal signal handlers must install");

        if config.enable_corefile {
            if let Err(err) = setrlimit(Resource::RLIMIT_CORE, RLIM_INFINITY, RLIM_INFINITY) {
                warn!("could not raise RLIMIT_CORE: {err}");
            }
        }
        if config.corefile_fail_thread_only {
            debug!("core dumps requested for the faulting thread only");
        }

        let app = Application {
            main_loop: MainLoop::new("main"),
            exit_code: AtomicI32::new(0),
            stopping: AtomicBool::new(false),
            started: (Mutex::new(false), Condvar::new()),
            on_start: Mutex::new(None),
            on_exit: Mutex::new(None),
            on_control: Mutex::new(None),
        };
        if INSTANCE.set(app).is_err() {
            panic!("application is already initialized");
        }
        let app = INSTANCE.get().expect("just initialized");

        let read_fd =
            signals::install_lifecycle_handlers().expect("lifecycle signal handlers must install");
        signals::spawn_watcher(read_fd, |signo| Application::instance().route_signal(signo))
            .expect("signal watcher thread must spawn");

        debug!("application initialized");
        app
    }

    /// [`init`](Self::init) with the default configuration: no stack dump,
    /// system core-dump settings, no daemonizing.
    pub fn init_default() -> &'static Application {
        Self::init(Self::configure())
    }

    /// The controller created by `init`.
    ///
    /// # Panics
    ///
    /// Panics when `init` has not run.
    pub fn instance() -> &'static Application {
        INSTANCE.get().expect("application is not initialized")
    }

    /// Invoke `callback` once the application has started, on the main loop.
    pub fn on_start(&self, callback: impl FnOnce() + Send + 'static) -> &Self {
        *self.on_start.lock() = Some(Box::new(callback));
        self
    }

    /// Invoke `callback` on the main loop when the application exits by
    /// signal or [`stop`](Self::stop). Receives the signal number, `0` for a
    /// programmatic stop.
    pub fn on_exit(&self, callback: impl Fn(i32) + Send + Sync + 'static) -> &Self {
        *self.on_exit.lock() = Some(Arc::new(callback));
        self
    }

    /// Invoke `callback` on the faulting thread when a fatal signal hits.
    ///
    /// The callback runs inside a signal handler and must restrict itself to
    /// async-signal-safe operations.
    pub fn on_fail(
        &self,
        callback: impl Fn(c_int, Option<&'static str>) + Send + Sync + 'static,
    ) -> &Self {
        crash::set_fail_hook(Box::new(callback));
        self
    }

    /// Invoke `callback` on the main loop for user-1/user-2 signals.
    pub fn on_control(&self, callback: impl Fn(ControlSignal) + Send + Sync + 'static) -> &Self {
        *self.on_control.lock() = Some(Arc::new(callback));
        self
    }

    /// Starts the main loop on the anchor thread and blocks until
    /// [`stop`](Self::stop) (or a termination signal) drains through it.
    /// Returns the exit code.
    pub fn run(&'static self) -> i32 {
        self.main_loop.post(move || {
            {
                let mut flag = self.started.0.lock();
                *flag = true;
                self.started.1.notify_all();
            }
            info!("application started");
            if let Some(callback) = self.on_start.lock().take() {
                callback();
            }
        });

        if let Err(err) = self.main_loop.run() {
            error!("main loop failed: {err}");
            return 1;
        }
        let code = self.exit_code.load(SeqCst);
        info!(code, "application stopped");
        code
    }

    pub fn is_running(&self) -> bool {
        self.main_loop.is_running()
    }

    /// Blocks until the start sequence has completed; returns immediately
    /// if the application is already running.
    pub fn wait(&self) {
        let mut flag = self.started.0.lock();
        while !*flag {
            self.started.1.wait(&mut flag);
        }
    }

    /// The loop bound to the anchor thread. All registered callbacks except
    /// the fail callback run here.
    pub fn main_loop(&self) -> &MainLoop {
        &self.main_loop
    }

    /// Stops the application: the exit callback runs on the main loop, then
    /// [`run`](Self::run) returns `exit_code`.
    pub fn stop(&self, exit_code: i32) {
        self.exit_code.store(exit_code, SeqCst);
        self.shutdown(0);
    }

    fn route_signal(&self, signo: c_int) {
        match signo {
            libc::SIGINT | libc::SIGTERM => {
                info!(signo, "termination signal received");
                self.shutdown(signo);
            }
            libc::SIGUSR1 => self.dispatch_control(ControlSignal::Usr1),
            libc::SIGUSR2 => self.dispatch_control(ControlSignal::Usr2),
            other => warn!(signo = other, "unexpected signal routed to watcher"),
        }
    }

    fn dispatch_control(&self, signal: ControlSignal) {
        debug!(?signal, "control signal received");
        if let Some(callback) = self.on_control.lock().clone() {
            self.main_loop.post(move || callback(signal));
        }
    }

    fn shutdown(&self, signo: i32) {
        if self.stopping.swap(true, SeqCst) {
            return;
        }
        let exit_callback = self.on_exit.lock().clone();
        if self.main_loop.is_running() {
            self.main_loop.post(move || {
                if let Some(callback) = exit_callback {
                    callback(signo);
                }
            });
            // Queued behind the exit callback; the loop drains in order.
            self.main_loop.stop();
        } else {
            if let Some(callback) = exit_callback {
                callback(signo);
            }
            std::process::exit(self.exit_code.load(SeqCst));
        }
    }
}

/// Classic double-fork detach. Must run before any thread is spawned.
fn daemonize() {
    // SAFETY: single-threaded at this point; fork is well-defined.
    match unsafe { fork() }.expect("daemonize: first fork") {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().expect("daemonize: setsid");
    // SAFETY: still single-threaded in the first child.
    match unsafe { fork() }.expect("daemonize: second fork") {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
}

/// Points stdout/stderr at /dev/null.
fn lock_io() {
    // SAFETY: plain descriptor juggling over the standard streams.
    unsafe {
        let null = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, libc::STDOUT_FILENO);
            libc::dup2(null, libc::STDERR_FILENO);
            if null > libc::STDERR_FILENO {
                libc::close(null);
            }
        }
    }
}
