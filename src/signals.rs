//! # Process Signal Plumbing
//!
//! Two concerns live here:
//!
//! - Lifecycle signals (interrupt, terminate, user-1, user-2) are caught with
//!   the self-pipe trick: the `sigaction` handler only calls `write(2)`,
//!   which is async-signal-safe per POSIX, to push the signal number into a
//!   pipe. A background thread named `signal` reads the pipe and forwards
//!   each signal to the application controller, which dispatches callbacks
//!   on the main loop. Fatal signals are handled elsewhere (see
//!   [`crate::crash`]).
//! - [`PipeBlock`]: a scoped guard that blocks `SIGPIPE` for the current
//!   thread, so writes to closed pipes surface as error results instead of
//!   killing the process.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::{debug, error};

/// Write end of the self-pipe. Published before any handler is installed,
/// and only ever touched with async-signal-safe calls afterwards.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Signals routed through the self-pipe. Fatal signals are excluded; they
/// must run on the faulting thread and never leave it.
const LIFECYCLE_SIGNALS: &[libc::c_int] = &[
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// OS-level handler. Only `write(2)` is called here.
extern "C" fn pipe_handler(signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: `fd` is the open write end of the self-pipe, published by
        // `install_lifecycle_handlers` before the handler was registered,
        // and `byte` is a live stack variable. `write` is async-signal-safe.
        unsafe {
            libc::write(fd, std::ptr::addr_of!(byte).cast::<libc::c_void>(), 1);
        }
    }
}

/// Installs `pipe_handler` for one signal number via `sigaction(2)`.
///
/// # Safety
///
/// `signo` must be a valid, catchable signal number. The handler is a
/// `static extern "C" fn` calling only `write(2)`.
unsafe fn install_handler(signo: libc::c_int) -> io::Result<()> {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = pipe_handler as *const () as libc::sighandler_t;
    sa.sa_flags = libc::SA_RESTART;
    if libc::sigaction(signo, &sa, std::ptr::null_mut()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Creates the self-pipe and installs handlers for the lifecycle signals.
/// Returns the read end for [`spawn_watcher`].
pub(crate) fn install_lifecycle_handlers() -> io::Result<libc::c_int> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element array for pipe(2) to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    // SAFETY: both descriptors were just returned by pipe(2).
    unsafe {
        libc::fcntl(read_fd, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(write_fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    WRITE_FD.store(write_fd, Ordering::SeqCst);

    for &signo in LIFECYCLE_SIGNALS {
        // SAFETY: every entry of LIFECYCLE_SIGNALS is a catchable signal.
        unsafe { install_handler(signo)? };
    }
    debug!("lifecycle signal handlers installed");
    Ok(read_fd)
}

/// Spawns the watcher thread draining the self-pipe. Each received signal
/// number is handed to `dispatch`.
pub(crate) fn spawn_watcher(
    read_fd: libc::c_int,
    dispatch: impl Fn(libc::c_int) + Send + 'static,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("signal".into()).spawn(move || loop {
        let mut byte = 0u8;
        // SAFETY: `read_fd` stays open for the process lifetime and `byte`
        // is a live stack variable.
        let n = unsafe {
            libc::read(
                read_fd,
                std::ptr::addr_of_mut!(byte).cast::<libc::c_void>(),
                1,
            )
        };
        match n {
            1 => dispatch(libc::c_int::from(byte)),
            0 => break,
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("signal watcher read failed: {err}");
                break;
            }
        }
    })
}

/// Blocks `SIGPIPE` for the current thread while in scope, so writes to
/// closed pipes produce `EPIPE` instead of terminating the process.
///
/// For an open-ended block, use the explicit [`PipeBlock::lock`] /
/// [`PipeBlock::unlock`] pair instead of the guard.
pub struct PipeBlock(());

impl PipeBlock {
    pub fn new() -> Self {
        Self::lock();
        PipeBlock(())
    }

    /// Adds `SIGPIPE` to the calling thread's blocked mask.
    pub fn lock() {
        let mut set = SigSet::empty();
        set.add(Signal::SIGPIPE);
        if let Err(err) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
            error!("failed to block SIGPIPE: {err}");
        }
    }

    /// Removes `SIGPIPE` from the calling thread's blocked mask.
    pub fn unlock() {
        let mut set = SigSet::empty();
        set.add(Signal::SIGPIPE);
        if let Err(err) = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None) {
            error!("failed to unblock SIGPIPE: {err}");
        }
    }
}

impl Default for PipeBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipeBlock {
    fn drop(&mut self) {
        Self::unlock();
    }
}
