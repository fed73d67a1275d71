//! # Crash Capture
//!
//! Fatal signals (segfault, illegal instruction, bus error, floating-point
//! fault, abort) are handled on the faulting thread with async-signal-safe
//! primitives only: the raw stack dump is written with `open`/`write`/
//! `close`, the registered fail hook runs, and the default disposition is
//! restored before re-raising so the OS still produces a core file.
//!
//! The raw dump is an array of little-endian 64-bit instruction pointers
//! (readable with `od -tx8 -An <file>`) because nothing may allocate or
//! format inside a signal handler. The human-readable, demangled companion
//! is produced on demand by [`save_pretty_dump`], outside any signal
//! context.
//!
//! Handler configuration lives in atomic pointers, never behind a mutex:
//! taking a lock inside a signal handler is not allowed.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst};

use anyhow::{bail, Context, Result};
use libc::{c_char, c_int, c_void};
use tracing::debug;

/// Upper bound on captured frames; keeps the handler's work bounded.
const MAX_DUMP_FRAMES: usize = 128;

/// Fail hook invoked on the faulting thread. Receives the signal number and
/// the configured dump path.
///
/// The hook runs inside a signal handler: it must restrict itself to
/// async-signal-safe operations (no allocation, no locks, no formatting).
pub type FailHook = Box<dyn Fn(c_int, Option<&'static str>) + Send + Sync>;

struct FailCell(FailHook);
struct PathCell(&'static str);

// Always either null or Box::into_raw-produced; replaced with swap so the
// previous box can be reclaimed.
static FAIL_HOOK: AtomicPtr<FailCell> = AtomicPtr::new(ptr::null_mut());
static DUMP_PATH_C: AtomicPtr<c_char> = AtomicPtr::new(ptr::null_mut());
static DUMP_PATH_TEXT: AtomicPtr<PathCell> = AtomicPtr::new(ptr::null_mut());
static RENAME_EXISTING_CORE: AtomicBool = AtomicBool::new(false);

const FATAL_SIGNALS: &[c_int] = &[
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGABRT,
];

/// The async-signal-safe part: dump, fail hook, then default behaviour.
extern "C" fn fatal_handler(signo: c_int) {
    let dump_path = DUMP_PATH_C.load(SeqCst);
    if !dump_path.is_null() {
        // SAFETY: the pointer came from CString::into_raw and is never freed.
        unsafe {
            write_raw_dump(dump_path);
        }
    }

    if RENAME_EXISTING_CORE.load(SeqCst) {
        // The kernel refuses to overwrite an existing core file under some
        // core-pattern configurations; move the old one aside first.
        // rename(2) is async-signal-safe.
        unsafe {
            libc::rename(
                b"core\0".as_ptr().cast::<c_char>(),
                b"core.old\0".as_ptr().cast::<c_char>(),
            );
        }
    }

    let hook = FAIL_HOOK.load(SeqCst);
    if !hook.is_null() {
        let path = {
            let text = DUMP_PATH_TEXT.load(SeqCst);
            if text.is_null() {
                None
            } else {
                // SAFETY: set once from Box::into_raw, never freed.
                Some(unsafe { (*text).0 })
            }
        };
        // SAFETY: same lifetime argument as above. The hook's contract
        // requires it to be async-signal-safe.
        unsafe { ((*hook).0)(signo, path) };
    }

    // SAFETY: restoring SIG_DFL and re-raising on the faulting thread hands
    // the signal to the OS default, which produces the core dump.
    unsafe {
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
    }
}

/// Writes the frame instruction pointers to `path`. Async-signal-safe:
/// open/write/close only, fixed-size stack buffers.
///
/// # Safety
///
/// `path` must point to a valid NUL-terminated string.
unsafe fn write_raw_dump(path: *const c_char) -> bool {
    let fd = libc::open(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644);
    if fd < 0 {
        return false;
    }
    let mut frames = 0usize;
    backtrace::trace_unsynchronized(|frame| {
        let ip = frame.ip() as usize as u64;
        let bytes = ip.to_le_bytes();
        libc::write(fd, bytes.as_ptr().cast::<c_void>(), bytes.len());
        frames += 1;
        frames < MAX_DUMP_FRAMES
    });
    libc::close(fd);
    frames > 0
}

/// Installs the fatal-signal handlers.
///
/// `stdump_path`, when set, is where the raw dump lands at crash time;
/// `rename_existing_core` moves an old `core` file aside before the OS
/// writes a new one.
pub(crate) fn install_fatal_handlers(
    stdump_path: Option<&Path>,
    rename_existing_core: bool,
) -> Result<()> {
    if let Some(path) = stdump_path {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .context("stack dump path contains a NUL byte")?;
        let text: &'static str = Box::leak(path.display().to_string().into_boxed_str());
        DUMP_PATH_C.store(c_path.into_raw(), SeqCst);
        DUMP_PATH_TEXT.store(Box::into_raw(Box::new(PathCell(text))), SeqCst);
    }
    RENAME_EXISTING_CORE.store(rename_existing_core, SeqCst);

    for &signo in FATAL_SIGNALS {
        // SAFETY: zeroed sigaction with a valid static handler; every entry
        // of FATAL_SIGNALS is a catchable signal number.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = fatal_handler as *const () as libc::sighandler_t;
            if libc::sigaction(signo, &sa, ptr::null_mut()) != 0 {
                bail!(
                    "failed to install fatal handler for signal {signo}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    debug!("fatal signal handlers installed");
    Ok(())
}

/// Registers the hook invoked on the faulting thread after the dump is
/// written. Replaces any previous hook.
pub(crate) fn set_fail_hook(hook: FailHook) {
    let fresh = Box::into_raw(Box::new(FailCell(hook)));
    let old = FAIL_HOOK.swap(fresh, SeqCst);
    if !old.is_null() {
        // SAFETY: non-null values only ever come from Box::into_raw above.
        drop(unsafe { Box::from_raw(old) });
    }
}

/// Path configured for raw dumps, if any.
pub fn dump_path() -> Option<&'static str> {
    let text = DUMP_PATH_TEXT.load(SeqCst);
    if text.is_null() {
        None
    } else {
        // SAFETY: set once from Box::into_raw, never freed.
        Some(unsafe { (*text).0 })
    }
}

/// Checks that `path` does not exist yet and is creatable: a cheap probe
/// for dump destinations done at configuration time, not crash time.
pub fn test_file_for_write(path: &Path) -> bool {
    if path.exists() {
        return false;
    }
    if fs::File::create(path).is_err() {
        return false;
    }
    fs::remove_file(path).is_ok()
}

/// Captures a raw stack dump of the calling thread to `path`.
///
/// Callable from normal code as well as from signal context; only
/// async-signal-safe primitives are used either way.
pub fn save_raw_dump(path: &Path) -> Result<()> {
    let c_path =
        CString::new(path.as_os_str().as_bytes()).context("dump path contains a NUL byte")?;
    // SAFETY: c_path is a valid NUL-terminated string for the call duration.
    if unsafe { write_raw_dump(c_path.as_ptr()) } {
        Ok(())
    } else {
        bail!("failed to write stack dump to {}", path.display());
    }
}

/// Reads a raw dump back and resolves each frame to a demangled symbol
/// line. Optionally removes the raw file afterwards.
pub fn load_raw_dump(path: &Path, remove: bool) -> Result<String> {
    let data = fs::read(path).with_context(|| format!("reading dump {}", path.display()))?;
    let mut out = String::new();
    for (index, chunk) in data.chunks_exact(8).enumerate() {
        let ip = u64::from_le_bytes(chunk.try_into().expect("eight-byte chunk")) as usize;
        let mut line = format!("#{index:<3} {ip:#018x}");
        backtrace::resolve(ip as *mut c_void, |symbol| {
            if let Some(name) = symbol.name() {
                line.push_str(&format!(" {name}"));
            }
            if let (Some(file), Some(lineno)) = (symbol.filename(), symbol.lineno()) {
                line.push_str(&format!(" at {}:{lineno}", file.display()));
            }
        });
        out.push_str(&line);
        out.push('\n');
    }
    if remove {
        let _ = fs::remove_file(path);
    }
    Ok(out)
}

/// Produces the human-readable companion file for a raw dump.
///
/// Returns `Ok(false)` when there is no raw dump to demangle. Never called
/// from signal context; this is where allocation and symbol resolution are
/// allowed to happen.
pub fn save_pretty_dump(raw_path: &Path, pretty_path: &Path) -> Result<bool> {
    if !raw_path.exists() {
        return Ok(false);
    }
    let resolved = load_raw_dump(raw_path, false)?;
    if resolved.is_empty() {
        return Ok(false);
    }
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let report = format!("~stack trace captured {stamp}\n\n{resolved}");
    fs::write(pretty_path, report)
        .with_context(|| format!("writing demangled dump {}", pretty_path.display()))?;
    Ok(true)
}
