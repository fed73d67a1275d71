//! # Cooperative Event Loops
//!
//! An event loop is a task executor bound to one or more named worker
//! threads. Applications hand it closures with [`post`](EventLoop::post),
//! schedule one-shot and periodic work through [`Timer`]s, and rely on every
//! registered callback of a subject (connection, server, client) running on
//! the loop that owns the subject.
//!
//! Three flavours share one core:
//!
//! - [`EventLoop`]: one dedicated worker thread driving a current-thread
//!   tokio runtime. Posted tasks flow through a *strand*, an unbounded FIFO
//!   channel drained by a dispatcher task, which gives strict FIFO order
//!   among posts and confines timer fires to the gaps between tasks.
//! - [`MtEventLoop`]: a multi-thread tokio runtime with `n` workers pulling
//!   from the shared injection queue. No ordering between concurrent tasks;
//!   a single task still runs exactly once.
//! - [`MainLoop`]: the loop bound to the controller's anchor thread;
//!   `run()` blocks the caller instead of spawning. Only the application
//!   controller owns one.
//!
//! A task that panics is caught at the loop boundary, logged, and the loop
//! keeps running; panics never cross to other tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::defaults;
use crate::timers::{PeriodicalTimer, Timer};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

enum LoopMsg {
    Run(Task),
    Shutdown,
}

/// State shared between a loop, its handles, and its worker threads.
pub(crate) struct LoopShared {
    name: Mutex<String>,
    running: AtomicBool,
    thread_ids: Mutex<Vec<ThreadId>>,
    /// FIFO strand sender. `None` on multi-thread loops, which have no
    /// cross-thread ordering to preserve.
    strand: Mutex<Option<mpsc::UnboundedSender<LoopMsg>>>,
    /// Receiver parked here between runs; taken by `start`/`run`.
    pending: Mutex<Option<mpsc::UnboundedReceiver<LoopMsg>>>,
    handle: Mutex<Option<runtime::Handle>>,
}

impl LoopShared {
    fn with_strand(name: String) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(LoopShared {
            name: Mutex::new(name),
            running: AtomicBool::new(false),
            thread_ids: Mutex::new(Vec::new()),
            strand: Mutex::new(Some(tx)),
            pending: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        })
    }

    fn without_strand(name: String) -> Arc<Self> {
        Arc::new(LoopShared {
            name: Mutex::new(name),
            running: AtomicBool::new(false),
            thread_ids: Mutex::new(Vec::new()),
            strand: Mutex::new(None),
            pending: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    fn post(&self, task: Task) -> bool {
        if let Some(tx) = &*self.strand.lock() {
            return tx.send(LoopMsg::Run(task)).is_ok();
        }
        if let Some(handle) = &*self.handle.lock() {
            handle.spawn(async move { run_task(task) });
            return true;
        }
        false
    }

    fn is_this_loop(&self) -> bool {
        self.thread_ids.lock().contains(&thread::current().id())
    }

    fn reset_strand(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.strand.lock() = Some(tx);
        *self.pending.lock() = Some(rx);
    }
}

/// A cheap, cloneable reference to a loop, safe to hold from any thread.
///
/// Handles do not keep worker threads alive; they go inert when the loop
/// stops.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Enqueues `task` to run once on this loop. Returns immediately;
    /// `false` means the loop can no longer accept work.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.shared.post(Box::new(task))
    }

    pub(crate) fn post_boxed(&self, task: Task) -> bool {
        self.shared.post(task)
    }

    /// Arms a one-shot timer firing `delay` from now.
    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Timer {
        let timer = Timer::new(self.clone());
        timer.start(delay, task);
        timer
    }

    /// Arms a periodic timer with a steady `interval` cadence.
    pub fn repeat(
        &self,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicalTimer {
        let timer = PeriodicalTimer::new(self.clone());
        timer.start(interval, task);
        timer
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True when called on a thread owned by this loop.
    pub fn is_this_loop(&self) -> bool {
        self.shared.is_this_loop()
    }

    /// Spawns a future on the loop's runtime. Transport tasks use this so
    /// their callbacks land on loop-owned threads.
    pub(crate) fn spawn<F>(&self, future: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match &*self.shared.handle.lock() {
            Some(handle) => {
                handle.spawn(future);
                true
            }
            None => false,
        }
    }
}

fn run_task(task: Task) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        error!("task panicked on event loop: {}", panic_message(&panic));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<opaque panic payload>"
    }
}

/// Drains the strand until shutdown. Timer fires and I/O completions only
/// interleave between tasks, never inside one.
async fn dispatch(mut rx: mpsc::UnboundedReceiver<LoopMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            LoopMsg::Run(task) => run_task(task),
            LoopMsg::Shutdown => break,
        }
    }
}

fn truncate_thread_name(name: &str) -> String {
    if name.len() <= defaults::THREAD_NAME_MAX {
        return name.to_string();
    }
    let mut end = defaults::THREAD_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(target_os = "linux")]
fn apply_current_thread_name(name: &str) {
    if name.is_empty() {
        return;
    }
    if let Ok(cname) = std::ffi::CString::new(name) {
        // Best-effort; a failure to rename the thread is not fatal.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_current_thread_name(_name: &str) {}

// ---------------------------------------------------------------------------
// single-thread loop
// ---------------------------------------------------------------------------

/// A cooperative task queue on one dedicated, named worker thread.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    worker: Option<thread::JoinHandle<()>>,
    on_start: Mutex<Option<Task>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::named("")
    }

    /// A loop whose worker thread carries `name` (truncated to 15 bytes).
    pub fn named(name: impl Into<String>) -> Self {
        EventLoop {
            shared: LoopShared::with_strand(truncate_thread_name(&name.into())),
            worker: None,
            on_start: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Registers a callback posted (not yet executed) when `start` returns.
    /// Consumed by the next `start`.
    pub fn on_start(&self, callback: impl FnOnce() + Send + 'static) -> &Self {
        *self.on_start.lock() = Some(Box::new(callback));
        self
    }

    /// Stores a new worker-thread name, applied at the next start.
    /// Silently truncated to 15 bytes.
    pub fn change_thread_name(&self, name: &str) {
        *self.shared.name.lock() = truncate_thread_name(name);
    }

    pub fn thread_name(&self) -> String {
        self.shared.name.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_this_loop(&self) -> bool {
        self.shared.is_this_loop()
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.shared.post(Box::new(task))
    }

    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Timer {
        self.handle().post_after(delay, task)
    }

    pub fn repeat(
        &self,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicalTimer {
        self.handle().repeat(interval, task)
    }

    /// Spawns the worker thread and returns once the loop is running and any
    /// `on_start` callback has been posted.
    ///
    /// Tasks posted before `start` are preserved and run first, in order.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        *self.shared.handle.lock() = Some(rt.handle().clone());
        let rx = self
            .shared
            .pending
            .lock()
            .take()
            .expect("stopped loop keeps its receiver parked");

        let name = self.shared.name.lock().clone();
        let ready = Arc::new((Mutex::new(false), Condvar::new()));
        let ready_worker = ready.clone();
        let shared = self.shared.clone();

        let mut builder = thread::Builder::new();
        if !name.is_empty() {
            builder = builder.name(name.clone());
        }
        let spawned = builder.spawn(move || {
            shared.thread_ids.lock().push(thread::current().id());
            {
                let mut entered = ready_worker.0.lock();
                *entered = true;
                ready_worker.1.notify_all();
            }
            trace!("event loop thread entering run state");
            rt.block_on(dispatch(rx));
            // Dropping the runtime cancels timers and I/O tasks that were
            // still scheduled on this loop.
            drop(rt);
            let me = thread::current().id();
            shared.thread_ids.lock().retain(|id| *id != me);
            trace!("event loop thread exited");
        });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                *self.shared.handle.lock() = None;
                self.shared.reset_strand();
                return Err(err.into());
            }
        };

        {
            let mut entered = ready.0.lock();
            while !*entered {
                ready.1.wait(&mut entered);
            }
        }

        self.worker = Some(worker);
        self.shared.running.store(true, Ordering::SeqCst);
        if let Some(task) = self.on_start.lock().take() {
            self.handle().post_boxed(task);
        }
        debug!(name = %name, "event loop started");
        Ok(())
    }

    /// Stops the loop, discarding tasks and timers that have not run, joins
    /// the worker thread, and leaves the loop reusable for another `start`.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(tx) = &*self.shared.strand.lock() {
            let _ = tx.send(LoopMsg::Shutdown);
        }
        if self.shared.is_this_loop() {
            // Joining here would deadlock; the worker exits after the
            // current task and is left to finish on its own.
            warn!("event loop stopped from its own thread");
            self.worker = None;
        } else if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("event loop worker thread panicked");
            }
        }
        *self.shared.handle.lock() = None;
        self.shared.reset_strand();
        debug!("event loop stopped");
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// multi-thread loop
// ---------------------------------------------------------------------------

/// The [`EventLoop`] contract over `n` worker threads pulling from one
/// shared queue. Concurrent tasks have no mutual ordering; a task is never
/// executed twice.
pub struct MtEventLoop {
    shared: Arc<LoopShared>,
    runtime: Option<runtime::Runtime>,
    threads: usize,
    on_start: Mutex<Option<Task>>,
}

impl MtEventLoop {
    /// A pool of `threads` workers.
    ///
    /// # Panics
    ///
    /// Panics when `threads` is zero.
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "worker threads are required");
        MtEventLoop {
            shared: LoopShared::without_strand(String::new()),
            runtime: None,
            threads,
            on_start: Mutex::new(None),
        }
    }

    /// A pool sized to the available CPUs.
    pub fn for_cpus() -> Self {
        Self::new(num_cpus::get().max(1))
    }

    pub fn num_threads(&self) -> usize {
        self.threads
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn on_start(&self, callback: impl FnOnce() + Send + 'static) -> &Self {
        *self.on_start.lock() = Some(Box::new(callback));
        self
    }

    pub fn change_thread_name(&self, name: &str) {
        *self.shared.name.lock() = truncate_thread_name(name);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True when the calling thread is any of the pool's workers.
    pub fn is_this_loop(&self) -> bool {
        self.shared.is_this_loop()
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.shared.post(Box::new(task))
    }

    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Timer {
        self.handle().post_after(delay, task)
    }

    pub fn repeat(
        &self,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicalTimer {
        self.handle().repeat(interval, task)
    }

    /// Builds the worker pool and returns once every worker has entered its
    /// run state. The start barrier guarantees user code never observes a
    /// partially populated pool: `on_start` is posted only after all
    /// `num_threads()` workers answer `is_this_loop() == true`.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let entered = Arc::new((Mutex::new(0usize), Condvar::new()));
        let name = self.shared.name.lock().clone();

        let mut builder = runtime::Builder::new_multi_thread();
        builder.worker_threads(self.threads).enable_all();
        if !name.is_empty() {
            builder.thread_name(name.clone());
        }
        let shared_start = self.shared.clone();
        let entered_start = entered.clone();
        builder.on_thread_start(move || {
            shared_start.thread_ids.lock().push(thread::current().id());
            let mut count = entered_start.0.lock();
            *count += 1;
            entered_start.1.notify_all();
        });
        let shared_stop = self.shared.clone();
        builder.on_thread_stop(move || {
            let me = thread::current().id();
            shared_stop.thread_ids.lock().retain(|id| *id != me);
        });

        let rt = builder.build()?;
        *self.shared.handle.lock() = Some(rt.handle().clone());

        {
            let mut count = entered.0.lock();
            while *count < self.threads {
                entered.1.wait(&mut count);
            }
        }

        self.runtime = Some(rt);
        self.shared.running.store(true, Ordering::SeqCst);
        if let Some(task) = self.on_start.lock().take() {
            self.shared.post(task);
        }
        debug!(threads = self.threads, "multi-thread event loop started");
        Ok(())
    }

    /// Shuts the pool down. Queued-but-unstarted tasks are not guaranteed to
    /// execute; running tasks finish first.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        *self.shared.handle.lock() = None;
        if let Some(rt) = self.runtime.take() {
            if self.shared.is_this_loop() {
                warn!("multi-thread event loop stopped from one of its own workers");
                rt.shutdown_background();
            } else {
                rt.shutdown_timeout(Duration::from_secs(5));
            }
        }
        self.shared.thread_ids.lock().clear();
        debug!("multi-thread event loop stopped");
    }
}

impl Drop for MtEventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// main loop
// ---------------------------------------------------------------------------

/// The loop bound to the application controller's anchor thread.
///
/// Unlike [`EventLoop`] it spawns no worker: [`MainLoop::run`] blocks the
/// anchor thread itself until [`MainLoop::stop`] is processed. Only the
/// application controller constructs one.
pub struct MainLoop {
    shared: Arc<LoopShared>,
    anchor: ThreadId,
}

impl MainLoop {
    pub(crate) fn new(name: &str) -> Self {
        MainLoop {
            shared: LoopShared::with_strand(truncate_thread_name(name)),
            anchor: thread::current().id(),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.shared.post(Box::new(task))
    }

    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Timer {
        self.handle().post_after(delay, task)
    }

    pub fn repeat(
        &self,
        interval: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicalTimer {
        self.handle().repeat(interval, task)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_this_loop(&self) -> bool {
        self.shared.is_this_loop()
    }

    /// Dispatches tasks on the anchor thread until a stop request drains
    /// through the queue.
    ///
    /// # Panics
    ///
    /// Panics when called from any other thread.
    pub(crate) fn run(&self) -> Result<()> {
        assert_eq!(
            thread::current().id(),
            self.anchor,
            "main loop runs only on its anchor thread"
        );

        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        *self.shared.handle.lock() = Some(rt.handle().clone());
        let rx = self
            .shared
            .pending
            .lock()
            .take()
            .expect("main loop is not running");

        self.shared.thread_ids.lock().push(self.anchor);
        apply_current_thread_name(&self.shared.name.lock());
        self.shared.running.store(true, Ordering::SeqCst);
        debug!("main loop started");

        rt.block_on(dispatch(rx));
        drop(rt);

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.thread_ids.lock().retain(|id| *id != self.anchor);
        *self.shared.handle.lock() = None;
        self.shared.reset_strand();
        debug!("main loop stopped");
        Ok(())
    }

    /// Requests the loop to exit once tasks queued ahead have run.
    /// Callable from any thread.
    pub fn stop(&self) {
        if let Some(tx) = &*self.shared.strand.lock() {
            let _ = tx.send(LoopMsg::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn posts_execute_in_fifo_order() {
        let mut el = EventLoop::named("fifo");
        el.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();
        for i in 0..100u32 {
            let order = order.clone();
            let done_tx = done_tx.clone();
            assert!(el.post(move || {
                order.lock().push(i);
                if i == 99 {
                    done_tx.send(()).unwrap();
                }
            }));
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
        el.stop();
    }

    #[test]
    fn posts_from_inside_preserve_order_against_queued_tasks() {
        let mut el = EventLoop::new();
        el.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();

        // Hold the loop until every task below is queued, so the relative
        // order of outside posts and inside posts is deterministic.
        el.post(move || gate_rx.recv().unwrap());

        let handle = el.handle();
        let order_outer = order.clone();
        el.post(move || {
            // These land behind the tasks already queued from the outside.
            for i in [10u32, 11] {
                let order = order_outer.clone();
                let done_tx = done_tx.clone();
                handle.post(move || {
                    order.lock().push(i);
                    if i == 11 {
                        done_tx.send(()).unwrap();
                    }
                });
            }
            order_outer.lock().push(0);
        });
        for i in [1u32, 2] {
            let order = order.clone();
            el.post(move || order.lock().push(i));
        }
        gate_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 10, 11]);
        el.stop();
    }

    #[test]
    fn is_this_loop_true_only_inside() {
        let mut el = EventLoop::new();
        el.start().unwrap();
        assert!(!el.is_this_loop());

        let (tx, rx) = std_mpsc::channel();
        let handle = el.handle();
        el.post(move || tx.send(handle.is_this_loop()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        el.stop();
    }

    #[test]
    fn loop_is_reusable_after_stop() {
        let mut el = EventLoop::named("reuse");
        el.start().unwrap();
        el.stop();
        assert!(!el.is_running());

        el.start().unwrap();
        let (tx, rx) = std_mpsc::channel();
        el.post(move || tx.send(1u32).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        el.stop();
    }

    #[test]
    fn on_start_is_posted_by_start() {
        let mut el = EventLoop::new();
        let (tx, rx) = std_mpsc::channel();
        el.on_start(move || tx.send(()).unwrap());
        el.start().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        el.stop();
    }

    #[test]
    fn tasks_posted_before_start_run_after_start() {
        let mut el = EventLoop::new();
        let (tx, rx) = std_mpsc::channel();
        assert!(el.post(move || tx.send(7u32).unwrap()));
        el.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        el.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_the_loop() {
        let mut el = EventLoop::new();
        el.start().unwrap();
        el.post(|| panic!("deliberate"));
        let (tx, rx) = std_mpsc::channel();
        el.post(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        el.stop();
    }

    #[test]
    fn thread_name_truncates_at_fifteen_bytes() {
        let el = EventLoop::named("a-very-long-worker-thread-name");
        assert_eq!(el.thread_name().len(), defaults::THREAD_NAME_MAX);
        el.change_thread_name("short");
        assert_eq!(el.thread_name(), "short");
    }

    #[test]
    fn mt_start_barrier_waits_for_all_workers() {
        let mut el = MtEventLoop::new(4);
        assert_eq!(el.num_threads(), 4);

        let (tx, rx) = std_mpsc::channel();
        let probe = el.handle();
        el.on_start(move || {
            // By the time on_start runs, the whole pool must be visible.
            tx.send(probe.is_this_loop()).unwrap();
        });
        el.start().unwrap();
        assert_eq!(el.shared.thread_ids.lock().len(), 4);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        el.stop();
    }

    #[test]
    fn mt_tasks_run_on_pool_threads_only() {
        let mut el = MtEventLoop::new(4);
        el.start().unwrap();

        let seen: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = std_mpsc::channel();
        for _ in 0..64 {
            let seen = seen.clone();
            let tx = tx.clone();
            let probe = el.handle();
            el.post(move || {
                assert!(probe.is_this_loop());
                seen.lock().insert(thread::current().id());
                // Give other workers a chance to pick tasks up too.
                thread::sleep(Duration::from_millis(1));
                tx.send(()).unwrap();
            });
        }
        for _ in 0..64 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert!(seen.lock().len() <= 4);
        el.stop();
        assert!(!el.is_running());
    }

    #[test]
    fn main_loop_runs_and_stops_on_anchor_thread() {
        let ml = MainLoop::new("main-test");
        let handle = ml.handle();
        let (tx, rx) = std_mpsc::channel();
        ml.post(move || {
            tx.send(handle.is_this_loop()).unwrap();
        });
        ml.stop(); // queued behind the task above
        ml.run().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!ml.is_running());
    }
}
