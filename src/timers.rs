//! Scoped timer handles.
//!
//! Cancellation works through a monotonically incremented generation id:
//! arming or stopping a timer bumps the generation, and a pending fire whose
//! captured generation no longer matches is a no-op. The underlying runtime
//! needs no cheap timer cancellation for this to hold; a fire that was
//! already dispatched before the bump may still run its stale check, but the
//! user callback never does.
//!
//! The callback always executes on the loop the timer is attached to, in a
//! gap between posted tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::event_loop::{EventLoop, LoopHandle};

/// A one-shot timer bound to a loop.
pub struct Timer {
    loop_handle: LoopHandle,
    generation: Arc<AtomicU64>,
}

impl Timer {
    pub fn new(loop_handle: LoopHandle) -> Self {
        Timer {
            loop_handle,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arms the timer to fire `callback` once after `delay`. Re-arming
    /// cancels the previous schedule.
    pub fn start(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let loop_handle = self.loop_handle.clone();

        let spawned = self.loop_handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let check = generation.clone();
            loop_handle.post(move || {
                // Authoritative staleness check, on the loop itself.
                if check.load(Ordering::SeqCst) == armed {
                    callback();
                }
            });
        });
        if !spawned {
            warn!("timer armed against a stopped loop; it will never fire");
        }
    }

    /// Cancels any pending fire. Idempotent.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A periodic timer bound to a loop.
///
/// Each firing is scheduled `interval` after the *start* of the previous
/// run, giving a steady cadence, but a run is never entered while the
/// previous one is still executing: completion is awaited before re-arming.
pub struct PeriodicalTimer {
    loop_handle: LoopHandle,
    generation: Arc<AtomicU64>,
}

impl PeriodicalTimer {
    pub fn new(loop_handle: LoopHandle) -> Self {
        PeriodicalTimer {
            loop_handle,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arms the timer to fire `callback` every `interval`, first firing one
    /// `interval` from now.
    pub fn start(&self, interval: Duration, callback: impl Fn() + Send + Sync + 'static) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let loop_handle = self.loop_handle.clone();
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(callback);

        let spawned = self.loop_handle.spawn(async move {
            let mut next = Instant::now() + interval;
            loop {
                tokio::time::sleep_until(next).await;
                if generation.load(Ordering::SeqCst) != armed {
                    break;
                }
                let (done_tx, done_rx) = oneshot::channel();
                let check = generation.clone();
                let run = callback.clone();
                let posted = loop_handle.post(move || {
                    let began = Instant::now();
                    if check.load(Ordering::SeqCst) == armed {
                        run();
                    }
                    let _ = done_tx.send(began);
                });
                if !posted {
                    break;
                }
                match done_rx.await {
                    // Steady cadence: re-arm relative to when the run began.
                    Ok(began) => next = began + interval,
                    Err(_) => break,
                }
            }
        });
        if !spawned {
            warn!("periodical timer armed against a stopped loop; it will never fire");
        }
    }

    /// Cancels the schedule. Idempotent.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for PeriodicalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A one-shot timer bundled with its own dedicated, named loop, for callers
/// that have no loop of their own to attach to.
pub struct SoloTimer {
    event_loop: EventLoop,
    timer: Option<Timer>,
}

impl SoloTimer {
    pub fn new() -> Self {
        Self::named("timer")
    }

    pub fn named(thread_name: &str) -> Self {
        SoloTimer {
            event_loop: EventLoop::named(thread_name),
            timer: None,
        }
    }

    pub fn start(
        &mut self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> anyhow::Result<()> {
        self.event_loop.start()?;
        let timer = Timer::new(self.event_loop.handle());
        timer.start(delay, callback);
        self.timer = Some(timer);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.timer = None;
        self.event_loop.stop();
    }
}

impl Default for SoloTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// A periodic timer with its own dedicated, named loop.
pub struct SoloPeriodicalTimer {
    event_loop: EventLoop,
    timer: Option<PeriodicalTimer>,
}

impl SoloPeriodicalTimer {
    pub fn new() -> Self {
        Self::named("timer")
    }

    pub fn named(thread_name: &str) -> Self {
        SoloPeriodicalTimer {
            event_loop: EventLoop::named(thread_name),
            timer: None,
        }
    }

    pub fn start(
        &mut self,
        interval: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        self.event_loop.start()?;
        let timer = PeriodicalTimer::new(self.event_loop.handle());
        timer.start(interval, callback);
        self.timer = Some(timer);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.timer = None;
        self.event_loop.stop();
    }
}

impl Default for SoloPeriodicalTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    #[test]
    fn one_shot_timer_fires_once() {
        let mut el = EventLoop::new();
        el.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let _timer = el.post_after(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        el.stop();
    }

    #[test]
    fn stopped_timer_never_fires() {
        let mut el = EventLoop::new();
        el.start().unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_probe = fired.clone();
        let timer = Timer::new(el.handle());
        timer.start(Duration::from_millis(80), move || {
            fired_probe.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        el.stop();
    }

    #[test]
    fn dropping_timer_cancels_it() {
        let mut el = EventLoop::new();
        el.start().unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_probe = fired.clone();
        {
            let _timer = el.post_after(Duration::from_millis(80), move || {
                fired_probe.fetch_add(1, Ordering::SeqCst);
            });
        }

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        el.stop();
    }

    #[test]
    fn periodical_timer_repeats_until_stopped() {
        let mut el = EventLoop::new();
        el.start().unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let count_probe = count.clone();
        let (tx, rx) = mpsc::channel();
        let timer = el.repeat(Duration::from_millis(10), move || {
            if count_probe.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                tx.send(()).unwrap();
            }
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        timer.stop();
        let settled = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        // At most one dispatched-but-unchecked fire can slip in after stop.
        assert!(count.load(Ordering::SeqCst) <= settled + 1);
        el.stop();
    }

    #[test]
    fn solo_timer_runs_on_its_own_loop() {
        let (tx, rx) = mpsc::channel();
        let mut timer = SoloTimer::named("solo-test");
        timer
            .start(Duration::from_millis(10), move || {
                tx.send(std::thread::current().name().map(String::from)).unwrap();
            })
            .unwrap();
        let fired_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired_on.as_deref(), Some("solo-test"));
        timer.stop();
    }
}
