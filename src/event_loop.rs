//! The reactor: one loop per thread, driven by readiness events.
//!
//! An [`EventLoop`] is constructed and run on its owning thread; the
//! cloneable [`LoopHandle`] is the cross-thread face. Any thread may hand
//! work to a loop through [`LoopHandle::run_in_loop`]; the loop is woken
//! from its poll wait by an eventfd write.

use crate::channel::Channel;
use crate::poller::Poller;
use crate::stats::{LoopStats, LoopStatsSnapshot};
use std::cell::Cell;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Upper bound on a single poller wait. Liveness only: quit and queued
/// tasks are noticed no later than this, wakeups make it immediate.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// One-loop-per-thread sentinel. Set by `EventLoop::new`, cleared by
    /// its drop; a second construction in the same thread is a bug.
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

struct Shared {
    thread_id: ThreadId,
    wakeup_fd: OwnedFd,
    quit: AtomicBool,
    looping: AtomicBool,
    running_tasks: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    poller: Poller,
    stats: LoopStats,
}

/// Cloneable, `Send + Sync` handle to one event loop.
///
/// Everything that may legally be called from a foreign thread lives
/// here; operations that touch loop-owned state assert the caller is on
/// the owning thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// True when the calling thread owns this loop.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Panic unless called on the owning thread. This assertion is the
    /// linchpin of the concurrency model: every loop-owned object is
    /// mutated behind it.
    #[track_caller]
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop owned by thread {:?} was accessed from thread {:?} ({})",
                self.shared.thread_id,
                thread::current().id(),
                thread::current().name().unwrap_or("unnamed"),
            );
        }
    }

    /// Run `task` on the owning thread: inline when already there,
    /// otherwise deferred through the task queue.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the deferred queue and wake the loop when needed:
    /// always for a foreign caller, and for the owning thread when the
    /// loop is inside the deferred-task phase (tasks queued there must not
    /// wait out a full poll).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut tasks = self.shared.tasks.lock().unwrap();
            tasks.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.running_tasks.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Ask the loop to exit at the next iteration head. Idempotent; a
    /// stopped loop stays stopped. Cross-thread callers also wake the
    /// loop so the request is seen within one cycle, not one timeout.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Activity counters for this loop.
    pub fn stats(&self) -> LoopStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.shared.poller.has_channel(channel)
    }

    /// Write one 8-byte count to the wakeup descriptor. A short write is
    /// reported but not fatal: the loop is merely not woken early.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            tracing::error!("wakeup write returned {} instead of 8", n);
        }
        self.shared.stats.inc_wakeup();
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .finish()
    }
}

/// A reactor bound to the thread that constructed it.
///
/// Owns the poller-driving state and the wakeup channel. Must be run and
/// dropped on its owning thread.
pub struct EventLoop {
    handle: LoopHandle,
    wakeup_channel: Arc<Channel>,
    active: Vec<Arc<Channel>>,
    poll_return_time: Instant,
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    ///
    /// # Panics
    /// Panics if this thread already owns a loop.
    pub fn new() -> io::Result<Self> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!(
                    "another EventLoop already exists in thread {:?} ({})",
                    thread::current().id(),
                    thread::current().name().unwrap_or("unnamed"),
                );
            }
        });

        let poller = Poller::new()?;
        let wakeup_fd = create_eventfd()?;

        let shared = Arc::new(Shared {
            thread_id: thread::current().id(),
            wakeup_fd,
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            running_tasks: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            poller,
            stats: LoopStats::new(),
        });
        let handle = LoopHandle {
            shared: shared.clone(),
        };

        let wakeup_channel = Channel::new(handle.clone(), shared.wakeup_fd.as_raw_fd());
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        wakeup_channel.set_read_callback(move |_| {
            if let Some(shared) = weak.upgrade() {
                drain_wakeup(shared.wakeup_fd.as_raw_fd());
            }
        });

        LOOP_IN_THIS_THREAD.with(|flag| flag.set(true));
        tracing::debug!(
            "EventLoop created in thread {:?}",
            thread::current().id()
        );

        // Every loop watches its own wakeup descriptor from the start.
        wakeup_channel.enable_reading();

        Ok(Self {
            handle,
            wakeup_channel,
            active: Vec::new(),
            poll_return_time: Instant::now(),
        })
    }

    /// Handle usable from any thread.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run the reactor until [`LoopHandle::quit`] is observed.
    ///
    /// Each iteration: poll, dispatch active channels in poller order,
    /// then run deferred tasks.
    ///
    /// # Panics
    /// Panics if called from a foreign thread or while already running.
    pub fn run(&mut self) {
        self.handle.assert_in_loop_thread();
        let shared = self.handle.shared.clone();
        if shared.looping.swap(true, Ordering::SeqCst) {
            panic!("EventLoop::run called while already looping");
        }

        tracing::info!("EventLoop start looping");

        while !shared.quit.load(Ordering::SeqCst) {
            self.active.clear();
            match shared.poller.poll(POLL_TIMEOUT, &mut self.active) {
                Ok(t) => self.poll_return_time = t,
                Err(e) => {
                    tracing::error!("poller wait failed: {}", e);
                    continue;
                }
            }
            shared.stats.inc_poll();
            shared.stats.add_events(self.active.len() as u64);

            for channel in &self.active {
                channel.handle_event(self.poll_return_time);
            }

            self.run_pending_tasks();
        }

        shared.looping.store(false, Ordering::SeqCst);
        tracing::info!("EventLoop stop looping");
    }

    /// Wall-clock instant of the last poll return.
    pub fn poll_return_time(&self) -> Instant {
        self.poll_return_time
    }

    fn run_pending_tasks(&self) {
        let shared = &self.handle.shared;
        shared.running_tasks.store(true, Ordering::SeqCst);

        let tasks: Vec<Task> = {
            let mut queue = shared.tasks.lock().unwrap();
            std::mem::take(&mut *queue)
        };

        // Tasks run without the queue lock; anything they enqueue lands in
        // the next iteration (the wakeup above guarantees there is one
        // promptly).
        let count = tasks.len() as u64;
        for task in tasks {
            task();
        }
        shared.stats.add_tasks(count);

        shared.running_tasks.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        tracing::debug!("EventLoop destroyed in thread {:?}", thread::current().id());
    }
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Drain the wakeup counter. Multiple wakeups coalesce into one read;
/// that is the point of using a counter.
fn drain_wakeup(fd: RawFd) {
    let mut count: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        tracing::error!("wakeup read returned {} instead of 8", n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_run_in_loop_is_inline_on_owning_thread() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        handle.run_in_loop(move || r.store(true, Ordering::SeqCst));
        // Inline execution: observable before the loop ever runs.
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quit_before_run_returns_immediately() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        handle.quit();
        handle.quit(); // idempotent

        let start = Instant::now();
        event_loop.run();
        assert!(start.elapsed() < Duration::from_secs(1));
        // Quit is observed at the loop head: no poll happened.
        assert_eq!(handle.stats().polls, 0);
    }

    #[test]
    fn test_cross_thread_task_runs_on_loop_thread() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let loop_tid = thread::current().id();

        let (tx, rx) = mpsc::channel();
        let h = handle.clone();
        let sender = thread::spawn(move || {
            assert!(!h.is_in_loop_thread());
            let tx = tx.clone();
            let h2 = h.clone();
            h.run_in_loop(move || {
                tx.send(thread::current().id()).unwrap();
                h2.quit();
            });
        });

        event_loop.run();
        sender.join().unwrap();
        assert_eq!(rx.recv().unwrap(), loop_tid);
    }

    #[test]
    fn test_queue_from_task_phase_forces_wakeup() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let order = Arc::new(Mutex::new(Vec::new()));
        let baseline = handle.stats().wakeups;

        let h = handle.clone();
        let o = order.clone();
        let seeder = thread::spawn(move || {
            let h2 = h.clone();
            let o2 = o.clone();
            h.queue_in_loop(move || {
                o2.lock().unwrap().push("first");
                let h3 = h2.clone();
                let o3 = o2.clone();
                // Queued from inside the deferred-task phase on the loop
                // thread: must wake the loop even though the caller owns it.
                h2.queue_in_loop(move || {
                    o3.lock().unwrap().push("second");
                    h3.quit();
                });
            });
        });

        let start = Instant::now();
        event_loop.run();
        seeder.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(handle.stats().wakeups > baseline + 1);
        // Without the in-phase wakeup the second task would wait out the
        // 10s poll timeout.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_quit_from_foreign_thread_unblocks_poll() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.quit();
        });

        let start = Instant::now();
        event_loop.run();
        quitter.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_second_loop_in_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let second = std::panic::catch_unwind(EventLoop::new);
        assert!(second.is_err());
    }

    #[test]
    fn test_sentinel_cleared_after_drop() {
        {
            let _event_loop = EventLoop::new().unwrap();
        }
        // The previous loop is gone; this thread may own a new one.
        let _second = EventLoop::new().unwrap();
    }
}
