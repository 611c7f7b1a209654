//! Pool of worker event loops with round-robin assignment.

use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Starts N worker loops at startup and hands them out round-robin.
///
/// With zero workers the pool collapses to a single-reactor design: every
/// request for a loop returns the base (accepting) loop.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    num_threads: usize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle, name: impl Into<String>, num_threads: usize) -> Self {
        Self {
            base_loop,
            name: name.into(),
            num_threads,
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Launch all worker loops. Returns once every loop has published
    /// itself; `next_loop` is fully usable after this.
    pub fn start(&self) -> io::Result<()> {
        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "EventLoopThreadPool::start called twice");

        let mut loops = self.loops.lock().unwrap();
        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(format!("{}-worker-{}", self.name, i));
            loops.push(thread.start()?);
            threads.push(thread);
        }
        tracing::info!("pool '{}' started {} worker loops", self.name, self.num_threads);
        Ok(())
    }

    /// Next worker loop, round-robin; the base loop when the pool is empty.
    pub fn next_loop(&self) -> LoopHandle {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[idx].clone()
        }
    }

    /// All worker loops, in start order. Empty for a single-reactor pool.
    pub fn loops(&self) -> Vec<LoopHandle> {
        self.loops.lock().unwrap().clone()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_empty_pool_returns_base_loop() {
        let event_loop = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(event_loop.handle(), "test", 0);
        pool.start().unwrap();

        let handle = pool.next_loop();
        // Base loop is owned by this thread; worker loops would not be.
        assert!(handle.is_in_loop_thread());
    }

    #[test]
    fn test_round_robin_cycles_workers() {
        let event_loop = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(event_loop.handle(), "rr", 2);
        pool.start().unwrap();

        let tid = |handle: &LoopHandle| {
            let (tx, rx) = mpsc::channel();
            handle.run_in_loop(move || {
                tx.send(std::thread::current().id()).unwrap();
            });
            rx.recv_timeout(Duration::from_secs(5)).unwrap()
        };

        let first = pool.next_loop();
        let second = pool.next_loop();
        let third = pool.next_loop();

        let t1 = tid(&first);
        let t2 = tid(&second);
        let t3 = tid(&third);

        assert_ne!(t1, t2);
        assert_eq!(t1, t3); // wrapped around
        assert_ne!(t1, std::thread::current().id());
        assert_ne!(t2, std::thread::current().id());
    }
}
