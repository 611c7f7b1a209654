//! Thread wrapper with synchronous identity publication.
//!
//! Downstream code (the loop registry in the pool) needs the worker's
//! thread id the moment `start` returns; a plain `thread::spawn` gives no
//! such guarantee. The wrapper makes the spawned thread publish its id
//! over a handshake channel before the user closure runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

static NUM_CREATED: AtomicUsize = AtomicUsize::new(0);

/// A named worker thread whose id is observable once started.
///
/// A started but never joined thread detaches when the wrapper drops.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: Option<ThreadId>,
    name: String,
}

impl Thread {
    /// Create a wrapper. `name` may be empty; a default `thread-N` name is
    /// assigned then.
    pub fn new(name: impl Into<String>) -> Self {
        let mut name = name.into();
        let num = NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1;
        if name.is_empty() {
            name = format!("thread-{}", num);
        }
        Self {
            handle: None,
            tid: None,
            name,
        }
    }

    /// Spawn the worker running `func`. Blocks until the worker has
    /// published its thread id, so `tid()` is `Some` on return.
    ///
    /// # Panics
    /// Panics if the thread was already started or the spawn fails.
    pub fn start(&mut self, func: impl FnOnce() + Send + 'static) {
        assert!(self.handle.is_none(), "Thread::start called twice");

        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                tx.send(thread::current().id())
                    .expect("starter vanished before the id handshake");
                func();
            })
            .expect("failed to spawn worker thread");

        let tid = rx.recv().expect("worker died before publishing its id");
        self.tid = Some(tid);
        self.handle = Some(handle);
    }

    /// Wait for the worker to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("worker thread panicked");
        }
    }

    pub fn started(&self) -> bool {
        self.tid.is_some()
    }

    /// The worker's thread id; `None` until started.
    pub fn tid(&self) -> Option<ThreadId> {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Dropping the JoinHandle detaches the worker.
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_start_publishes_tid() {
        let mut t = Thread::new("test-worker");
        assert!(!t.started());
        assert!(t.tid().is_none());

        let (tx, rx) = crossbeam_channel::bounded(1);
        t.start(move || {
            tx.send(thread::current().id()).unwrap();
        });

        // The id is observable the moment start returns.
        let published = t.tid().unwrap();
        assert!(t.started());
        assert_eq!(rx.recv().unwrap(), published);
        assert_ne!(published, thread::current().id());
        t.join();
    }

    #[test]
    fn test_default_name() {
        let t = Thread::new("");
        assert!(t.name().starts_with("thread-"));
    }

    #[test]
    fn test_join_runs_to_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let mut t = Thread::new("join-worker");
        t.start(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            d.store(true, Ordering::SeqCst);
        });
        t.join();
        assert!(done.load(Ordering::SeqCst));
    }
}
