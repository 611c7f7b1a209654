//! A thread that owns and runs exactly one event loop.

use crate::event_loop::{EventLoop, LoopHandle};
use crate::thread::Thread;
use std::io;

/// Launches a worker thread whose entire life is one `EventLoop::run`.
///
/// Dropping the wrapper quits the loop and joins the thread.
pub struct EventLoopThread {
    thread: Thread,
    handle: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            thread: Thread::new(name),
            handle: None,
        }
    }

    /// Start the worker and return its loop handle. Blocks until the loop
    /// exists and has published itself, so the handle is immediately
    /// dispatchable.
    pub fn start(&mut self) -> io::Result<LoopHandle> {
        assert!(self.handle.is_none(), "EventLoopThread::start called twice");

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.thread.start(move || {
            let mut event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    // The starter is blocked on the handshake; deliver the
                    // failure there instead of poisoning the thread.
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            if tx.send(Ok(event_loop.handle())).is_err() {
                return;
            }
            event_loop.run();
        });

        let handle = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "loop thread died at startup"))??;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Handle of the running loop; `None` before start.
    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
            self.thread.join();
        }
    }
}
