//! Channel: the reactor's record for one file descriptor.
//!
//! A channel binds an fd to its interest set and per-event callbacks. It
//! never owns the fd; the owning object (connection, acceptor, the loop's
//! wakeup descriptor) does. All mutation happens on the owning loop's
//! thread; the mutex guarding the state exists so owners can live inside
//! `Arc`s shared across threads, not for contention.

use crate::event_loop::LoopHandle;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

pub(crate) type ReadCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub(crate) type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Registration state a channel has with its poller.
///
/// `Parked` means the channel is still in the poller's map but its fd is
/// deregistered from the multiplexer (interest went empty); re-enabling
/// must re-register rather than modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    New,
    Added,
    Parked,
}

/// Readiness observed by the poller in the current cycle.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Revents {
    pub readable: bool,
    pub writable: bool,
    pub hang_up: bool,
    pub error: bool,
}

struct ChannelState {
    reading: bool,
    writing: bool,
    revents: Revents,
    poller_state: PollerState,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

/// One fd's interest set and event callbacks, bound to one loop.
pub(crate) struct Channel {
    fd: RawFd,
    owner: LoopHandle,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(owner: LoopHandle, fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            owner,
            state: Mutex::new(ChannelState {
                reading: false,
                writing: false,
                revents: Revents::default(),
                poller_state: PollerState::New,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
                tie: None,
            }),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn owner(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn set_read_callback(&self, cb: impl Fn(Instant) + Send + Sync + 'static) {
        self.state.lock().unwrap().read_cb = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().write_cb = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().close_cb = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().error_cb = Some(Arc::new(cb));
    }

    /// Install a weak back-reference to the owning object. Once tied,
    /// event dispatch upgrades the reference and holds it strong for the
    /// duration, so the owner cannot be destroyed mid-dispatch.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.state.lock().unwrap().tie = Some(Arc::downgrade(owner));
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.state.lock().unwrap().reading
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.state.lock().unwrap().writing
    }

    #[inline]
    pub fn is_none_interest(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.reading && !state.writing
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.state.lock().unwrap().reading = true;
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.state.lock().unwrap().reading = false;
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.state.lock().unwrap().writing = true;
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.state.lock().unwrap().writing = false;
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.reading = false;
            state.writing = false;
        }
        self.update();
    }

    /// Remove this channel from its loop's poller. Must be called before
    /// the owning object releases the fd.
    pub fn remove(self: &Arc<Self>) {
        self.owner.remove_channel(self);
    }

    fn update(self: &Arc<Self>) {
        self.owner.update_channel(self);
    }

    // Poller-side accessors.

    pub(crate) fn poller_state(&self) -> PollerState {
        self.state.lock().unwrap().poller_state
    }

    pub(crate) fn set_poller_state(&self, poller_state: PollerState) {
        self.state.lock().unwrap().poller_state = poller_state;
    }

    pub(crate) fn interest(&self) -> (bool, bool) {
        let state = self.state.lock().unwrap();
        (state.reading, state.writing)
    }

    pub(crate) fn set_revents(&self, revents: Revents) {
        self.state.lock().unwrap().revents = revents;
    }

    /// Dispatch the revents recorded by the poller.
    ///
    /// Order matters: hang-up without readable data closes; errors report;
    /// readable data is always delivered before any close initiated by the
    /// read path; writable runs last.
    pub fn handle_event(self: &Arc<Self>, receive_time: Instant) {
        let (revents, tie, read_cb, write_cb, close_cb, error_cb) = {
            let state = self.state.lock().unwrap();
            (
                state.revents,
                state.tie.clone(),
                state.read_cb.clone(),
                state.write_cb.clone(),
                state.close_cb.clone(),
                state.error_cb.clone(),
            )
        };

        // Keep the owner alive across dispatch; skip entirely if it is
        // already gone.
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match &tie {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                None => {
                    tracing::trace!("channel fd={} owner gone, skipping dispatch", self.fd);
                    return;
                }
            },
            None => None,
        };

        if revents.hang_up && !revents.readable {
            if let Some(cb) = &close_cb {
                cb();
            }
        }
        if revents.error {
            if let Some(cb) = &error_cb {
                cb();
            }
        }
        if revents.readable {
            if let Some(cb) = &read_cb {
                cb(receive_time);
            }
        }
        if revents.writable {
            if let Some(cb) = &write_cb {
                cb();
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("reading", &state.reading)
            .field("writing", &state.writing)
            .field("poller_state", &state.poller_state)
            .finish()
    }
}
