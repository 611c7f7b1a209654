//! Readiness multiplexer.
//!
//! Wraps `mio::Poll` (epoll on Linux, kqueue on the BSDs) and keeps the
//! fd → channel map. The map holds weak references: channels are owned by
//! their connections, acceptor, or loop, and must be removed here before
//! the owner releases the fd.
//!
//! mio registers edge-triggered, so every consumer in this crate drains
//! its fd until `WouldBlock` before returning to the loop.

use crate::channel::{Channel, PollerState, Revents};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

const EVENTS_CAPACITY: usize = 1024;

struct PollerInner {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Weak<Channel>>,
}

/// One loop's multiplexer and channel registry.
///
/// Only the owning loop's thread calls in here (asserted one level up, on
/// the loop handle), so the mutex is uncontended; it exists to let the
/// poller sit inside the loop's shared, cross-thread state.
pub(crate) struct Poller {
    inner: Mutex<PollerInner>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Mutex::new(PollerInner {
                poll: Poll::new()?,
                events: Events::with_capacity(EVENTS_CAPACITY),
                channels: HashMap::new(),
            }),
        })
    }

    /// Block up to `timeout` and collect every channel with observed
    /// events into `active`, recording each channel's revents first.
    /// Interruption yields an empty active set.
    pub fn poll(&self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> io::Result<Instant> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        match inner.poll.poll(&mut inner.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Instant::now()),
            Err(e) => return Err(e),
        }
        let now = Instant::now();

        for event in inner.events.iter() {
            let fd = event.token().0 as RawFd;
            let channel = match inner.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => channel,
                None => {
                    tracing::debug!("poller: stale event for fd={}", fd);
                    continue;
                }
            };
            channel.set_revents(Revents {
                readable: event.is_readable() || event.is_priority(),
                writable: event.is_writable(),
                hang_up: event.is_read_closed() && event.is_write_closed(),
                error: event.is_error(),
            });
            active.push(channel);
        }

        Ok(now)
    }

    /// Register, re-register, or park a channel according to its current
    /// interest set and registration state.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        let mut inner = self.inner.lock().unwrap();
        let fd = channel.fd();
        let interest = mio_interest(channel.interest());

        match channel.poller_state() {
            PollerState::New | PollerState::Parked => {
                if channel.poller_state() == PollerState::New {
                    inner.channels.insert(fd, Arc::downgrade(channel));
                }
                // A parked fd was deregistered; both cases need a fresh
                // registration, never a modify.
                if let Some(interest) = interest {
                    if let Err(e) =
                        inner
                            .poll
                            .registry()
                            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
                    {
                        tracing::error!("poller: register fd={}: {}", fd, e);
                        return;
                    }
                    channel.set_poller_state(PollerState::Added);
                } else {
                    channel.set_poller_state(PollerState::Parked);
                }
            }
            PollerState::Added => {
                if let Some(interest) = interest {
                    if let Err(e) = inner.poll.registry().reregister(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        interest,
                    ) {
                        tracing::error!("poller: reregister fd={}: {}", fd, e);
                    }
                } else {
                    if let Err(e) = inner.poll.registry().deregister(&mut SourceFd(&fd)) {
                        tracing::error!("poller: deregister fd={}: {}", fd, e);
                    }
                    channel.set_poller_state(PollerState::Parked);
                }
            }
        }
    }

    /// Erase a channel from the map, deregistering if currently added.
    /// Safe to call for a channel that was already removed.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        let mut inner = self.inner.lock().unwrap();
        let fd = channel.fd();
        debug_assert!(channel.is_none_interest());

        if inner.channels.remove(&fd).is_some() && channel.poller_state() == PollerState::Added {
            if let Err(e) = inner.poll.registry().deregister(&mut SourceFd(&fd)) {
                tracing::error!("poller: deregister fd={}: {}", fd, e);
            }
        }
        channel.set_poller_state(PollerState::New);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .get(&channel.fd())
            .and_then(Weak::upgrade)
            .map(|found| Arc::ptr_eq(&found, channel))
            .unwrap_or(false)
    }
}

fn mio_interest((reading, writing): (bool, bool)) -> Option<Interest> {
    match (reading, writing) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_enable_then_disable_leaves_parked_entry() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let channel = Channel::new(handle.clone(), b.as_raw_fd());

        channel.enable_reading();
        assert!(handle.has_channel(&channel));
        assert_eq!(channel.poller_state(), PollerState::Added);

        channel.disable_reading();
        // Interest is empty: deregistered from the multiplexer but still
        // known to the poller.
        assert!(handle.has_channel(&channel));
        assert_eq!(channel.poller_state(), PollerState::Parked);

        channel.remove();
        assert!(!handle.has_channel(&channel));
        assert_eq!(channel.poller_state(), PollerState::New);
    }

    #[test]
    fn test_reenabled_channel_is_reregistered() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let channel = Channel::new(handle.clone(), b.as_raw_fd());

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let h = handle.clone();
        let ch = channel.clone();
        let peer = Mutex::new(a.try_clone().unwrap());
        channel.set_read_callback(move |_| {
            let mut scratch = [0u8; 64];
            while unsafe {
                libc::read(
                    ch.fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            } > 0
            {}
            let n = f.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First event: park and re-enable, which must re-register
                // the fd with the multiplexer, then provoke a second event.
                ch.disable_all();
                ch.enable_reading();
                peer.lock().unwrap().write_all(b"again").unwrap();
            } else {
                h.quit();
            }
        });

        channel.enable_reading();
        a.write_all(b"first").unwrap();

        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        channel.disable_all();
        channel.remove();
    }
}
