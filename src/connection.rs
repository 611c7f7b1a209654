//! Per-connection state machine.
//!
//! A `TcpConnection` owns one connected socket and one channel, both
//! pinned to a single worker loop. The shared handle may travel to any
//! thread (`send` and `shutdown` route back through the owning loop) but
//! every state transition and buffer mutation happens on that loop's
//! thread.
//!
//! Lifetime: the server registry and any user clones hold the connection;
//! during event dispatch the channel's tie holds it too, so a concurrent
//! deregistration can never free it mid-callback.

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// One established TCP connection, pinned to one worker loop.
pub struct TcpConnection {
    owner: LoopHandle,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    reading: AtomicBool,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

/// Default output-buffer threshold for the high-water-mark callback.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

impl TcpConnection {
    /// Create a connection in state `Connecting`, ready for hand-off to
    /// its worker loop. Callbacks are installed afterwards and before
    /// [`connect_established`](Self::connect_established) runs.
    pub fn new(
        owner: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("set_nodelay on [{}]: {}", name, e);
        }
        let channel = Channel::new(owner.clone(), socket.fd());

        let conn = Arc::new_cyclic(|weak: &std::sync::Weak<TcpConnection>| {
            let w = weak.clone();
            channel.set_read_callback(move |receive_time| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
            let w = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            });
            let w = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            });
            let w = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            });

            Self {
                owner,
                name,
                socket,
                channel,
                local_addr,
                peer_addr,
                state: AtomicU8::new(ConnState::Connecting as u8),
                reading: AtomicBool::new(false),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                connection_cb: Mutex::new(None),
                message_cb: Mutex::new(None),
                write_complete_cb: Mutex::new(None),
                high_water_mark_cb: Mutex::new(None),
                close_cb: Mutex::new(None),
            }
        });
        tracing::debug!("TcpConnection::new [{}] fd={}", conn.name, conn.socket.fd());
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_mark_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::SeqCst);
    }

    /// Send bytes to the peer. Callable from any thread: on the owning
    /// loop the write happens inline, elsewhere the data is copied and
    /// the send re-dispatched. Sends on a non-connected connection are
    /// dropped with a log.
    pub fn send(self: &Arc<Self>, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if self.state() != ConnState::Connected {
            tracing::warn!(
                "send on [{}] in state {:?}, dropped {} bytes",
                self.name,
                self.state(),
                data.len()
            );
            return;
        }
        if self.owner.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let conn = self.clone();
            self.owner.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Half-close the write side once the output buffer drains. Only
    /// meaningful in state `Connected`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.owner.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Finish establishment on the worker loop: register for readability,
    /// tie the channel to this connection, fire the connection callback.
    pub fn connect_established(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if self.state() != ConnState::Connecting {
            // Destroyed before the hand-off task ran (server torn down
            // between accept and establishment).
            tracing::debug!("connect_established on [{}] skipped", self.name);
            return;
        }
        self.set_state(ConnState::Connected);
        self.reading.store(true, Ordering::SeqCst);

        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();

        let cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown on the worker loop: unregister the channel and, if
    /// the close path never ran, emit the disconnect notification.
    /// Idempotent relative to `handle_close`.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if self.state() != ConnState::Disconnected {
            self.set_state(ConnState::Disconnected);
            self.reading.store(false, Ordering::SeqCst);
            self.channel.disable_all();
            let cb = self.connection_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.channel.remove();
        tracing::debug!("TcpConnection::connect_destroyed [{}]", self.name);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.owner.assert_in_loop_thread();

        let mut saw_eof = false;
        let mut read_error: Option<io::Error> = None;
        let mut newly_read = 0usize;
        {
            let mut input = self.input.lock().unwrap();
            loop {
                match input.read_fd(self.channel.fd()) {
                    Ok(0) => {
                        saw_eof = true;
                        break;
                    }
                    Ok(n) => newly_read += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                }
            }
        }

        // Data observed in the same cycle as a close is still delivered
        // first.
        if newly_read > 0 {
            let cb = self.message_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                let mut input = self.input.lock().unwrap();
                cb(self, &mut input, receive_time);
            }
        }

        if saw_eof {
            self.handle_close();
        } else if let Some(e) = read_error {
            tracing::error!("TcpConnection::handle_read [{}]: {}", self.name, e);
            self.handle_error();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();

        if !self.channel.is_writing() {
            tracing::trace!("connection [{}] is down, no more writing", self.name);
            return;
        }

        let mut drained = false;
        {
            let mut output = self.output.lock().unwrap();
            loop {
                if output.is_empty() {
                    drained = true;
                    break;
                }
                match self.socket.write(output.peek()) {
                    Ok(n) => output.retrieve(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // The close arrives through the poller; just report.
                        tracing::error!("TcpConnection::handle_write [{}]: {}", self.name, e);
                        break;
                    }
                }
            }
        }

        if drained {
            self.channel.disable_writing();
            let cb = self.write_complete_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                let conn = self.clone();
                self.owner.queue_in_loop(move || cb(&conn));
            }
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.owner.assert_in_loop_thread();
        let len = data.len();

        if self.state() == ConnState::Disconnected {
            tracing::warn!("send_in_loop on disconnected [{}], giving up", self.name);
            return;
        }

        let mut wrote = 0usize;
        let mut fault = false;

        // Try the socket directly only when nothing is queued ahead;
        // otherwise bytes would overtake the buffered backlog.
        let output_empty = self.output.lock().unwrap().is_empty();
        if !self.channel.is_writing() && output_empty {
            match self.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == len {
                        let cb = self.write_complete_cb.lock().unwrap().clone();
                        if let Some(cb) = cb {
                            let conn = self.clone();
                            self.owner.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!("TcpConnection::send_in_loop [{}]: {}", self.name, e);
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && wrote < len {
            let mut output = self.output.lock().unwrap();
            let old_len = output.len();
            let new_len = old_len + len - wrote;
            let threshold = self.high_water_mark.load(Ordering::SeqCst);

            // Upward crossing only; the downward edge is the
            // write-complete callback's job.
            if new_len >= threshold && old_len < threshold {
                let cb = self.high_water_mark_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    let conn = self.clone();
                    self.owner.queue_in_loop(move || cb(&conn, new_len));
                }
            }

            output.append(&data[wrote..]);
            drop(output);

            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.owner.assert_in_loop_thread();
        // Data still queued: handle_write performs the half-close after
        // the drain.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        let state = self.state();
        if state == ConnState::Disconnected {
            return;
        }
        tracing::debug!(
            "TcpConnection::handle_close [{}] state={:?}",
            self.name,
            state
        );

        self.set_state(ConnState::Disconnected);
        self.reading.store(false, Ordering::SeqCst);
        self.channel.disable_all();

        let conn = self.clone();
        let connection_cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = connection_cb {
            cb(&conn);
        }
        let close_cb = self.close_cb.lock().unwrap().clone();
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        match self.socket.take_error() {
            Some(e) => tracing::error!("TcpConnection::handle_error [{}]: {}", self.name, e),
            None => tracing::error!("TcpConnection::handle_error [{}]: unknown", self.name),
        }
        if self.state() != ConnState::Disconnected {
            self.handle_close();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        tracing::debug!(
            "TcpConnection::drop [{}] state={:?}",
            self.name,
            self.state()
        );
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
