//! Accepting-loop listener.
//!
//! Owns the listening socket and its channel on the accepting loop. On
//! readability it drains the accept queue and hands each connected socket
//! to the new-connection callback. Running out of fds must not kill the
//! accept loop: a reserved idle fd is sacrificed to accept-and-close one
//! connection, shedding load instead of spinning on EMFILE.

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Receives each accepted socket together with the peer address.
pub type NewConnectionCallback = Arc<dyn Fn(Socket, SocketAddr) + Send + Sync>;

pub struct Acceptor {
    owner: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<OwnedFd>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Create a bound, listening (but not yet accepting) socket on the
    /// given loop.
    pub fn new(
        owner: LoopHandle,
        address: SocketAddr,
        backlog: u32,
        reuse_address: bool,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let socket = Socket::bind_listen(address, backlog, reuse_address, reuse_port)?;
        let idle_fd = open_idle_fd()?;
        let channel = Channel::new(owner.clone(), socket.fd());

        let acceptor = Arc::new_cyclic(|weak: &std::sync::Weak<Acceptor>| {
            let w = weak.clone();
            channel.set_read_callback(move |_| {
                if let Some(acceptor) = w.upgrade() {
                    acceptor.handle_read();
                }
            });
            Self {
                owner,
                socket,
                channel,
                listening: AtomicBool::new(false),
                idle_fd: Mutex::new(Some(idle_fd)),
                new_connection_cb: Mutex::new(None),
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Start accepting. Must run on the accepting loop.
    pub fn listen(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);
        self.channel.enable_reading();
    }

    /// Stop accepting and drop the poller registration. Must run on the
    /// accepting loop; the listening socket closes when the acceptor does.
    pub fn stop(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        self.listening.store(false, Ordering::SeqCst);
        self.channel.disable_all();
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();

        loop {
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    let cb = self.new_connection_cb.lock().unwrap().clone();
                    match (Socket::from_accepted(socket), cb) {
                        (Ok(socket), Some(cb)) => cb(socket, peer),
                        (Ok(socket), None) => {
                            // No consumer installed: explicit drop semantics.
                            tracing::warn!(
                                "acceptor: no new-connection callback, dropping peer {}",
                                peer
                            );
                            drop(socket);
                        }
                        (Err(e), _) => {
                            tracing::error!("acceptor: accepted socket setup failed: {}", e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_fd_exhaustion(&e) => {
                    tracing::error!("acceptor: fd exhausted ({}), shedding one connection", e);
                    self.shed_one_connection();
                }
                Err(e) => {
                    tracing::error!("acceptor: accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Free the reserved fd, accept-and-close one pending connection, then
    /// re-reserve. The peer sees an orderly close instead of a hung
    /// half-open connection.
    fn shed_one_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        idle.take();
        match self.socket.accept() {
            Ok((socket, peer)) => {
                tracing::warn!("acceptor: shed connection from {}", peer);
                drop(socket);
            }
            Err(e) => tracing::debug!("acceptor: shed accept failed: {}", e),
        }
        match open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(e) => tracing::error!("acceptor: cannot re-reserve idle fd: {}", e),
        }
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
