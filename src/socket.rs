//! Owned socket wrappers.
//!
//! Thin layer over `socket2` so the rest of the crate deals in raw fds,
//! `std::net::SocketAddr`, and `io::Result` only. The socket is closed
//! when the wrapper drops.

use socket2::{Domain, Protocol, SockAddr, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// An owned non-blocking stream socket (listening or connected).
pub struct Socket {
    inner: socket2::Socket,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd()).finish()
    }
}

impl Socket {
    /// Create a listening socket: non-blocking, bound, and listening with
    /// the given backlog.
    pub(crate) fn bind_listen(
        addr: SocketAddr,
        backlog: u32,
        reuse_address: bool,
        reuse_port: bool,
    ) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        if reuse_address {
            socket.set_reuse_address(true)?;
        }
        if reuse_port {
            set_reuse_port(socket.as_raw_fd())?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog as i32)?;

        Ok(Self { inner: socket })
    }

    /// Wrap a freshly accepted socket, switching it to non-blocking mode.
    pub(crate) fn from_accepted(inner: socket2::Socket) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Accept one pending connection. The accepted socket inherits
    /// close-on-exec; the caller wraps it with [`Socket::from_accepted`].
    pub(crate) fn accept(&self) -> io::Result<(socket2::Socket, SocketAddr)> {
        let (socket, addr) = self.inner.accept()?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((socket, addr))
    }

    #[inline]
    pub(crate) fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    /// Half-close the write side. Failure is logged, not propagated: the
    /// peer may already have reset the connection.
    pub(crate) fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            tracing::error!("shutdown_write fd={}: {}", self.fd(), e);
        }
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    /// Pending SO_ERROR on the socket, if any.
    pub(crate) fn take_error(&self) -> Option<io::Error> {
        match self.inner.take_error() {
            Ok(err) => err,
            Err(e) => Some(e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
    }
}

/// SO_REUSEPORT is not covered by socket2's portable surface; set it raw.
fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listen_ephemeral() {
        let socket =
            Socket::bind_listen("127.0.0.1:0".parse().unwrap(), 128, true, false).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_accept_would_block() {
        let socket =
            Socket::bind_listen("127.0.0.1:0".parse().unwrap(), 128, true, false).unwrap();
        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_accept_and_write() {
        use std::io::Read;

        let listener =
            Socket::bind_listen("127.0.0.1:0".parse().unwrap(), 128, true, false).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();

        // Non-blocking accept may race the connect; spin briefly.
        let accepted = loop {
            match listener.accept() {
                Ok((socket, _)) => break Socket::from_accepted(socket).unwrap(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept: {}", e),
            }
        };

        assert_eq!(accepted.write(b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_reuse_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = Socket::bind_listen(addr, 128, true, true).unwrap();
        let bound = first.local_addr().unwrap();
        // Second listener on the same port only succeeds with SO_REUSEPORT.
        let second = Socket::bind_listen(bound, 128, true, true);
        assert!(second.is_ok());
    }
}
