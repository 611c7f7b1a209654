//! Byte buffer backing connection input and output.
//!
//! The input side needs one extra trick over a plain growable buffer: a
//! scattered read that lands in the buffer's spare capacity first and
//! overflows into a stack extension, so a single `readv` can pick up more
//! bytes than the buffer had room for without a premature allocation.

use bytes::{Buf, BytesMut};
use std::io;
use std::os::unix::io::RawFd;

/// Minimum spare capacity maintained ahead of a scattered read.
const MIN_RECV_SPACE: usize = 8 * 1024;

/// Size of the stack extension used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// Growable byte buffer with append/peek/retrieve semantics.
///
/// Readers consume from the front via [`retrieve`](Buffer::retrieve);
/// writers append at the back. Retrieved space is reclaimed by the
/// underlying `BytesMut`.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(MIN_RECV_SPACE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Bytes that can be appended without reallocation.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }

    /// All readable bytes, front to back.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.inner
    }

    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    /// Consume `n` bytes from the front.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable length.
    #[inline]
    pub fn retrieve(&mut self, n: usize) {
        self.inner.advance(n);
    }

    /// Consume and return everything currently readable.
    pub fn retrieve_all(&mut self) -> Vec<u8> {
        let out = self.inner.to_vec();
        self.inner.clear();
        out
    }

    /// Consume everything readable as a `String` (lossy on invalid UTF-8).
    pub fn retrieve_all_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all()).into_owned()
    }

    /// Scattered read from `fd` into spare capacity plus a stack extension.
    ///
    /// Appends exactly the bytes read. Returns `Ok(0)` on EOF; would-block
    /// and other errors come back untranslated for the caller's state
    /// machine to sort out.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];

        if self.writable_bytes() < MIN_RECV_SPACE {
            self.inner.reserve(MIN_RECV_SPACE);
        }
        let writable = self.writable_bytes();

        // Spare capacity of the BytesMut as the first iovec. The slice is
        // uninitialized memory that only the kernel writes; set_len below
        // commits no more than the kernel reported.
        let spare =
            unsafe { std::slice::from_raw_parts_mut(self.inner.as_mut_ptr().add(self.inner.len()), writable) };

        let iov = [
            libc::iovec {
                iov_base: spare.as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            unsafe { self.inner.set_len(self.inner.len() + n) };
        } else {
            unsafe { self.inner.set_len(self.inner.len() + writable) };
            self.inner.extend_from_slice(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_append_peek_retrieve() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());

        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        let rest = buf.retrieve_all();
        assert_eq!(rest, b"world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_retrieve_all_string() {
        let mut buf = Buffer::new();
        buf.append(b"ping\n");
        assert_eq!(buf.retrieve_all_string(), "ping\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_fd_appends() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut buf = Buffer::new();
        buf.append(b"head:");

        a.write_all(b"payload").unwrap();
        let n = buf.read_fd(b.as_raw_fd()).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf.peek(), b"head:payload");
    }

    #[test]
    fn test_read_fd_would_block() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut buf = Buffer::new();
        let err = buf.read_fd(b.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_fd_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        drop(a);

        let mut buf = Buffer::new();
        let n = buf.read_fd(b.as_raw_fd()).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_read_fd_large_transfer() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let payload = vec![0xabu8; 48 * 1024];
        let writer = std::thread::spawn(move || {
            a.write_all(&payload).unwrap();
        });

        let mut buf = Buffer::with_capacity(16);
        let mut total = 0;
        while total < 48 * 1024 {
            match buf.read_fd(b.as_raw_fd()) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("read_fd: {}", e),
            }
        }
        writer.join().unwrap();

        assert_eq!(total, 48 * 1024);
        assert_eq!(buf.len(), 48 * 1024);
        assert!(buf.peek().iter().all(|&b| b == 0xab));
    }
}
