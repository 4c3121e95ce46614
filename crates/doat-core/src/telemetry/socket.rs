//! Minimal `AF_UNIX` / `SOCK_SEQPACKET` wrapper over libc.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// A connected sequential-packet socket. Each `send` is one message and
/// each `recv` returns at most one message.
#[derive(Debug)]
pub struct SeqPacketSocket {
    fd: OwnedFd,
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFD))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

fn new_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the descriptor is owned immediately.
    let fd = unsafe { cvt(libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0))? };
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(fd.as_raw_fd())?;
    Ok(fd)
}

impl SeqPacketSocket {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let bytes = path.as_os_str().as_bytes();
        // SAFETY: sockaddr_un is plain data.
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        if bytes.len() >= addr.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("socket path too long: {}", path.display()),
            ));
        }
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, &src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }
        let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;

        let fd = new_socket()?;
        // SAFETY: addr is a valid sockaddr_un and len does not exceed its size.
        unsafe {
            cvt(libc::connect(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                len as libc::socklen_t,
            ))?;
        }
        Ok(Self { fd })
    }

    /// Two connected ends, for in-process peers.
    pub fn pair() -> io::Result<(Self, Self)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: socketpair writes exactly two descriptors into `fds`.
        unsafe {
            cvt(libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET,
                0,
                fds.as_mut_ptr(),
            ))?;
        }
        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_cloexec(a.as_raw_fd())?;
        set_cloexec(b.as_raw_fd())?;
        Ok((Self { fd: a }, Self { fd: b }))
    }

    pub fn send(&self, message: &[u8]) -> io::Result<usize> {
        // SAFETY: the buffer is valid for `message.len()` bytes.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                message.as_ptr().cast::<libc::c_void>(),
                message.len(),
                SEND_FLAGS,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive one message of at most `max_len` bytes. A message longer than
    /// `max_len` is truncated by the kernel.
    pub fn recv(&self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len.max(1)];
        // SAFETY: the buffer is valid for `buf.len()` bytes.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "telemetry socket closed by peer",
            ));
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    /// Wait up to `timeout` for a message to become readable.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        loop {
            // SAFETY: pfd is a single valid pollfd for the duration of the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0 && pfd.revents & libc::POLLIN != 0);
        }
    }

    /// Bound every blocking `recv`. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        // SAFETY: tv is a valid timeval for the duration of the call.
        unsafe {
            cvt(libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                (&tv as *const libc::timeval).cast::<libc::c_void>(),
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            ))?;
        }
        Ok(())
    }
}

impl AsRawFd for SeqPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_preserves_message_boundaries() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        a.send(b"first").unwrap();
        a.send(b"second").unwrap();
        assert_eq!(b.recv(64).unwrap(), b"first");
        assert_eq!(b.recv(64).unwrap(), b"second");
    }

    #[test]
    fn test_recv_after_peer_close_is_eof() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        drop(a);
        let err = b.recv(16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_timeout_expires() {
        let (_a, b) = SeqPacketSocket::pair().unwrap();
        b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let err = b.recv(16).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_wait_readable() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        assert!(!b.wait_readable(Duration::from_millis(20)).unwrap());
        a.send(b"hello").unwrap();
        assert!(b.wait_readable(Duration::from_millis(500)).unwrap());
        assert_eq!(b.recv(16).unwrap(), b"hello");
    }

    #[test]
    fn test_connect_to_missing_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(SeqPacketSocket::connect(&tmp.path().join("dpdk_telemetry.v2")).is_err());
    }
}
