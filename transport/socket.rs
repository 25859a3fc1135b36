// Socket-backed connection: owns one native stream socket and maps each
// Connection operation onto blocking socket calls
use crate::error::{ConnError, Result};
use crate::traits::Connection;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, getsockopt, setsockopt, sockopt, MsgFlags, Shutdown};
use parking_lot::Mutex;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

// A peer that went away must surface as EPIPE, not as a signal.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Connection over a native connection-oriented byte-stream socket.
///
/// The handle may be a connected stream or a listening socket; only the
/// latter supports [`Connection::accept`]. The handle is released exactly
/// once, by [`Connection::close`] or on drop.
#[derive(Debug)]
pub struct SocketConnection {
    socket: Option<OwnedFd>,
    last_error: Mutex<Option<String>>,
}

impl SocketConnection {
    /// Take ownership of an already-open socket handle.
    ///
    /// Connected streams are switched to blocking mode. Listening handles
    /// are made non-blocking so that a thread losing an accept race to
    /// another returns to its bounded wait. If setup fails the connection
    /// is still usable and the failure shows up in `error()`.
    pub fn new(socket: OwnedFd) -> Self {
        let last_error = match prepare(socket.as_fd()) {
            Ok(()) => None,
            Err(e) => {
                warn!(fd = socket.as_raw_fd(), error = %e, "could not prepare socket for blocking I/O");
                Some(ConnError::io("configure", e).to_string())
            }
        };
        SocketConnection {
            socket: Some(socket),
            last_error: Mutex::new(last_error),
        }
    }

    /// A connected pair of Unix-domain stream sockets.
    pub fn pair() -> io::Result<(SocketConnection, SocketConnection)> {
        let (a, b) = UnixStream::pair()?;
        Ok((a.into(), b.into()))
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Whether the handle is a socket in the listening role.
    pub fn is_listening(&self) -> bool {
        self.socket
            .as_ref()
            .and_then(|fd| getsockopt(fd, sockopt::AcceptConn).ok())
            .unwrap_or(false)
    }

    /// Set the kernel send buffer size (SO_SNDBUF)
    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        let fd = self.handle()?;
        setsockopt(&fd, sockopt::SndBuf, &size)
            .map_err(|e| self.fail(ConnError::io("setsockopt(SO_SNDBUF)", e)))
    }

    /// Set the kernel receive buffer size (SO_RCVBUF)
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        let fd = self.handle()?;
        setsockopt(&fd, sockopt::RcvBuf, &size)
            .map_err(|e| self.fail(ConnError::io("setsockopt(SO_RCVBUF)", e)))
    }

    /// Stop sending. The peer reads EOF; this side can still receive.
    pub fn shutdown_write(&self) -> Result<()> {
        let fd = self.handle()?;
        socket::shutdown(fd.as_raw_fd(), Shutdown::Write)
            .map_err(|e| self.fail(ConnError::io("shutdown", e)))?;
        self.clear();
        Ok(())
    }

    fn handle(&self) -> Result<BorrowedFd<'_>> {
        match &self.socket {
            Some(fd) => Ok(fd.as_fd()),
            None => Err(self.fail(ConnError::Closed)),
        }
    }

    fn fail(&self, err: ConnError) -> ConnError {
        self.note(err.to_string());
        err
    }

    fn note(&self, text: String) {
        *self.last_error.lock() = Some(text);
    }

    fn clear(&self) {
        *self.last_error.lock() = None;
    }
}

impl Connection for SocketConnection {
    fn send(&self, data: &[u8]) -> Result<usize> {
        let fd = self.handle()?;
        if data.is_empty() {
            self.clear();
            return Ok(0);
        }
        loop {
            match socket::send(fd.as_raw_fd(), data, SEND_FLAGS) {
                Ok(n) => {
                    trace!(fd = fd.as_raw_fd(), requested = data.len(), sent = n, "send");
                    self.clear();
                    return Ok(n);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.fail(ConnError::io("send", e))),
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.handle()?;
        if buf.is_empty() {
            self.clear();
            return Ok(0);
        }
        loop {
            match socket::recv(fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(n) => {
                    trace!(fd = fd.as_raw_fd(), capacity = buf.len(), received = n, "recv");
                    self.clear();
                    return Ok(n);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.fail(ConnError::io("recv", e))),
            }
        }
    }

    fn error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn accept(&self, timeout_ms: i32) -> Result<Option<Box<dyn Connection>>> {
        let listener = self.handle()?;
        match getsockopt(&listener, sockopt::AcceptConn) {
            Ok(true) => {}
            Ok(false) => return Err(self.fail(ConnError::NotListening)),
            Err(e) => return Err(self.fail(ConnError::io("getsockopt(SO_ACCEPTCONN)", e))),
        }

        match wait_and_accept(listener, timeout_ms) {
            Ok(Some(peer)) => {
                debug!(listener = listener.as_raw_fd(), fd = peer.as_raw_fd(), "accepted connection");
                self.clear();
                Ok(Some(Box::new(SocketConnection::new(peer))))
            }
            Ok(None) => {
                trace!(listener = listener.as_raw_fd(), timeout_ms, "accept timed out");
                self.note(format!("accept timed out after {}ms", timeout_ms));
                Ok(None)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn close(&mut self) {
        if let Some(fd) = self.socket.take() {
            debug!(fd = fd.as_raw_fd(), "closing connection");
            drop(fd);
        }
    }
}

impl From<OwnedFd> for SocketConnection {
    fn from(socket: OwnedFd) -> Self {
        SocketConnection::new(socket)
    }
}

impl From<TcpStream> for SocketConnection {
    fn from(stream: TcpStream) -> Self {
        SocketConnection::new(stream.into())
    }
}

impl From<TcpListener> for SocketConnection {
    fn from(listener: TcpListener) -> Self {
        SocketConnection::new(listener.into())
    }
}

impl From<UnixStream> for SocketConnection {
    fn from(stream: UnixStream) -> Self {
        SocketConnection::new(stream.into())
    }
}

impl From<UnixListener> for SocketConnection {
    fn from(listener: UnixListener) -> Self {
        SocketConnection::new(listener.into())
    }
}

fn wait_and_accept(listener: BorrowedFd<'_>, timeout_ms: i32) -> Result<Option<OwnedFd>> {
    let deadline = u64::try_from(timeout_ms)
        .ok()
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    loop {
        let wait = match deadline {
            None => PollTimeout::NONE,
            Some(deadline) => poll_timeout(deadline.saturating_duration_since(Instant::now())),
        };

        let mut fds = [PollFd::new(listener, PollFlags::POLLIN)];
        match poll(&mut fds, wait) {
            Ok(0) => {
                // Long waits are split into u16-sized slices.
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(None);
                }
            }
            Ok(_) => match accept_raw(listener.as_raw_fd()) {
                // SAFETY: accept returned a fresh descriptor that nothing else owns.
                Ok(raw) => return Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) })),
                // The pending peer vanished between poll and accept.
                Err(Errno::EAGAIN | Errno::ECONNABORTED | Errno::EINTR) => {}
                Err(e) => return Err(ConnError::io("accept", e)),
            },
            Err(Errno::EINTR) => {}
            Err(e) => return Err(ConnError::io("poll", e)),
        }
    }
}

// Round up so a sub-millisecond remainder still waits instead of spinning.
fn poll_timeout(remaining: Duration) -> PollTimeout {
    let ms = remaining.as_nanos().div_ceil(1_000_000);
    PollTimeout::from(ms.min(u128::from(u16::MAX)) as u16)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn accept_raw(listener: RawFd) -> nix::Result<RawFd> {
    socket::accept4(listener, socket::SockFlag::SOCK_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn accept_raw(listener: RawFd) -> nix::Result<RawFd> {
    socket::accept(listener)
}

// Streams block in send/recv; listeners only wait in poll, never in accept.
fn prepare(fd: BorrowedFd<'_>) -> io::Result<()> {
    let listening = getsockopt(&fd, sockopt::AcceptConn)?;
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    let wanted = if listening {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    if wanted != flags {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(wanted))?;
    }
    suppress_sigpipe(fd)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn suppress_sigpipe(fd: BorrowedFd<'_>) -> io::Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: the option value points at a live c_int of the advertised size.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn suppress_sigpipe(_fd: BorrowedFd<'_>) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NO_TIMEOUT;

    #[test]
    fn pair_round_trip() {
        let (a, b) = SocketConnection::pair().unwrap();
        assert_eq!(a.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
        assert_eq!(a.error(), None);
        assert_eq!(b.error(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut a, _b) = SocketConnection::pair().unwrap();
        assert!(a.is_open());
        a.close();
        a.close();
        assert!(!a.is_open());
    }

    #[test]
    fn operations_after_close_fail() {
        let (mut a, _b) = SocketConnection::pair().unwrap();
        a.close();

        assert!(a.send(b"x").unwrap_err().is_closed());
        assert!(a.error().is_some_and(|e| !e.is_empty()));

        let mut buf = [0u8; 1];
        assert!(a.recv(&mut buf).unwrap_err().is_closed());
        assert!(matches!(a.accept(0), Err(ConnError::Closed)));
        assert!(a.send(b"").unwrap_err().is_closed());
        assert!(a.shutdown_write().unwrap_err().is_closed());
    }

    #[test]
    fn accept_on_connected_socket_is_rejected() {
        let (a, _b) = SocketConnection::pair().unwrap();
        assert!(!a.is_listening());
        assert!(matches!(a.accept(NO_TIMEOUT), Err(ConnError::NotListening)));
        assert_eq!(a.error().as_deref(), Some("connection is not a listening endpoint"));
    }

    #[test]
    fn success_clears_previous_error() {
        let (a, _b) = SocketConnection::pair().unwrap();
        assert!(a.accept(0).is_err());
        assert!(a.error().is_some());
        a.send(b"ok").unwrap();
        assert_eq!(a.error(), None);
    }

    #[test]
    fn empty_buffers_do_not_touch_the_socket() {
        let (a, b) = SocketConnection::pair().unwrap();
        assert_eq!(a.send(&[]).unwrap(), 0);
        let mut empty = [0u8; 0];
        assert_eq!(b.recv(&mut empty).unwrap(), 0);
    }

    #[test]
    fn shutdown_write_signals_eof_to_peer() {
        let (a, b) = SocketConnection::pair().unwrap();
        a.send(b"last").unwrap();
        a.shutdown_write().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
        assert_eq!(b.error(), None);

        // The write-closed side can still receive.
        b.send(b"ack").unwrap();
        assert_eq!(a.recv(&mut buf).unwrap(), 3);
    }

    #[test]
    fn nonblocking_handle_is_made_blocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let conn = SocketConnection::from(a);
        assert!(!is_nonblocking(&conn));
        assert_eq!(conn.error(), None);
    }

    fn is_nonblocking(conn: &SocketConnection) -> bool {
        let fd = conn.socket.as_ref().unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        flags.contains(OFlag::O_NONBLOCK)
    }

    #[test]
    fn listening_handle_is_made_nonblocking() {
        let listener = SocketConnection::from(TcpListener::bind("127.0.0.1:0").unwrap());
        assert!(listener.is_listening());
        assert!(is_nonblocking(&listener));
        assert_eq!(listener.error(), None);
    }

    #[test]
    fn accept_race_loser_returns_at_its_deadline() {
        let inner = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = inner.local_addr().unwrap();
        let listener = SocketConnection::from(inner);

        let results: Vec<(bool, Duration)> = std::thread::scope(|s| {
            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let started = Instant::now();
                        let peer = listener.accept(300).unwrap();
                        (peer.is_some(), started.elapsed())
                    })
                })
                .collect();
            let _client = TcpStream::connect(address).unwrap();
            waiters.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
        for (_, waited) in results {
            assert!(waited < Duration::from_secs(2), "accept overran its timeout: {waited:?}");
        }
    }

    #[test]
    fn buffer_sizes_can_be_tuned() {
        let (a, _b) = SocketConnection::pair().unwrap();
        a.set_send_buffer_size(65536).unwrap();
        a.set_recv_buffer_size(65536).unwrap();
    }
}
