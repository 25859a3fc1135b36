// Connection abstraction - callers depend only on this capability set
use crate::error::{ConnError, Result};
use std::fmt;

/// Timeout sentinel for [`Connection::accept`]: block until a peer arrives.
///
/// The value is `-1`, the same value `poll(2)` uses for an infinite wait.
/// Any negative timeout is treated the same way.
pub const NO_TIMEOUT: i32 = -1;

/// Bidirectional byte-stream connection, independent of the transport.
///
/// `send`, `recv` and `accept` block the calling thread only. They take
/// `&self`, so one thread may send while another receives. `close` takes
/// `&mut self` and so cannot race an in-flight operation.
pub trait Connection: Send + Sync {
    /// Write up to `data.len()` bytes. Returns how many the transport
    /// accepted, which may be fewer than requested.
    fn send(&self, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// stream gracefully.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Description of the most recent failure, or `None` if the last
    /// operation succeeded.
    fn error(&self) -> Option<String>;

    /// Wait up to `timeout_ms` milliseconds for an incoming peer.
    ///
    /// `Ok(None)` means the wait timed out; the listener stays usable.
    /// The returned connection is independent of `self`.
    fn accept(&self, timeout_ms: i32) -> Result<Option<Box<dyn Connection>>>;

    /// Release the transport. Calling it again is a no-op.
    fn close(&mut self);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("error", &self.error())
            .finish_non_exhaustive()
    }
}

/// Looping helpers for callers that need exact byte counts.
pub trait ConnectionExt: Connection {
    /// Send the whole buffer, looping over short writes.
    fn send_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.send(data)?;
            if n == 0 {
                return Err(ConnError::WriteZero);
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Fill the whole buffer, looping over short reads.
    fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let expected = buf.len();
        let mut received = 0;
        while received < expected {
            match self.recv(&mut buf[received..])? {
                0 => return Err(ConnError::UnexpectedEof { received, expected }),
                n => received += n,
            }
        }
        Ok(())
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
