// Unix-domain endpoints: filesystem paths and, on Linux, the abstract namespace
use crate::error::{ConnError, Result};
use crate::socket::SocketConnection;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct UnixEndpoint {
    socket_path: PathBuf,
}

impl UnixEndpoint {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        UnixEndpoint {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    pub fn connect(&self) -> Result<SocketConnection> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| ConnError::io("connect", e))?;
        debug!(path = %self.socket_path.display(), "unix connected");
        Ok(stream.into())
    }

    /// Bind a listening connection, replacing a stale socket file left by
    /// an earlier listener.
    pub fn listen(&self) -> Result<SocketConnection> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConnError::io("unlink", e)),
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ConnError::io("bind", e))?;
        debug!(path = %self.socket_path.display(), "unix listening");
        Ok(listener.into())
    }
}

/// Endpoint in the Linux abstract socket namespace. No file is created and
/// the name disappears with the last socket bound to it.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub struct AbstractEndpoint {
    name: Vec<u8>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl AbstractEndpoint {
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        AbstractEndpoint {
            name: name.as_ref().to_vec(),
        }
    }

    fn addr(&self) -> io::Result<std::os::unix::net::SocketAddr> {
        #[cfg(target_os = "android")]
        use std::os::android::net::SocketAddrExt;
        #[cfg(target_os = "linux")]
        use std::os::linux::net::SocketAddrExt;

        std::os::unix::net::SocketAddr::from_abstract_name(&self.name)
    }

    pub fn connect(&self) -> Result<SocketConnection> {
        let addr = self.addr().map_err(|e| ConnError::io("connect", e))?;
        let stream = UnixStream::connect_addr(&addr).map_err(|e| ConnError::io("connect", e))?;
        debug!(abstract_name = %String::from_utf8_lossy(&self.name), "abstract socket connected");
        Ok(stream.into())
    }

    pub fn listen(&self) -> Result<SocketConnection> {
        let addr = self.addr().map_err(|e| ConnError::io("bind", e))?;
        let listener = UnixListener::bind_addr(&addr).map_err(|e| ConnError::io("bind", e))?;
        debug!(abstract_name = %String::from_utf8_lossy(&self.name), "abstract socket listening");
        Ok(listener.into())
    }
}
