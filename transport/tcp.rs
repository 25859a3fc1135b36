// TCP endpoints: produce socket connections from a host:port address
use crate::error::{ConnError, Result};
use crate::socket::SocketConnection;
use std::net::{SocketAddr, TcpListener, TcpStream};
use tracing::debug;

pub struct TcpEndpoint {
    address: String,
}

impl TcpEndpoint {
    pub fn new(address: &str) -> Self {
        TcpEndpoint {
            address: address.to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the endpoint. `TCP_NODELAY` is set since callers
    /// exchange small request/response payloads.
    pub fn connect(&self) -> Result<SocketConnection> {
        let stream = TcpStream::connect(&self.address).map_err(|e| ConnError::io("connect", e))?;
        stream.set_nodelay(true).map_err(|e| ConnError::io("setsockopt(TCP_NODELAY)", e))?;
        debug!(address = %self.address, "tcp connected");
        Ok(stream.into())
    }

    /// Bind a listening connection. Port 0 picks an ephemeral port; the
    /// bound address is returned alongside.
    pub fn listen(&self) -> Result<(SocketConnection, SocketAddr)> {
        let listener = TcpListener::bind(&self.address).map_err(|e| ConnError::io("bind", e))?;
        let local = listener.local_addr().map_err(|e| ConnError::io("getsockname", e))?;
        debug!(address = %local, "tcp listening");
        Ok((listener.into(), local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Connection, NO_TIMEOUT};

    #[test]
    fn listen_reports_ephemeral_port() {
        let (listener, local) = TcpEndpoint::new("127.0.0.1:0").listen().unwrap();
        assert_ne!(local.port(), 0);
        assert!(listener.is_listening());
    }

    #[test]
    fn connect_and_accept() {
        let (listener, local) = TcpEndpoint::new("127.0.0.1:0").listen().unwrap();
        let client = TcpEndpoint::new(&local.to_string()).connect().unwrap();
        let server = listener.accept(NO_TIMEOUT).unwrap().expect("peer");

        client.send(b"hi").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(server.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let (mut listener, local) = TcpEndpoint::new("127.0.0.1:0").listen().unwrap();
        listener.close();
        let err = TcpEndpoint::new(&local.to_string()).connect().unwrap_err();
        assert!(err.to_string().starts_with("connect failed"), "{err}");
    }

    #[test]
    fn bad_address_is_reported() {
        assert!(TcpEndpoint::new("not an address").listen().is_err());
    }
}
