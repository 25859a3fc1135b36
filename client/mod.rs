// client: ping client measuring round trips through an echoing peer
use hostlink_transport::{ConnError, Connection, ConnectionExt, Result, TcpEndpoint, UnixEndpoint};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct PingClient {
    transport: Box<dyn Connection>,
    buffer: Vec<u8>,
    sequence: u64,
}

impl PingClient {
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let transport = TcpEndpoint::new(&addr).connect()?;
        Ok(Self::from_connection(Box::new(transport)))
    }

    pub fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        let transport = UnixEndpoint::new(path).connect()?;
        Ok(Self::from_connection(Box::new(transport)))
    }

    pub fn from_connection(transport: Box<dyn Connection>) -> Self {
        PingClient {
            transport,
            buffer: Vec::new(),
            sequence: 0,
        }
    }

    /// Number of completed pings.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Send `payload` and wait for the identical bytes to come back.
    /// Returns the round-trip time.
    pub fn ping(&mut self, payload: &[u8]) -> Result<Duration> {
        let started = Instant::now();
        self.transport.send_all(payload)?;

        self.buffer.resize(payload.len(), 0);
        self.transport.recv_exact(&mut self.buffer)?;
        let rtt = started.elapsed();

        if self.buffer != payload {
            return Err(ConnError::Io {
                op: "ping",
                source: io::Error::new(io::ErrorKind::InvalidData, "echoed payload differs"),
            });
        }

        self.sequence += 1;
        debug!(seq = self.sequence, bytes = payload.len(), rtt_us = rtt.as_micros() as u64, "pong");
        Ok(rtt)
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}

/// Payload of `size` bytes cycling through printable ASCII.
pub fn make_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| b' ' + (i % 95) as u8).collect()
}
