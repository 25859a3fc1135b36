// daemon: echo server driving a listening connection with bounded accept waits
use hostlink_transport::{ConnError, Connection, ConnectionExt, SocketConnection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_MS: i32 = 100;
const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listener failed: {0}")]
    Listener(#[from] ConnError),

    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("accept poll interval must be positive, got {0}ms")]
    PollInterval(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoConfig {
    /// How long each accept waits before the stop flag is checked again.
    /// Must be positive; an unbounded wait would never see the flag.
    pub poll_ms: i32,
    /// Stop accepting after this many sessions; 0 means no limit.
    pub max_sessions: usize,
    /// Receive buffer per session.
    pub buffer_size: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        EchoConfig {
            poll_ms: DEFAULT_POLL_MS,
            max_sessions: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub sessions: u64,
    pub failed_sessions: u64,
    pub bytes_echoed: u64,
}

// Counters shared with session threads
#[derive(Default)]
struct SessionCounters {
    failed: AtomicU64,
    bytes: AtomicU64,
}

pub struct EchoServer {
    listener: SocketConnection,
    config: EchoConfig,
}

impl EchoServer {
    pub fn new(listener: SocketConnection, config: EchoConfig) -> Self {
        EchoServer { listener, config }
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }

    /// Accept and serve sessions until `stop` is set or the session limit
    /// is reached, then wait for running sessions to finish.
    pub fn run(&self, stop: &AtomicBool) -> Result<ServerStats, ServerError> {
        if self.config.poll_ms <= 0 {
            return Err(ServerError::PollInterval(self.config.poll_ms));
        }

        let counters = Arc::new(SessionCounters::default());
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        let mut accepted: u64 = 0;

        let outcome = loop {
            if stop.load(Ordering::Relaxed) {
                info!(accepted, "stop requested");
                break Ok(());
            }
            if self.config.max_sessions > 0 && accepted >= self.config.max_sessions as u64 {
                info!(accepted, "session limit reached");
                break Ok(());
            }

            let conn = match self.listener.accept(self.config.poll_ms) {
                Ok(Some(conn)) => conn,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break Err(ServerError::from(e));
                }
            };

            accepted += 1;
            let counters = Arc::clone(&counters);
            let buffer_size = self.config.buffer_size;
            let spawned = thread::Builder::new()
                .name(format!("hostlink-session-{}", accepted))
                .spawn(move || match echo_session(conn, buffer_size) {
                    Ok(bytes) => {
                        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "session ended with error");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            match spawned {
                Ok(handle) => sessions.push(handle),
                Err(e) => break Err(ServerError::Spawn(e)),
            }

            sessions.retain(|h| !h.is_finished());
        };

        for handle in sessions {
            if handle.join().is_err() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome?;

        let stats = ServerStats {
            sessions: accepted,
            failed_sessions: counters.failed.load(Ordering::Relaxed),
            bytes_echoed: counters.bytes.load(Ordering::Relaxed),
        };
        info!(
            sessions = stats.sessions,
            failed = stats.failed_sessions,
            bytes = stats.bytes_echoed,
            "echo server stopped"
        );
        Ok(stats)
    }
}

/// Echo everything received back to the peer until it closes the stream.
/// Returns the number of bytes echoed.
pub fn echo_session(mut conn: Box<dyn Connection>, buffer_size: usize) -> Result<u64, ConnError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total: u64 = 0;

    let result = loop {
        match conn.recv(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = conn.send_all(&buf[..n]) {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    debug!(bytes = total, "session finished");
    conn.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_transport::{TcpEndpoint, UnixEndpoint};
    use std::time::{Duration, Instant};

    #[test]
    fn session_echoes_until_eof() {
        let (client, server) = SocketConnection::pair().unwrap();
        let worker = thread::spawn(move || echo_session(Box::new(server), 3));

        client.send_all(b"hello echo").unwrap();
        let mut buf = [0u8; 10];
        client.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello echo");

        client.shutdown_write().unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), 10);
        assert_eq!(client.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn server_stops_after_session_limit() {
        let (listener, local) = TcpEndpoint::new("127.0.0.1:0").listen().unwrap();
        let config = EchoConfig {
            poll_ms: 20,
            max_sessions: 2,
            buffer_size: 64,
        };
        let server = EchoServer::new(listener, config);
        let stop = AtomicBool::new(false);

        let stats = thread::scope(|s| {
            let running = s.spawn(|| server.run(&stop));
            for payload in [&b"one"[..], &b"two!"[..]] {
                let mut client = TcpEndpoint::new(&local.to_string()).connect().unwrap();
                client.send_all(payload).unwrap();
                let mut buf = vec![0u8; payload.len()];
                client.recv_exact(&mut buf).unwrap();
                assert_eq!(buf, payload);
                client.close();
            }
            running.join().unwrap()
        })
        .unwrap();

        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.failed_sessions, 0);
        assert_eq!(stats.bytes_echoed, 7);
    }

    #[test]
    fn server_honors_stop_flag_within_poll_interval() {
        let (listener, _local) = TcpEndpoint::new("127.0.0.1:0").listen().unwrap();
        let server = EchoServer::new(
            listener,
            EchoConfig {
                poll_ms: 25,
                ..EchoConfig::default()
            },
        );
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            let running = s.spawn(|| server.run(&stop));
            thread::sleep(Duration::from_millis(60));
            let requested = Instant::now();
            stop.store(true, Ordering::Relaxed);
            let stats = running.join().unwrap().unwrap();
            assert!(requested.elapsed() < Duration::from_secs(1));
            assert_eq!(stats, ServerStats::default());
        });
    }

    #[test]
    fn server_rejects_unbounded_poll_interval() {
        for poll_ms in [0, hostlink_transport::NO_TIMEOUT] {
            let (listener, _local) = TcpEndpoint::new("127.0.0.1:0").listen().unwrap();
            let config = EchoConfig {
                poll_ms,
                ..EchoConfig::default()
            };
            let err = EchoServer::new(listener, config)
                .run(&AtomicBool::new(false))
                .unwrap_err();
            assert!(matches!(err, ServerError::PollInterval(ms) if ms == poll_ms));
        }
    }

    #[test]
    fn server_serves_unix_listener() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = UnixEndpoint::new(dir.path().join("echo.sock"));
        let config = EchoConfig {
            poll_ms: 20,
            max_sessions: 1,
            buffer_size: 16,
        };
        let server = EchoServer::new(endpoint.listen().unwrap(), config);
        let stop = AtomicBool::new(false);

        let stats = thread::scope(|s| {
            let running = s.spawn(|| server.run(&stop));
            let mut client = endpoint.connect().unwrap();
            client.send_all(b"over a unix socket").unwrap();
            let mut buf = [0u8; 18];
            client.recv_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"over a unix socket");
            client.close();
            running.join().unwrap()
        })
        .unwrap();

        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.bytes_echoed, 18);
    }

    #[test]
    fn server_rejects_non_listening_handle() {
        let (a, _b) = SocketConnection::pair().unwrap();
        let server = EchoServer::new(a, EchoConfig::default());
        let err = server.run(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, ServerError::Listener(ConnError::NotListening)));
    }
}
