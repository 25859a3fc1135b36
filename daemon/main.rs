// hostlink-echo: echo daemon over TCP and/or a Unix socket
use clap::Parser;
use hostlink_daemon::{EchoConfig, EchoServer};
use hostlink_transport::{TcpEndpoint, UnixEndpoint};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "hostlink-echo")]
#[command(about = "Echo every byte received back to the sender", long_about = None)]
#[command(version = "0.1.0")]
struct Cli {
    /// TCP address to listen on
    #[arg(long = "tcp", env = "HOSTLINK_TCP_ADDR", default_value = "127.0.0.1:3490")]
    tcp: String,

    /// Also listen on this Unix socket path
    #[arg(long = "unix", env = "HOSTLINK_UNIX_PATH", value_name = "PATH")]
    unix: Option<PathBuf>,

    /// Accept wait in milliseconds between stop checks
    #[arg(
        long = "poll-ms",
        env = "HOSTLINK_POLL_MS",
        default_value_t = 100,
        value_parser = clap::value_parser!(i32).range(1..)
    )]
    poll_ms: i32,

    /// Exit after this many sessions per listener (0 = never)
    #[arg(long = "max-sessions", env = "HOSTLINK_MAX_SESSIONS", default_value_t = 0)]
    max_sessions: usize,

    /// Per-session receive buffer in bytes
    #[arg(long = "buffer-size", env = "HOSTLINK_BUFFER_SIZE", default_value_t = 4096)]
    buffer_size: usize,
}

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

// The flag is seen once the current accept wait (at most --poll-ms) runs out.
fn install_stop_handler() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(request_stop), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EchoConfig {
        poll_ms: cli.poll_ms,
        max_sessions: cli.max_sessions,
        buffer_size: cli.buffer_size,
    };

    if let Err(e) = install_stop_handler() {
        error!(error = %e, "failed to install signal handlers");
        process::exit(1);
    }

    let mut servers = Vec::new();

    match TcpEndpoint::new(&cli.tcp).listen() {
        Ok((listener, local)) => {
            info!(address = %local, "echo daemon serving tcp");
            servers.push(("tcp", EchoServer::new(listener, config)));
        }
        Err(e) => {
            error!(address = %cli.tcp, error = %e, "cannot listen");
            process::exit(1);
        }
    }

    if let Some(path) = &cli.unix {
        match UnixEndpoint::new(path).listen() {
            Ok(listener) => {
                info!(path = %path.display(), "echo daemon serving unix socket");
                servers.push(("unix", EchoServer::new(listener, config)));
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot listen");
                process::exit(1);
            }
        }
    }

    let failed = thread::scope(|s| {
        let running: Vec<_> = servers
            .iter()
            .map(|(kind, server)| {
                let handle = s.spawn(move || {
                    let result = server.run(&STOP);
                    if result.is_err() {
                        // Let the other listener wind down too.
                        STOP.store(true, Ordering::Relaxed);
                    }
                    result
                });
                (*kind, handle)
            })
            .collect();

        let mut failed = false;
        for (kind, handle) in running {
            match handle.join() {
                Ok(Ok(stats)) => info!(
                    listener = kind,
                    sessions = stats.sessions,
                    bytes = stats.bytes_echoed,
                    "listener finished"
                ),
                Ok(Err(e)) => {
                    error!(listener = kind, error = %e, "listener failed");
                    failed = true;
                }
                Err(_) => {
                    error!(listener = kind, "listener thread panicked");
                    failed = true;
                }
            }
        }
        failed
    });

    if let Some(path) = &cli.unix {
        let _ = std::fs::remove_file(path);
    }
    if failed {
        process::exit(1);
    }
}
