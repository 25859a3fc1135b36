// hostlink-ping: measure round trips against hostlink-echo
use clap::Parser;
use hostlink_client::{make_payload, PingClient};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostlink-ping")]
#[command(about = "Send payloads to an echo daemon and report round-trip times", long_about = None)]
#[command(version = "0.1.0")]
struct Cli {
    /// Daemon host
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1")]
    host: String,

    /// Daemon TCP port
    #[arg(short, long, default_value_t = 3490)]
    port: u16,

    /// Connect over this Unix socket instead of TCP
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,

    /// Number of pings (0 = until interrupted)
    #[arg(short, long, default_value_t = 4)]
    count: u64,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 4)]
    size: usize,

    /// Delay between pings
    #[arg(short, long = "interval-ms", default_value_t = 1000)]
    interval_ms: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    let (target, connected) = match &cli.unix {
        Some(path) => (path.display().to_string(), PingClient::connect_unix(path)),
        None => (format!("{}:{}", cli.host, cli.port), PingClient::connect_tcp(&cli.host, cli.port)),
    };
    let mut client = match connected {
        Ok(c) => c,
        Err(e) => {
            error!(peer = %target, error = %e, "failed to connect");
            process::exit(1);
        }
    };

    println!("PING {} ({} bytes)", target, cli.size);

    let payload = make_payload(cli.size);
    let mut rtts: Vec<Duration> = Vec::new();
    let mut seq = 0;

    while cli.count == 0 || seq < cli.count {
        if seq > 0 {
            thread::sleep(Duration::from_millis(cli.interval_ms));
        }
        seq += 1;

        match client.ping(&payload) {
            Ok(rtt) => {
                let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.6f");
                println!(
                    "{}   {} bytes from {}: seq={} time={:.3} ms",
                    now,
                    payload.len(),
                    target,
                    seq,
                    rtt.as_secs_f64() * 1000.0
                );
                rtts.push(rtt);
            }
            Err(e) => {
                error!(seq, error = %e, "ping failed");
                break;
            }
        }
    }

    client.close();

    println!("--- {} ping statistics ---", target);
    println!("{} sent, {} received", seq, rtts.len());
    if let (Some(min), Some(max)) = (rtts.iter().min(), rtts.iter().max()) {
        let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
        println!(
            "rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
            min.as_secs_f64() * 1000.0,
            avg.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0
        );
    }

    if rtts.len() as u64 != seq {
        process::exit(1);
    }
}
