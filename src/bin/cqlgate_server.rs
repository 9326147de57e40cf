//! cqlgate-server: intercepting CQL proxy daemon.
//!
//! Usage:
//!   cqlgate-server <contact-point>[,<contact-point>...] [--listen <addr>] [--metrics]
//!
//! The proxy connects to the given backend contact points, then serves the
//! CQL native protocol on the listen address. Drivers pointed at it see a
//! single-node cluster.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use cqlgate::cluster::ReconnectPolicy;
use cqlgate::metrics::Metrics;
use cqlgate::proxy::{Proxy, ProxyConfig};

const DEFAULT_LISTEN: &str = "127.0.0.1:9042";
const DEFAULT_NUM_CONNS: usize = 2;
const DEFAULT_PROTOCOL_VERSION: u8 = 4;

fn print_usage() {
    eprintln!("Usage: cqlgate-server <contact-points> [--listen <addr>] [--num-conns <n>] [--protocol-version <v>] [--metrics]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <contact-points>     Comma-separated backend addresses (host:port)");
    eprintln!("  --listen             Client listen address (default: {})", DEFAULT_LISTEN);
    eprintln!("  --num-conns          Backend connections per keyspace session (default: {})", DEFAULT_NUM_CONNS);
    eprintln!("  --protocol-version   Protocol version to request (default: {})", DEFAULT_PROTOCOL_VERSION);
    eprintln!("  --metrics            Enable metrics collection");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("cqlgate-server {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("cqlgate-server {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Intercepting proxy for the CQL native protocol");
        println!();
        print_usage();
        std::process::exit(0);
    }

    if args.len() < 2 || args[1].starts_with("--") {
        print_usage();
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let contact_points = args[1]
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid contact point '{}': {}", s, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let listen: SocketAddr = flag_value(&args, "--listen")
        .unwrap_or(DEFAULT_LISTEN)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {}", e))?;

    let num_conns: usize = match flag_value(&args, "--num-conns") {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --num-conns: {}", e))?,
        None => DEFAULT_NUM_CONNS,
    };

    let version: u8 = match flag_value(&args, "--protocol-version") {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --protocol-version: {}", e))?,
        None => DEFAULT_PROTOCOL_VERSION,
    };

    let metrics: Option<Arc<Metrics>> = if args.iter().any(|a| a == "--metrics") {
        eprintln!("[cqlgate-server] Metrics collection enabled");
        Some(Arc::new(Metrics::new()))
    } else {
        None
    };

    eprintln!(
        "[cqlgate-server] Starting cqlgate-server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let proxy = Proxy::listen(
        ProxyConfig {
            listen,
            contact_points,
            version,
            num_conns,
            reconnect: ReconnectPolicy::default(),
            auth: None,
            session_ready_timeout: cqlgate::proxy::SESSION_READY_TIMEOUT,
        },
        metrics.clone(),
    )?;
    eprintln!("[cqlgate-server] Listening on {}", proxy.local_addr()?);

    // Graceful shutdown: report metrics and exit.
    let metrics_for_signal = metrics.clone();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            eprintln!("[cqlgate-server] Received signal {}, shutting down", sig);
            if let Some(metrics) = &metrics_for_signal {
                let snap = metrics.snapshot();
                eprintln!(
                    "[cqlgate-server] {} connections, {} frames ({} intercepted, {} forwarded, {} overloaded), forward p50/p95/p99 = {}/{}/{} ms, up {}s",
                    snap.connections,
                    snap.frames,
                    snap.intercepted,
                    snap.forwarded,
                    snap.overloaded,
                    snap.forward_p50_ms,
                    snap.forward_p95_ms,
                    snap.forward_p99_ms,
                    snap.uptime_secs,
                );
            }
            std::process::exit(0);
        }
    });

    proxy.serve();
    Ok(())
}
