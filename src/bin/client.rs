//! spantun-client: join a spantun VPN and route traffic through it.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;

use spantun::client::format_bytes;
use spantun::config::{self, Config};
use spantun::Client;

#[derive(Parser, Debug)]
#[command(
    name = "spantun-client",
    version,
    about = "spantun VPN client",
    long_about = "Connects to a spantun server and routes this host's \
                  traffic through the tunnel.\n\n\
                  Example:\n  \
                    sudo spantun-client --server vpn.example.com:9999 --key <hex-key>\n\n\
                  The shared key must match the server's key."
)]
struct Args {
    /// VPN server address
    #[arg(long, default_value = "localhost:9999")]
    server: String,

    /// Client VPN IP
    #[arg(long, default_value = "10.0.0.2")]
    ip: Ipv4Addr,

    /// DNS servers (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "8.8.8.8,8.8.4.4")]
    dns: Vec<IpAddr>,

    /// MTU size
    #[arg(long, default_value_t = 1400)]
    mtu: u16,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log: String,

    /// Shared key (hex encoded); read from stdin when absent
    #[arg(long)]
    key: Option<String>,

    /// Periodically log transfer statistics
    #[arg(long)]
    stats: bool,
}

fn init_logging(level: &str) -> Result<()> {
    let level: log::LevelFilter = level
        .parse()
        .map_err(|_| anyhow!("invalid log level: {}", level))?;
    env_logger::Builder::new().filter_level(level).init();
    Ok(())
}

fn ensure_root() -> Result<()> {
    #[cfg(unix)]
    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("this program must be run as root");
    }
    Ok(())
}

fn prompt_key() -> Result<[u8; 32]> {
    print!("Enter shared key: ");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("failed to read key from stdin")?;
    config::parse_key_hex(&line)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log)?;
    ensure_root()?;

    let mut cfg = Config::default();
    cfg.server_addr = args.server;
    cfg.client_ip = args.ip;
    cfg.dns = args.dns;
    cfg.mtu = args.mtu;
    cfg.shared_key = match &args.key {
        Some(hex_key) => config::parse_key_hex(hex_key)?,
        None => prompt_key()?,
    };

    info!("starting spantun client");
    info!("  server:    {}", cfg.server_addr);
    info!("  client IP: {}", cfg.client_ip);
    info!("  DNS:       {:?}", cfg.dns);
    info!("  MTU:       {}", cfg.mtu);

    let client = Client::connect(cfg).await?;
    let mut stopped = client.stopped_signal();
    let mut stats_tick = tokio::time::interval(Duration::from_secs(5));
    stats_tick.tick().await;

    let signal = wait_for_signal();
    tokio::pin!(signal);
    let clean = loop {
        tokio::select! {
            _ = &mut signal => {
                info!("received shutdown signal");
                break true;
            }
            _ = stopped.wait_for(|s| *s) => {
                break false;
            }
            _ = stats_tick.tick() => {
                if args.stats {
                    let (bytes_in, bytes_out) = client.stats();
                    info!(
                        "statistics: in {}, out {}",
                        format_bytes(bytes_in),
                        format_bytes(bytes_out)
                    );
                }
            }
        }
    };

    client.disconnect().await?;
    if !clean {
        anyhow::bail!("connection to server lost");
    }
    Ok(())
}
