//! spantun-server: terminate client tunnels and bridge them onto the VPN
//! subnet.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use log::info;

use spantun::config::{self, Config};
use spantun::Server;

#[derive(Parser, Debug)]
#[command(
    name = "spantun-server",
    version,
    about = "spantun VPN server",
    long_about = "Terminates TLS tunnels from spantun clients and bridges \
                  their traffic onto a shared subnet.\n\n\
                  Example:\n  \
                    sudo spantun-server --listen :9999 --ip 10.0.0.1 --subnet 10.0.0.0/24"
)]
struct Args {
    /// Listen address
    #[arg(long, default_value = ":9999")]
    listen: String,

    /// Server VPN IP
    #[arg(long, default_value = "10.0.0.1")]
    ip: Ipv4Addr,

    /// VPN subnet
    #[arg(long, default_value = "10.0.0.0/24")]
    subnet: Ipv4Net,

    /// MTU size
    #[arg(long, default_value_t = 1400)]
    mtu: u16,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log: String,

    /// Shared key file, hex encoded or raw 32 bytes. A random key is
    /// generated and logged when absent.
    #[arg(long)]
    key: Option<PathBuf>,
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

fn load_key_file(path: &Path) -> Result<[u8; 32]> {
    let raw = fs::read(path).with_context(|| format!("failed to read key file {:?}", path))?;
    if raw.len() == 32 {
        return config::key_from_bytes(&raw);
    }
    let text = String::from_utf8(raw).context("key file is neither raw 32 bytes nor hex text")?;
    config::parse_key_hex(&text)
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
    cfg.listen_addr = args.listen;
    cfg.server_ip = args.ip;
    cfg.subnet = args.subnet;
    cfg.mtu = args.mtu;
    cfg.shared_key = match &args.key {
        Some(path) => load_key_file(path)?,
        None => {
            let key = config::random_key();
            info!("generated shared key: {}", hex::encode(key));
            key
        }
    };

    info!("starting spantun server");
    info!("  listen address: {}", cfg.listen_addr);
    info!("  server IP:      {}", cfg.server_ip);
    info!("  VPN subnet:     {}", cfg.subnet);
    info!("  MTU:            {}", cfg.mtu);

    let server = Server::start(cfg).await?;

    wait_for_signal().await;
    info!("received shutdown signal");
    server.stop().await?;
    Ok(())
}
