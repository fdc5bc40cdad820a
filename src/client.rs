//! Client endpoint: dial, handshake, and the three concurrent pumps that
//! bridge the local TUN to the server stream.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::crypto::PacketCipher;
use crate::packet;
use crate::platform::{HostNet, PlatformNet};
use crate::protocol::{self, Message};
use crate::protocol::{MSG_DATA, MSG_DISCONNECT, MSG_HANDSHAKE_ACK, MSG_KEEPALIVE};
use crate::tls;
use crate::tun::{PacketRead, PacketWrite, TunDevice, TunOptions};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected client endpoint.
pub struct Client {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    writer: Arc<Mutex<BoxedWriter>>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    net: Arc<dyn PlatformNet>,
    tun_name: String,
    server_host: String,
}

impl Client {
    /// Dial the server, authenticate, bring up the TUN and routes, and
    /// start the pumps.
    pub async fn connect(cfg: Config) -> Result<Client> {
        crate::tun::check_permissions()?;
        let cipher = PacketCipher::new(&cfg.shared_key).context("failed to create cipher")?;

        info!("connecting to VPN server {}", cfg.server_addr);
        let connector = TlsConnector::from(tls::client_config(true)?);
        let tcp = TcpStream::connect(&cfg.server_addr)
            .await
            .with_context(|| format!("failed to connect to {}", cfg.server_addr))?;
        let name = ServerName::try_from(cfg.server_host().to_string())
            .context("invalid server host name")?;
        let mut stream = connector
            .connect(name, tcp)
            .await
            .context("TLS handshake failed")?;

        handshake(&mut stream, &cfg).await?;
        info!("authenticated with server");

        let opts = TunOptions {
            name: cfg.tun_name.clone(),
            address: cfg.client_ip,
            netmask: cfg.subnet.netmask(),
            mtu: cfg.mtu,
        };
        let device = TunDevice::open(&opts)?;
        let tun_name = device.name().to_string();
        info!("TUN interface {} up with IP {}", tun_name, cfg.client_ip);
        let (tun_reader, tun_writer) = device.split();

        let net: Arc<dyn PlatformNet> = Arc::new(HostNet::new());
        if let Err(err) = net.setup_client(&tun_name, cfg.server_host(), &cfg.dns) {
            warn!("failed to set up client routes: {}", err);
        }

        Ok(Self::spawn_pumps(cfg, cipher, stream, tun_reader, tun_writer, net, tun_name))
    }

    /// Same as [`connect`](Self::connect) but over externally supplied
    /// transport and TUN endpoints. Used by the tests; `connect` delegates
    /// the interesting work here.
    pub async fn connect_with<S, R, W>(
        cfg: Config,
        mut stream: S,
        tun_reader: R,
        tun_writer: W,
        net: Arc<dyn PlatformNet>,
    ) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: PacketRead + 'static,
        W: PacketWrite + 'static,
    {
        let cipher = PacketCipher::new(&cfg.shared_key).context("failed to create cipher")?;
        handshake(&mut stream, &cfg).await?;
        let tun_name = cfg.tun_name.clone();
        if let Err(err) = net.setup_client(&tun_name, cfg.server_host(), &cfg.dns) {
            warn!("failed to set up client routes: {}", err);
        }
        Ok(Self::spawn_pumps(cfg, cipher, stream, tun_reader, tun_writer, net, tun_name))
    }

    fn spawn_pumps<S, R, W>(
        cfg: Config,
        cipher: PacketCipher,
        stream: S,
        mut tun_reader: R,
        mut tun_writer: W,
        net: Arc<dyn PlatformNet>,
        tun_name: String,
    ) -> Client
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: PacketRead + 'static,
        W: PacketWrite + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>;
        let writer: Arc<Mutex<BoxedWriter>> = Arc::new(Mutex::new(Box::new(writer)));
        let (stop, _) = watch::channel(false);
        let bytes_in = Arc::new(AtomicU64::new(0));
        let bytes_out = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::with_capacity(3);

        // tun -> net: encrypt and frame every packet leaving the TUN.
        {
            let cipher = cipher.clone();
            let writer = writer.clone();
            let bytes_out = bytes_out.clone();
            let stop_tx = stop.clone();
            let mut stop_rx = stop.subscribe();
            let buf_len = cfg.packet_buf_len();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; buf_len];
                loop {
                    let n = tokio::select! {
                        _ = stop_rx.wait_for(|s| *s) => break,
                        read = tun_reader.recv(&mut buf) => match read {
                            Ok(n) => n,
                            Err(err) => {
                                error!("failed to read from TUN: {}", err);
                                stop_tx.send_replace(true);
                                break;
                            }
                        },
                    };
                    let raw = &buf[..n];
                    if let Ok(hdr) = packet::parse(raw) {
                        debug!(
                            "read {} packet {} -> {} ({} bytes) from TUN",
                            hdr.protocol_name(),
                            hdr.src,
                            hdr.dst,
                            n
                        );
                    }
                    let msg = Message::new(MSG_DATA, cipher.encrypt(raw));
                    let written = {
                        let mut w = writer.lock().await;
                        protocol::write_message(&mut **w, &msg).await
                    };
                    match written {
                        Ok(()) => {
                            bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(err) => {
                            error!("failed to send data to server: {}", err);
                            stop_tx.send_replace(true);
                            break;
                        }
                    }
                }
            }));
        }

        // net -> tun: decrypt DATA frames onto the TUN, watch for control
        // frames.
        {
            let stop_tx = stop.clone();
            let mut stop_rx = stop.subscribe();
            let bytes_in = bytes_in.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = stop_rx.wait_for(|s| *s) => break,
                        read = protocol::read_message(&mut reader) => match read {
                            Ok(msg) => msg,
                            Err(err) => {
                                info!("server connection closed: {}", err);
                                stop_tx.send_replace(true);
                                break;
                            }
                        },
                    };
                    match msg.msg_type {
                        MSG_DATA => {
                            let plaintext = match cipher.decrypt(&msg.data) {
                                Ok(p) => p,
                                Err(err) => {
                                    warn!("failed to decrypt packet: {}", err);
                                    continue;
                                }
                            };
                            if let Ok(hdr) = packet::parse(&plaintext) {
                                debug!(
                                    "received {} packet {} -> {} ({} bytes)",
                                    hdr.protocol_name(),
                                    hdr.src,
                                    hdr.dst,
                                    plaintext.len()
                                );
                            }
                            if let Err(err) = tun_writer.send(&plaintext).await {
                                error!("failed to write to TUN: {}", err);
                                stop_tx.send_replace(true);
                                break;
                            }
                            bytes_in.fetch_add(plaintext.len() as u64, Ordering::Relaxed);
                        }
                        MSG_KEEPALIVE => debug!("keepalive from server"),
                        MSG_DISCONNECT => {
                            info!("server requested disconnect");
                            stop_tx.send_replace(true);
                            break;
                        }
                        other => debug!("ignoring frame type {}", other),
                    }
                }
            }));
        }

        // keepalive ticker
        {
            let writer = writer.clone();
            let stop_tx = stop.clone();
            let mut stop_rx = stop.subscribe();
            let period = cfg.keep_alive;
            tasks.push(tokio::spawn(async move {
                let mut tick = interval(period);
                tick.tick().await; // the immediate first tick
                loop {
                    tokio::select! {
                        _ = stop_rx.wait_for(|s| *s) => break,
                        _ = tick.tick() => {}
                    }
                    let sent = {
                        let mut w = writer.lock().await;
                        protocol::write_message(&mut **w, &Message::empty(MSG_KEEPALIVE)).await
                    };
                    if let Err(err) = sent {
                        error!("failed to send keepalive: {}", err);
                        stop_tx.send_replace(true);
                        break;
                    }
                }
            }));
        }

        Client {
            stop,
            tasks,
            writer,
            bytes_in,
            bytes_out,
            net,
            tun_name,
            server_host: cfg.server_host().to_string(),
        }
    }

    /// Total bytes received from / sent to the tunnel so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    /// True once any pump has hit a fatal error or a disconnect was seen.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Receiver that resolves when the session stops for any reason.
    pub fn stopped_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Orderly shutdown: tell the server, close the stream, join the pumps,
    /// and put the host's routes and DNS back.
    pub async fn disconnect(mut self) -> Result<()> {
        info!("disconnecting from VPN server");
        self.stop.send_replace(true);
        {
            let mut w = self.writer.lock().await;
            let _ = protocol::write_message(&mut **w, &Message::empty(MSG_DISCONNECT)).await;
            let _ = w.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Err(err) = self.net.restore_client(&self.tun_name, &self.server_host) {
            warn!("failed to restore routes: {}", err);
        }
        info!("disconnected from VPN server");
        Ok(())
    }
}

async fn handshake<S>(stream: &mut S, cfg: &Config) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let hello = protocol::encode_handshake(IpAddr::V4(cfg.client_ip), &cfg.shared_key);
    protocol::write_message(stream, &hello)
        .await
        .context("failed to send handshake")?;
    let reply = protocol::read_message(stream)
        .await
        .context("failed to read handshake response")?;
    if reply.msg_type != MSG_HANDSHAKE_ACK {
        bail!("expected handshake ack, got type {}", reply.msg_type);
    }
    Ok(())
}

/// Human-readable byte count for the stats ticker.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, [b'K', b'M', b'G', b'T', b'P', b'E'][exp] as char)
}
