//! Server endpoint: TLS listener, per-connection handlers, the singleton
//! TUN reader that demultiplexes egress to clients by inner IP, and the
//! idle reaper.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout};
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::crypto::{self, PacketCipher};
use crate::packet;
use crate::platform::{HostNet, PlatformNet};
use crate::protocol::{self, Message, ProtocolError};
use crate::protocol::{
    ACK_OK, MSG_DATA, MSG_DISCONNECT, MSG_HANDSHAKE, MSG_HANDSHAKE_ACK, MSG_KEEPALIVE,
    PROTOCOL_VERSION,
};
use crate::session::{Session, SessionTable};
use crate::tls;
use crate::tun::{PacketRead, PacketWrite, TunDevice, TunOptions};

struct ServerState {
    cfg: Config,
    sessions: SessionTable,
    /// Decrypted inbound packets headed for the TUN; a single writer task
    /// drains this so the device write is the serialization point.
    tun_tx: mpsc::Sender<Vec<u8>>,
    handlers: Mutex<JoinSet<()>>,
}

/// A running server endpoint.
pub struct Server {
    state: Arc<ServerState>,
    stop: watch::Sender<bool>,
    core: Vec<JoinHandle<()>>,
    net: Arc<dyn PlatformNet>,
    tun_name: String,
    subnet: Ipv4Net,
}

impl Server {
    /// Open the TUN in server mode, bind the TLS listener, and spawn the
    /// background tasks. Returns once the server is accepting.
    pub async fn start(cfg: Config) -> Result<Server> {
        crate::tun::check_permissions()?;
        let opts = TunOptions {
            name: cfg.tun_name.clone(),
            address: cfg.server_ip,
            netmask: cfg.subnet.netmask(),
            mtu: cfg.mtu,
        };
        let device = TunDevice::open(&opts)?;
        info!(
            "TUN interface {} ready with server IP {}",
            device.name(),
            cfg.server_ip
        );
        let (tun_reader, tun_writer) = device.split();

        let bind_addr = cfg.bind_addr();
        let tun_name = cfg.tun_name.clone();
        let net: Arc<dyn PlatformNet> = Arc::new(HostNet::new());
        let mut server = Self::start_with(cfg, tun_reader, tun_writer, net, tun_name).await?;

        let acceptor = TlsAcceptor::from(tls::server_config()?);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        info!("listening on {}", listener.local_addr()?);
        server.spawn_accept_loop(listener, acceptor);
        Ok(server)
    }

    /// Bring up the session core over externally supplied TUN halves. The
    /// production path layers the TLS accept loop on top; tests attach
    /// in-memory streams directly.
    pub async fn start_with<R, W>(
        cfg: Config,
        tun_reader: R,
        tun_writer: W,
        net: Arc<dyn PlatformNet>,
        tun_name: String,
    ) -> Result<Server>
    where
        R: PacketRead + 'static,
        W: PacketWrite + 'static,
    {
        net.setup_server(&tun_name, &cfg.subnet)?;

        let (stop, _) = watch::channel(false);
        let (tun_tx, tun_rx) = mpsc::channel(256);
        let subnet = cfg.subnet;
        let state = Arc::new(ServerState {
            cfg,
            sessions: SessionTable::new(),
            tun_tx,
            handlers: Mutex::new(JoinSet::new()),
        });

        let mut server = Server {
            state,
            stop,
            core: Vec::new(),
            net,
            tun_name,
            subnet,
        };
        server.spawn_tun_writer(tun_rx, tun_writer);
        server.spawn_tun_reader(tun_reader);
        server.spawn_reaper();
        Ok(server)
    }

    /// Hand an accepted (or in-memory) stream to a connection handler.
    pub async fn attach<S>(&self, stream: S, peer: impl Into<String>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let state = self.state.clone();
        let peer = peer.into();
        let mut handlers = self.state.handlers.lock().await;
        handlers.spawn(handle_connection(state, stream, peer));
    }

    /// Stop accepting, close every session, and wait for all tasks.
    pub async fn stop(mut self) -> Result<()> {
        info!("shutting down server");
        self.stop.send_replace(true);
        for session in self.state.sessions.drain().await {
            session.close().await;
        }
        {
            let mut handlers = self.state.handlers.lock().await;
            handlers.shutdown().await;
        }
        for handle in self.core.drain(..) {
            let _ = handle.await;
        }
        self.net.teardown_server(&self.tun_name, &self.subnet)?;
        info!("server stopped");
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.state.sessions.len().await
    }

    pub async fn has_session(&self, ip: IpAddr) -> bool {
        self.state.sessions.lookup(ip).await.is_some()
    }

    pub async fn session_idle(&self, ip: IpAddr) -> Option<Duration> {
        Some(self.state.sessions.lookup(ip).await?.idle_for())
    }

    fn spawn_accept_loop(&mut self, listener: TcpListener, acceptor: TlsAcceptor) {
        let state = self.state.clone();
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => { if *stop.borrow() { break; } },
                    accepted = listener.accept() => {
                        let (tcp, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                error!("failed to accept connection: {}", err);
                                continue;
                            }
                        };
                        let conn_state = state.clone();
                        let acceptor = acceptor.clone();
                        let mut handlers = state.handlers.lock().await;
                        handlers.spawn(async move {
                            match acceptor.accept(tcp).await {
                                Ok(stream) => {
                                    handle_connection(conn_state, stream, addr.to_string()).await;
                                }
                                Err(err) => warn!("TLS accept from {} failed: {}", addr, err),
                            }
                        });
                    }
                }
            }
        });
        self.core.push(handle);
    }

    /// Singleton writer: packets from every session funnel through one
    /// channel so each TUN write is one whole packet.
    fn spawn_tun_writer<W>(&mut self, mut tun_rx: mpsc::Receiver<Vec<u8>>, mut tun_writer: W)
    where
        W: PacketWrite + 'static,
    {
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => { if *stop.borrow() { break; } },
                    packet = tun_rx.recv() => {
                        let Some(packet) = packet else { break };
                        if let Err(err) = tun_writer.send(&packet).await {
                            error!("failed to write to TUN: {}", err);
                        }
                    }
                }
            }
        });
        self.core.push(handle);
    }

    /// Singleton reader: every packet leaving the TUN is routed to the
    /// session owning its destination address, or dropped.
    fn spawn_tun_reader<R>(&mut self, mut tun_reader: R)
    where
        R: PacketRead + 'static,
    {
        let state = self.state.clone();
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; state.cfg.packet_buf_len()];
            loop {
                let n = tokio::select! {
                    _ = stop.wait_for(|s| *s) => break,
                    read = tun_reader.recv(&mut buf) => match read {
                        Ok(n) => n,
                        Err(err) => {
                            error!("TUN read error: {}", err);
                            break;
                        }
                    },
                };
                let raw = &buf[..n];
                let hdr = match packet::parse(raw) {
                    Ok(hdr) => hdr,
                    Err(err) => {
                        debug!("dropping unparseable TUN packet: {}", err);
                        continue;
                    }
                };
                // Resolve the session, then release the table before the
                // (potentially blocking) stream write.
                let Some(session) = state.sessions.lookup(hdr.dst).await else {
                    debug!("no session for {}, dropping packet", hdr.dst);
                    continue;
                };
                debug!(
                    "forwarding {} packet {} -> {} ({} bytes) to {}",
                    hdr.protocol_name(),
                    hdr.src,
                    hdr.dst,
                    n,
                    session.id()
                );
                let record = session.cipher().encrypt(raw);
                if let Err(err) = session.send_frame(&Message::new(MSG_DATA, record)).await {
                    warn!("write to {} failed: {}", session.id(), err);
                    state.sessions.remove_if_current(hdr.dst, &session).await;
                    session.close().await;
                }
            }
        });
        self.core.push(handle);
    }

    /// Periodically evict sessions whose last inbound frame is older than
    /// the idle timeout.
    fn spawn_reaper(&mut self) {
        let state = self.state.clone();
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = interval(state.cfg.reap_interval);
            tick.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = stop.wait_for(|s| *s) => break,
                    _ = tick.tick() => {}
                }
                for session in state.sessions.snapshot().await {
                    if session.idle_for() > state.cfg.timeout {
                        info!(
                            "removing idle client {} ({})",
                            session.id(),
                            session.inner_ip()
                        );
                        state
                            .sessions
                            .remove_if_current(session.inner_ip(), &session)
                            .await;
                        session.close().await;
                    }
                }
            }
        });
        self.core.push(handle);
    }
}

/// Authenticate one connection and run its frame loop until the stream
/// fails, the client disconnects, or the session is closed from outside.
async fn handle_connection<S>(state: Arc<ServerState>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    info!("new client connection from {}", peer);
    let (mut reader, writer) = tokio::io::split(stream);

    let first = match timeout(state.cfg.handshake_timeout, protocol::read_message(&mut reader)).await
    {
        Ok(Ok(msg)) => msg,
        Ok(Err(err)) => {
            warn!("failed to read handshake from {}: {}", peer, err);
            return;
        }
        Err(_) => {
            warn!("handshake from {} timed out", peer);
            return;
        }
    };
    if first.msg_type != MSG_HANDSHAKE {
        warn!(
            "expected handshake from {} but got type {}, closing",
            peer, first.msg_type
        );
        return;
    }
    let handshake = match protocol::parse_handshake(&first.data) {
        Ok(hs) => hs,
        Err(err) => {
            warn!("failed to parse handshake from {}: {}", peer, err);
            return;
        }
    };
    if handshake.version != PROTOCOL_VERSION {
        warn!(
            "client {} requested unsupported version {}",
            peer, handshake.version
        );
        return;
    }
    if !crypto::keys_match(&handshake.shared_key, &state.cfg.shared_key) {
        warn!("client {} failed authentication", peer);
        return;
    }

    let cipher = match PacketCipher::new(&state.cfg.shared_key) {
        Ok(cipher) => cipher,
        Err(err) => {
            error!("cipher construction failed: {}", err);
            return;
        }
    };
    let session = Session::new(peer.clone(), handshake.inner_ip, cipher, Box::new(writer));

    if let Some(displaced) = state.sessions.insert(session.clone()).await {
        info!(
            "client {} displaces {} for inner IP {}",
            peer,
            displaced.id(),
            displaced.inner_ip()
        );
        displaced.close().await;
    }

    let ack = Message::new(MSG_HANDSHAKE_ACK, ACK_OK.to_vec());
    if let Err(err) = session.send_frame(&ack).await {
        error!("failed to send handshake ack to {}: {}", peer, err);
        state
            .sessions
            .remove_if_current(handshake.inner_ip, &session)
            .await;
        session.close().await;
        return;
    }
    info!("client {} authenticated with inner IP {}", peer, handshake.inner_ip);

    let mut closed = session.closed_signal();
    loop {
        let msg = tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            read = protocol::read_message(&mut reader) => match read {
                Ok(msg) => msg,
                Err(err) => {
                    match err {
                        ProtocolError::Io(_) => debug!("client {} read ended: {}", peer, err),
                        _ => warn!("client {} protocol error: {}", peer, err),
                    }
                    break;
                }
            },
        };
        session.touch();
        match msg.msg_type {
            MSG_DATA => {
                let plaintext = match session.cipher().decrypt(&msg.data) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!("failed to decrypt packet from {}: {}", peer, err);
                        continue;
                    }
                };
                match packet::parse(&plaintext) {
                    Ok(hdr) => debug!(
                        "received {} packet {} -> {} ({} bytes) from {}",
                        hdr.protocol_name(),
                        hdr.src,
                        hdr.dst,
                        plaintext.len(),
                        peer
                    ),
                    Err(err) => {
                        warn!("dropping malformed packet from {}: {}", peer, err);
                        continue;
                    }
                }
                if state.tun_tx.send(plaintext).await.is_err() {
                    break; // server shutting down
                }
            }
            MSG_KEEPALIVE => {
                if let Err(err) = session.send_frame(&Message::empty(MSG_KEEPALIVE)).await {
                    warn!("failed to answer keepalive from {}: {}", peer, err);
                    break;
                }
            }
            MSG_DISCONNECT => {
                info!("client {} disconnected", peer);
                break;
            }
            other => debug!("ignoring frame type {} from {}", other, peer),
        }
    }

    // A reaper or displacing handshake may have beaten us here; removal is
    // guarded by identity and closing is idempotent.
    if state
        .sessions
        .remove_if_current(handshake.inner_ip, &session)
        .await
    {
        debug!("client {} removed from session table", peer);
    }
    session.close().await;
    info!("connection from {} closed", peer);
}
