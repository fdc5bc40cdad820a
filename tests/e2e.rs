//! End-to-end scenarios over in-memory transport streams and TUN stubs.
//!
//! The server core runs exactly as in production; only the TLS/TCP layer
//! and the kernel TUN device are replaced by `tokio::io::duplex` pipes and
//! `tun::memory_pair`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, timeout};

use spantun::config::Config;
use spantun::crypto::PacketCipher;
use spantun::platform::RecordingNet;
use spantun::protocol::{self, Message, ACK_OK, MSG_DATA, MSG_HANDSHAKE_ACK, MSG_KEEPALIVE};
use spantun::tun::{self, MemTun, PacketRead, PacketWrite};
use spantun::{Client, Server};

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

fn test_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    key
}

fn test_config() -> Config {
    Config {
        shared_key: test_key(),
        keep_alive: Duration::from_millis(200),
        timeout: Duration::from_millis(500),
        reap_interval: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Server core over an in-memory TUN; returns the "kernel" side of the TUN
/// for injecting and collecting packets.
async fn start_server(cfg: Config) -> (Server, MemTun) {
    let (device_side, kernel_side) = tun::memory_pair();
    let (tun_r, tun_w) = device_side.split();
    let server = Server::start_with(
        cfg,
        tun_r,
        tun_w,
        Arc::new(RecordingNet::new()),
        "memtun0".to_string(),
    )
    .await
    .expect("server core");
    (server, kernel_side)
}

/// Full client over a duplex stream attached to the server.
async fn connect_client(cfg: Config, server: &Server) -> (Client, MemTun) {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    server.attach(server_stream, "test-client").await;
    let (device_side, kernel_side) = tun::memory_pair();
    let (tun_r, tun_w) = device_side.split();
    let client = Client::connect_with(
        cfg,
        client_stream,
        tun_r,
        tun_w,
        Arc::new(RecordingNet::new()),
    )
    .await
    .expect("client connect");
    (client, kernel_side)
}

/// Hand-rolled peer: performs only the handshake, leaving the frame loop to
/// the test body.
async fn raw_handshake(
    server: &Server,
    peer: &str,
    inner_ip: Ipv4Addr,
    key: &[u8],
) -> DuplexStream {
    let (mut stream, server_stream) = tokio::io::duplex(256 * 1024);
    server.attach(server_stream, peer).await;
    let hello = protocol::encode_handshake(IpAddr::V4(inner_ip), key);
    protocol::write_message(&mut stream, &hello).await.unwrap();
    let reply = timeout(Duration::from_secs(5), protocol::read_message(&mut stream))
        .await
        .expect("handshake reply in time")
        .expect("handshake reply");
    assert_eq!(reply.msg_type, MSG_HANDSHAKE_ACK);
    assert_eq!(reply.data, ACK_OK);
    stream
}

/// IPv4 UDP datagram with the given addresses and payload.
fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + 8 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2] = (total >> 8) as u8;
    pkt[3] = total as u8;
    pkt[8] = 64;
    pkt[9] = 17; // UDP
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    // UDP header: src port 40000, dst port 53, length
    pkt[20..22].copy_from_slice(&40000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
    pkt[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);
    pkt
}

async fn recv_packet(tun: &mut MemTun) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let n = timeout(Duration::from_secs(5), tun.recv(&mut buf))
        .await
        .expect("packet in time")
        .expect("packet");
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn handshake_ok_registers_session() {
    let (server, _server_tun) = start_server(test_config()).await;
    let (client, _client_tun) = connect_client(test_config(), &server).await;

    assert_eq!(server.session_count().await, 1);
    assert!(server.has_session(IpAddr::V4(CLIENT_IP)).await);

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn handshake_key_mismatch_closes_without_ack() {
    let (server, _server_tun) = start_server(test_config()).await;

    let mut cfg = test_config();
    cfg.shared_key = [0xff; 32];
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    server.attach(server_stream, "bad-key-client").await;
    let (device_side, _kernel_side) = tun::memory_pair();
    let (tun_r, tun_w) = device_side.split();
    let result = Client::connect_with(
        cfg,
        client_stream,
        tun_r,
        tun_w,
        Arc::new(RecordingNet::new()),
    )
    .await;

    assert!(result.is_err(), "client must not authenticate");
    assert_eq!(server.session_count().await, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn data_path_server_to_client() {
    let (server, mut server_tun) = start_server(test_config()).await;
    let (client, mut client_tun) = connect_client(test_config(), &server).await;

    let payload = [0xabu8; 100];
    let pkt = udp_packet(Ipv4Addr::new(10, 0, 0, 1), CLIENT_IP, &payload);
    server_tun.send(&pkt).await.unwrap();

    let got = recv_packet(&mut client_tun).await;
    assert_eq!(got, pkt, "client TUN must see the exact packet");

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn data_path_client_to_server() {
    let (server, mut server_tun) = start_server(test_config()).await;
    let (client, mut client_tun) = connect_client(test_config(), &server).await;

    let pkt = udp_packet(CLIENT_IP, Ipv4Addr::new(8, 8, 8, 8), b"ping out");
    client_tun.send(&pkt).await.unwrap();

    let got = recv_packet(&mut server_tun).await;
    assert_eq!(got, pkt, "server TUN must see the exact packet");

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn keepalive_is_answered_and_advances_last_seen() {
    let (server, _server_tun) = start_server(test_config()).await;
    let mut stream = raw_handshake(&server, "ka-client", CLIENT_IP, &test_key()).await;

    sleep(Duration::from_millis(300)).await;
    protocol::write_message(&mut stream, &Message::empty(MSG_KEEPALIVE))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), protocol::read_message(&mut stream))
        .await
        .expect("keepalive reply in time")
        .expect("keepalive reply");
    assert_eq!(reply.msg_type, MSG_KEEPALIVE);

    let idle = server
        .session_idle(IpAddr::V4(CLIENT_IP))
        .await
        .expect("session present");
    assert!(idle < Duration::from_millis(200), "last_seen must advance");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn keepalives_keep_a_quiet_client_alive() {
    let (server, _server_tun) = start_server(test_config()).await;
    // keep_alive (200ms) beats the idle timeout (500ms); no data flows.
    let (client, _client_tun) = connect_client(test_config(), &server).await;

    sleep(Duration::from_millis(900)).await;
    assert!(
        server.has_session(IpAddr::V4(CLIENT_IP)).await,
        "keepalives must hold the session open"
    );

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn idle_session_is_reaped_and_stream_closed() {
    let (server, _server_tun) = start_server(test_config()).await;
    let mut stream = raw_handshake(&server, "frozen-client", CLIENT_IP, &test_key()).await;
    assert!(server.has_session(IpAddr::V4(CLIENT_IP)).await);

    // Freeze: no frames at all. timeout (500ms) + reap interval (100ms).
    sleep(Duration::from_millis(900)).await;
    assert!(
        !server.has_session(IpAddr::V4(CLIENT_IP)).await,
        "idle session must be evicted"
    );
    assert!(
        timeout(Duration::from_secs(5), protocol::read_message(&mut stream))
            .await
            .expect("read returns after close")
            .is_err(),
        "server must close the evicted stream"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn reaper_spares_active_sessions() {
    let (server, _server_tun) = start_server(test_config()).await;
    let (client, _client_tun) = connect_client(test_config(), &server).await;
    let mut frozen =
        raw_handshake(&server, "frozen-client", Ipv4Addr::new(10, 0, 0, 3), &test_key()).await;

    sleep(Duration::from_millis(900)).await;
    assert!(
        server.has_session(IpAddr::V4(CLIENT_IP)).await,
        "active session must survive"
    );
    assert!(
        !server.has_session(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))).await,
        "frozen session must be evicted"
    );
    assert!(protocol::read_message(&mut frozen).await.is_err());

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_inner_ip_displaces_first_client() {
    let (server, mut server_tun) = start_server(test_config()).await;
    let mut first = raw_handshake(&server, "first-client", CLIENT_IP, &test_key()).await;
    let mut second = raw_handshake(&server, "second-client", CLIENT_IP, &test_key()).await;

    assert_eq!(server.session_count().await, 1);

    // The first client's stream is closed by the displacement.
    assert!(
        timeout(Duration::from_secs(5), protocol::read_message(&mut first))
            .await
            .expect("read returns after displacement")
            .is_err(),
        "first stream must be closed"
    );

    // The surviving entry is the second client: its data still flows.
    let cipher = PacketCipher::new(&test_key()).unwrap();
    let pkt = udp_packet(CLIENT_IP, Ipv4Addr::new(1, 1, 1, 1), b"still here");
    let msg = Message::new(MSG_DATA, cipher.encrypt(&pkt));
    protocol::write_message(&mut second, &msg).await.unwrap();
    assert_eq!(recv_packet(&mut server_tun).await, pkt);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversize_frame_terminates_session() {
    let (server, _server_tun) = start_server(test_config()).await;
    let mut stream = raw_handshake(&server, "oversize-client", CLIENT_IP, &test_key()).await;

    // Header announcing a payload over the cap, with nothing behind it: the
    // server must fail from the header alone and drop the connection.
    let mut header = vec![MSG_DATA];
    header.extend_from_slice(&(1_048_577u32).to_be_bytes());
    stream.write_all(&header).await.unwrap();
    stream.flush().await.unwrap();

    assert!(
        timeout(Duration::from_secs(5), protocol::read_message(&mut stream))
            .await
            .expect("read returns after close")
            .is_err(),
        "server must close the stream"
    );
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count().await, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_disconnect_removes_session_and_restores_routes() {
    let (server, _server_tun) = start_server(test_config()).await;

    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    server.attach(server_stream, "leaving-client").await;
    let (device_side, _kernel_side) = tun::memory_pair();
    let (tun_r, tun_w) = device_side.split();
    let net = Arc::new(RecordingNet::new());
    let client = Client::connect_with(
        test_config(),
        client_stream,
        tun_r,
        tun_w,
        net.clone(),
    )
    .await
    .unwrap();
    assert_eq!(server.session_count().await, 1);

    client.disconnect().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.session_count().await, 0);

    let ops = net.ops();
    assert!(ops.iter().any(|op| op.starts_with("setup_client")));
    assert!(ops.iter().any(|op| op.starts_with("restore_client")));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_stop_closes_clients_and_tears_down() {
    let (device_side, _kernel_side) = tun::memory_pair();
    let (tun_r, tun_w) = device_side.split();
    let net = Arc::new(RecordingNet::new());
    let server = Server::start_with(
        test_config(),
        tun_r,
        tun_w,
        net.clone(),
        "memtun0".to_string(),
    )
    .await
    .unwrap();

    let (client, _client_tun) = connect_client(test_config(), &server).await;
    server.stop().await.unwrap();

    let mut stopped = client.stopped_signal();
    timeout(Duration::from_secs(5), stopped.wait_for(|s| *s))
        .await
        .expect("client observes the close in time")
        .expect("stop signal");

    let ops = net.ops();
    assert!(ops.iter().any(|op| op.starts_with("setup_server")));
    assert!(ops.iter().any(|op| op.starts_with("teardown_server")));

    client.disconnect().await.unwrap();
}
