//! TUN device access.
//!
//! The kernel hands us whole IP packets, one per read; writes take one
//! whole packet. The device splits into a read half and a write half so the
//! single reader task and the (serialized) writers stay independent. The
//! same trait surface is implemented by an in-memory pair for tests.

use std::io;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Packet-granular read side of a TUN-like device.
#[async_trait]
pub trait PacketRead: Send {
    /// Read one whole IP packet into `buf`, returning its length.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Packet-granular write side of a TUN-like device.
#[async_trait]
pub trait PacketWrite: Send {
    /// Write one whole IP packet.
    async fn send(&mut self, packet: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct TunOptions {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

/// A configured kernel TUN interface.
pub struct TunDevice {
    device: tun2::AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create and bring up a TUN interface.
    pub fn open(opts: &TunOptions) -> Result<Self> {
        let mut config = tun2::Configuration::default();
        config
            .tun_name(&opts.name)
            .address(opts.address)
            .netmask(opts.netmask)
            .mtu(opts.mtu)
            .up();

        #[cfg(target_os = "linux")]
        config.platform_config(|p| {
            p.packet_information(false);
        });

        #[cfg(target_os = "macos")]
        config.platform_config(|p| {
            p.packet_information(false);
        });

        let device = tun2::create_as_async(&config).context("failed to create TUN device")?;
        info!(
            "TUN interface {} up with address {}/{} mtu {}",
            opts.name, opts.address, opts.netmask, opts.mtu
        );
        Ok(Self {
            device,
            name: opts.name.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn split(self) -> (TunReader, TunWriter) {
        let (rd, wr) = tokio::io::split(self.device);
        (TunReader(rd), TunWriter(wr))
    }
}

/// Warn early when TUN creation is doomed to fail.
pub fn check_permissions() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if std::fs::metadata("/dev/net/tun").is_err() {
            anyhow::bail!("TUN device not available; is the tun module loaded?");
        }
    }
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            anyhow::bail!("root privileges required to create TUN interfaces");
        }
    }
    Ok(())
}

pub struct TunReader(ReadHalf<tun2::AsyncDevice>);
pub struct TunWriter(WriteHalf<tun2::AsyncDevice>);

#[async_trait]
impl PacketRead for TunReader {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

#[async_trait]
impl PacketWrite for TunWriter {
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.write_all(packet).await
    }
}

/// In-memory stand-in for a TUN device: packets sent on one end are read
/// from the other. Backs the end-to-end tests.
pub struct MemTun {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Create a linked pair of in-memory TUN endpoints.
pub fn memory_pair() -> (MemTun, MemTun) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (MemTun { tx: a_tx, rx: b_rx }, MemTun { tx: b_tx, rx: a_rx })
}

impl MemTun {
    pub fn split(self) -> (MemTunReader, MemTunWriter) {
        (MemTunReader(self.rx), MemTunWriter(self.tx))
    }
}

pub struct MemTunReader(mpsc::Receiver<Vec<u8>>);
pub struct MemTunWriter(mpsc::Sender<Vec<u8>>);

#[async_trait]
impl PacketRead for MemTun {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "tun closed"))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

#[async_trait]
impl PacketWrite for MemTun {
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"))
    }
}

#[async_trait]
impl PacketRead for MemTunReader {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .0
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "tun closed"))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

#[async_trait]
impl PacketWrite for MemTunWriter {
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_carries_whole_packets() {
        let (mut a, mut b) = memory_pair();
        a.send(&[1, 2, 3]).await.unwrap();
        a.send(&[4, 5]).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(b.recv(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[tokio::test]
    async fn split_halves_stay_linked() {
        let (a, b) = memory_pair();
        let (mut a_rd, _a_wr) = a.split();
        let (_b_rd, mut b_wr) = b.split();
        b_wr.send(&[9, 9, 9]).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(a_rd.recv(&mut buf).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn closed_pair_reports_eof() {
        let (mut a, b) = memory_pair();
        drop(b);
        let mut buf = [0u8; 4];
        assert_eq!(
            a.recv(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
