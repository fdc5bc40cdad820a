//! Runtime configuration shared by the server and client endpoints.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;

use crate::crypto::KEY_LEN;

/// One configuration type covers both endpoints; each binary fills in the
/// fields its role uses and leaves the rest at their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the server listens on (`listen_addr`) or the client dials
    /// (`server_addr`), as `host:port`. A bare `:port` listen address binds
    /// all interfaces.
    pub listen_addr: String,
    pub server_addr: String,

    /// The server's address on the VPN subnet.
    pub server_ip: Ipv4Addr,
    /// The inner IP a client claims at handshake.
    pub client_ip: Ipv4Addr,
    /// The shared VPN subnet.
    pub subnet: Ipv4Net,
    /// DNS servers pushed to the client's resolver while connected.
    pub dns: Vec<IpAddr>,

    /// Name for the local TUN interface.
    pub tun_name: String,
    pub mtu: u16,
    pub shared_key: [u8; KEY_LEN],

    /// Client keepalive interval.
    pub keep_alive: Duration,
    /// Server-side idle timeout before a session is evicted.
    pub timeout: Duration,
    /// How often the idle reaper scans the session table.
    pub reap_interval: Duration,
    /// Deadline for a freshly accepted connection to complete its handshake.
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ":9999".to_string(),
            server_addr: "localhost:9999".to_string(),
            server_ip: Ipv4Addr::new(10, 0, 0, 1),
            client_ip: Ipv4Addr::new(10, 0, 0, 2),
            subnet: "10.0.0.0/24".parse().expect("default subnet"),
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            tun_name: "spantun0".to_string(),
            mtu: 1400,
            shared_key: [0u8; KEY_LEN],
            keep_alive: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Buffer size for a single TUN read: the MTU plus a small allowance for
    /// overhead the kernel may hand us.
    pub fn packet_buf_len(&self) -> usize {
        self.mtu as usize + 14
    }

    /// Normalize a listen address for binding: Go-style `:9999` means all
    /// interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Host part of `server_addr`, used for the pinned route and TLS SNI.
    pub fn server_host(&self) -> &str {
        match self.server_addr.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.server_addr,
        }
    }
}

/// Decode a hex-encoded 32-byte shared key.
pub fn parse_key_hex(s: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(s.trim()).context("shared key is not valid hex")?;
    key_from_bytes(&bytes)
}

/// Validate raw key material.
pub fn key_from_bytes(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    if bytes.len() != KEY_LEN {
        bail!("invalid key size: {} must be {} bytes", bytes.len(), KEY_LEN);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(bytes);
    Ok(key)
}

/// Generate a random shared key.
pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_surface() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, ":9999");
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9999");
        assert_eq!(cfg.server_addr, "localhost:9999");
        assert_eq!(cfg.server_host(), "localhost");
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.keep_alive, Duration::from_secs(30));
        assert_eq!(cfg.timeout, Duration::from_secs(60));
    }

    #[test]
    fn key_parsing_rejects_bad_lengths() {
        assert!(parse_key_hex(&"00".repeat(32)).is_ok());
        assert!(parse_key_hex(&"00".repeat(16)).is_err());
        assert!(parse_key_hex("not-hex").is_err());
        assert!(key_from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn random_keys_differ() {
        assert_ne!(random_key(), random_key());
    }
}
