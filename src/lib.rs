//! spantun — point-to-multipoint layer-3 VPN over TLS.
//!
//! A server terminates TLS sessions from many clients and bridges each
//! client's TUN interface onto a shared subnet. IP packets travel as
//! AES-256-CTR records inside length-prefixed frames on the TLS stream;
//! the server routes TUN egress to clients by inner destination address.

pub mod client;
pub mod config;
pub mod crypto;
pub mod packet;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;
pub mod tun;

pub use client::Client;
pub use config::Config;
pub use server::Server;
