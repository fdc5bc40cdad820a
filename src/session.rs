//! Server-side session records and the inner-IP routing table.
//!
//! The table owns each session; the TUN reader and reaper resolve
//! short-lived handles per operation. Removing a session from the table and
//! closing it is enough to collapse every reference.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, RwLock};

use crate::crypto::PacketCipher;
use crate::protocol::{self, Message, ProtocolError};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One authenticated, connected client.
pub struct Session {
    /// Remote transport address at accept time; stable logging identity.
    id: String,
    inner_ip: IpAddr,
    cipher: PacketCipher,
    /// Write half of the TLS stream. The lock serializes frames; it is held
    /// only across a single framed write.
    writer: Mutex<BoxedWriter>,
    last_seen: StdMutex<Instant>,
    /// Flips to true exactly once; the read loop watches it so a close from
    /// the reaper or a displacing handshake unblocks a pending read.
    shutdown: watch::Sender<bool>,
}

impl Session {
    pub fn new(id: String, inner_ip: IpAddr, cipher: PacketCipher, writer: BoxedWriter) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            inner_ip,
            cipher,
            writer: Mutex::new(writer),
            last_seen: StdMutex::new(Instant::now()),
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inner_ip(&self) -> IpAddr {
        self.inner_ip
    }

    pub fn cipher(&self) -> &PacketCipher {
        &self.cipher
    }

    /// Write one frame to this session's stream, serialized by the write
    /// lock.
    pub async fn send_frame(&self, msg: &Message) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        protocol::write_message(&mut **writer, msg).await
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().expect("last_seen lock").elapsed()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that resolves once the session is closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Close the session: wake the read loop, then shut the stream down.
    /// Safe to call more than once. `send_replace` stores the flag even when
    /// nobody is subscribed yet, so a close racing the handler's
    /// subscription is never lost.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Thread-safe map of inner IP to live session. Many readers (TUN egress,
/// reaper), rare writers (handshake insert, cleanup removal).
#[derive(Default)]
pub struct SessionTable {
    inner: RwLock<HashMap<IpAddr, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its inner IP. If another session held that IP
    /// it is returned so the caller can close it outside the lock.
    pub async fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut map = self.inner.write().await;
        map.insert(session.inner_ip(), session)
    }

    /// Remove the entry for `ip` only if it still is `session`. A handler
    /// cleaning up after being displaced must not take out its successor.
    pub async fn remove_if_current(&self, ip: IpAddr, session: &Arc<Session>) -> bool {
        let mut map = self.inner.write().await;
        match map.get(&ip) {
            Some(current) if Arc::ptr_eq(current, session) => {
                map.remove(&ip);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, ip: IpAddr) -> Option<Arc<Session>> {
        self.inner.read().await.get(&ip).cloned()
    }

    /// Handles to every live session, for scanning without holding the lock.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Empty the table, returning every session for shutdown.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        let mut map = self.inner.write().await;
        map.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
