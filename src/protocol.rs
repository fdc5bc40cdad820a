//! Framed message protocol carried on the TLS stream.
//!
//! Every unit on the wire is `type(1) || length(4, big-endian) || data`.
//! The framer is stateless; it is safe for one reader task and one writer
//! task to share a stream as long as the caller serializes writes.

use std::io;
use std::net::IpAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MSG_HANDSHAKE: u8 = 1;
pub const MSG_HANDSHAKE_ACK: u8 = 2;
pub const MSG_KEEPALIVE: u8 = 3;
pub const MSG_DISCONNECT: u8 = 4;
pub const MSG_DATA: u8 = 10;
pub const MSG_ERROR: u8 = 255;

/// Hard cap on a frame's payload. Exceeding it is fatal for the connection.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Wire protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Payload the server sends back in a HANDSHAKE_ACK.
pub const ACK_OK: &[u8] = b"OK";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame length {0} exceeds {MAX_FRAME_LEN} byte cap")]
    Oversize(u32),
    #[error("stream ended mid-frame")]
    Truncated,
    #[error("malformed handshake payload")]
    MalformedHandshake,
    #[error("unexpected message type {0}")]
    UnexpectedType(u8),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: u8, data: Vec<u8>) -> Self {
        Self { msg_type, data }
    }

    pub fn empty(msg_type: u8) -> Self {
        Self { msg_type, data: Vec::new() }
    }
}

fn truncated(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(err)
    }
}

/// Read one frame. The length is validated against [`MAX_FRAME_LEN`] before
/// any payload byte is consumed. EOF on the first header byte surfaces as an
/// ordinary I/O error (a peer hanging up between frames is not truncation).
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let msg_type = reader.read_u8().await?;
    let length = reader.read_u32().await.map_err(truncated)?;
    if length > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversize(length));
    }
    let mut data = vec![0u8; length as usize];
    if length > 0 {
        reader.read_exact(&mut data).await.map_err(truncated)?;
    }
    Ok(Message { msg_type, data })
}

/// Write one frame. The header and payload go out as a single write so a
/// frame is never split across an await point.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = msg.data.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversize(len));
    }
    let mut frame = Vec::with_capacity(5 + msg.data.len());
    frame.push(msg.msg_type);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&msg.data);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Decoded HANDSHAKE payload:
/// `version(1) || ip_len(1) || ip[ip_len] || shared_key[..]`.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub version: u8,
    pub inner_ip: IpAddr,
    pub shared_key: Vec<u8>,
}

/// Build the HANDSHAKE message a client opens with.
pub fn encode_handshake(inner_ip: IpAddr, shared_key: &[u8]) -> Message {
    let ip = inner_ip.to_string();
    let mut data = Vec::with_capacity(2 + ip.len() + shared_key.len());
    data.push(PROTOCOL_VERSION);
    data.push(ip.len() as u8);
    data.extend_from_slice(ip.as_bytes());
    data.extend_from_slice(shared_key);
    Message::new(MSG_HANDSHAKE, data)
}

/// Parse a HANDSHAKE payload. The requested inner IP must be a real address;
/// text that does not parse could never be routed to and is rejected here.
pub fn parse_handshake(data: &[u8]) -> Result<Handshake, ProtocolError> {
    if data.len() < 2 {
        return Err(ProtocolError::MalformedHandshake);
    }
    let version = data[0];
    let ip_len = data[1] as usize;
    if data.len() < 2 + ip_len {
        return Err(ProtocolError::MalformedHandshake);
    }
    let ip_text =
        std::str::from_utf8(&data[2..2 + ip_len]).map_err(|_| ProtocolError::MalformedHandshake)?;
    let inner_ip: IpAddr = ip_text.parse().map_err(|_| ProtocolError::MalformedHandshake)?;
    Ok(Handshake {
        version,
        inner_ip,
        shared_key: data[2 + ip_len..].to_vec(),
    })
}
