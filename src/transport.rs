//! Transport - framed datagram delivery between peers
//!
//! Gen-1/2 peers exchange length-prefixed bincode frames over UDP:
//!
//! ```text
//! ┌────────────┬──────────────────────┐
//! │ len u32 LE │ bincode(PeerMessage) │
//! └────────────┴──────────────────────┘
//! ```
//!
//! Send failures are logged and swallowed - loss is indistinguishable from
//! a dropped datagram and the timeout machinery upstream recovers either
//! way. Frames that fail to decode (unknown tag, truncation) are dropped
//! with a log entry.

use crate::messages::PeerMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("frame of {0} bytes exceeds MAX_FRAME_LEN")]
    Oversize(usize),

    #[error("frame truncated: header declares {declared} bytes, datagram holds {held}")]
    Truncated { declared: usize, held: usize },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode a message as a length-prefixed frame.
pub fn encode_frame(msg: &PeerMessage) -> Result<Vec<u8>, TransportError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::Oversize(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame; the datagram boundary must match the declared length.
pub fn decode_frame(buf: &[u8]) -> Result<PeerMessage, TransportError> {
    if buf.len() < 4 {
        return Err(TransportError::Truncated {
            declared: 4,
            held: buf.len(),
        });
    }
    let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(TransportError::Oversize(declared));
    }
    let payload = &buf[4..];
    if payload.len() < declared {
        return Err(TransportError::Truncated {
            declared,
            held: payload.len(),
        });
    }
    Ok(bincode::deserialize(&payload[..declared])?)
}

/// A peer's UDP endpoint.
///
/// Cloned freely (`Arc` inside); one task receives, any task may send.
#[derive(Clone)]
pub struct Datagram {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl Datagram {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Fire-and-forget send. Never aborts the caller.
    pub async fn send(&self, addr: SocketAddr, msg: &PeerMessage) {
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = msg.kind(), %addr, error = %e, "dropping unsendable frame");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&frame, addr).await {
            warn!(kind = msg.kind(), %addr, error = %e, "send failed");
        } else {
            trace!(kind = msg.kind(), %addr, "sent");
        }
    }

    /// Receive the next well-formed frame.
    ///
    /// Malformed frames are logged and skipped; an I/O error (socket gone)
    /// surfaces so the receive loop can exit.
    pub async fn recv(&self) -> std::io::Result<(PeerMessage, SocketAddr)> {
        let mut buf = vec![0u8; MAX_FRAME_LEN + 4];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match decode_frame(&buf[..n]) {
                Ok(msg) => {
                    trace!(kind = msg.kind(), %from, "received");
                    return Ok((msg, from));
                }
                Err(e) => {
                    warn!(%from, error = %e, "dropping undecodable frame");
                }
            }
        }
    }
}
