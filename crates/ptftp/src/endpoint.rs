use bytes::Bytes;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ErrorCode, Result, TftpError};
use crate::packet::{self, MAX_DATAGRAM_SIZE, Opcode};

pub async fn bind_udp_socket(listen_ip: Ipv4Addr, listen_port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddrV4::new(listen_ip, listen_port)).await
}

/// One UDP conversation: the peer address plus the local socket used to
/// talk to it.
///
/// Session endpoints own a dedicated ephemeral socket that is closed when
/// the endpoint is dropped. The dispatcher also builds short-lived endpoints
/// on the well-known socket to answer malformed requests.
pub struct Endpoint {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

impl Endpoint {
    pub fn new(peer: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self {
            peer,
            socket,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_message(&self, datagram: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(datagram, self.peer).await?;
        debug!("{}: Sent {} out of {}", self, sent, datagram.len());
        if sent != datagram.len() {
            return Err(TftpError::Io(std::io::Error::other(format!(
                "Send size mismatch. Sent: {}, Expected: {}",
                sent,
                datagram.len()
            ))));
        }
        Ok(())
    }

    pub async fn send_error(&self, code: ErrorCode, message: &str) -> Result<()> {
        self.send_message(&packet::encode_error(code, message)).await?;
        debug!("{}: Sent ERROR packet: code={}, msg={}", self, code, message);
        Ok(())
    }

    /// Wait until `deadline` for a datagram from the peer.
    ///
    /// Datagrams from any other address are logged and skipped. An ERROR
    /// from the peer is returned as [`TftpError::EarlyTermination`]. Returns
    /// `Ok(None)` once the deadline passes.
    pub async fn receive_message(&mut self, deadline: Instant) -> Result<Option<(u16, Bytes)>> {
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;
            let (size, from) = match received {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };
            if from != self.peer {
                warn!(
                    "{}: Ignore {} bytes from unknown source {}",
                    self, size, from
                );
                continue;
            }
            let Ok((opcode, payload)) = packet::split_message(&self.buf[..size]) else {
                warn!("{}: Ignore {} bytes too short for TFTP", self, size);
                continue;
            };
            if opcode == Opcode::Error as u16 {
                return Err(packet::parse_error(payload));
            }
            return Ok(Some((opcode, Bytes::copy_from_slice(payload))));
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.peer)
    }
}
