use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TftpError};
use crate::packet::{self, IndexedMessage, Opcode};

pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Send/wait/retry over one endpoint: every message is either acknowledged
/// by the peer or the transfer fails with an undefined error.
pub struct ReliableStream<'a> {
    endpoint: &'a mut Endpoint,
    ack_timeout: Duration,
    retry_count: u32,
}

impl<'a> ReliableStream<'a> {
    pub fn new(endpoint: &'a mut Endpoint, ack_timeout: Duration, retry_count: u32) -> Self {
        Self {
            endpoint,
            ack_timeout,
            retry_count,
        }
    }

    pub async fn send_acknowledged(&mut self, message: &IndexedMessage) -> Result<()> {
        let datagram = message.encode();
        for attempt in 1..=self.retry_count {
            self.endpoint.send_message(&datagram).await?;
            if self.wait_acknowledged(message).await? {
                return Ok(());
            }
            warn!(
                "{}: Timeout while waiting ACK for {}. Attempt {}",
                self.endpoint, message, attempt
            );
        }
        Err(TftpError::undefined(format!(
            "{} unacknowledged. Transmission interrupted.",
            message
        )))
    }

    /// One attempt: wait for the matching ACK until this attempt's deadline.
    ///
    /// ACKs for other indices are skipped without extending the deadline.
    /// Anything other than an ACK aborts the transfer.
    async fn wait_acknowledged(&mut self, message: &IndexedMessage) -> Result<bool> {
        let deadline = Instant::now() + self.ack_timeout;
        while let Some((opcode, payload)) = self.endpoint.receive_message(deadline).await? {
            if opcode != Opcode::Ack as u16 {
                return Err(TftpError::illegal_operation(format!(
                    "Non-ACK request received: 0x{:02x}",
                    opcode
                )));
            }
            match packet::parse_ack(&payload) {
                Some(index) if message.is_acknowledged_by(index) => return Ok(true),
                Some(index) => info!("{}: {} ignored ACK {}", self.endpoint, message, index),
                None => warn!("{}: Ignore truncated ACK for {}", self.endpoint, message),
            }
        }
        Ok(false)
    }
}
