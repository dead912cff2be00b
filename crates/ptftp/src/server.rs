use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ptftp_roots::{DEFAULT_CLIENT, RootRegistry, RootsError};

use crate::audit::{AuditEvent, AuditSink};
use crate::delivery::DEFAULT_RETRY_COUNT;
use crate::endpoint::Endpoint;
use crate::error::{Result, TftpError};
use crate::options::DEFAULT_ACK_TIMEOUT;
use crate::packet::{self, MAX_DATAGRAM_SIZE};
use crate::request::Request;

pub const DEFAULT_MAX_SESSIONS: usize = 16;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing knobs shared by the dispatcher and every session it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// ACK timeout when the client does not negotiate one
    pub default_timeout: Duration,
    /// Send attempts per message before the transfer is interrupted
    pub retry_count: u32,
    /// How long the dispatcher waits for a request before reaping sessions
    pub poll_interval: Duration,
    /// Per-session wait in [`TftpServer::wait_requests_done`]
    pub shutdown_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_ACK_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Read-only TFTP server.
///
/// Requests arrive on the well-known socket. Every accepted request is
/// served by its own task over a fresh ephemeral socket, so a slow or
/// silent client never holds up the others. The dispatcher alone owns the
/// session table; sessions never see it.
pub struct TftpServer {
    socket: Arc<UdpSocket>,
    registry: Arc<dyn RootRegistry>,
    settings: SessionSettings,
    audit: Arc<dyn AuditSink>,
    sessions: HashMap<SocketAddr, JoinHandle<()>>,
    shutdown: CancellationToken,
    buf: Vec<u8>,
}

impl TftpServer {
    pub fn new(
        socket: UdpSocket,
        registry: Arc<dyn RootRegistry>,
        settings: SessionSettings,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            registry,
            settings,
            audit,
            sessions: HashMap::new(),
            shutdown: CancellationToken::new(),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Cancelling the returned token stops [`TftpServer::serve_forever`].
    /// Running sessions are not interrupted.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sessions registered and not yet reaped.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Accept read requests until the shutdown token is cancelled.
    pub async fn serve_forever(&mut self, max_sessions: usize) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!("{}: Serving up to {} sessions", self, max_sessions);
        self.audit
            .record(AuditEvent::server_started(local_addr, max_sessions));

        let shutdown = self.shutdown.clone();
        loop {
            let deadline = Instant::now() + self.settings.poll_interval;
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.get_request(deadline) => received?,
            };
            let Some((request, peer)) = received else {
                self.pop_finished();
                debug!("{}: Periodic maintenance performed", self);
                continue;
            };
            if let Err(e) = self.accept(request, peer, max_sessions).await {
                error!("{}: Failed to accept request from {}: {}", self, peer, e);
            }
        }

        info!("{}: Stopped accepting requests", self);
        self.audit.record(AuditEvent::server_shutdown(
            "shutdown requested",
            self.sessions.len(),
        ));
        Ok(())
    }

    /// Wait for every registered session to finish, up to the shutdown
    /// timeout each. Fails naming the peers whose sessions are still running.
    pub async fn wait_requests_done(&mut self) -> Result<()> {
        let sessions: Vec<_> = self.sessions.drain().collect();
        for (peer, mut handle) in sessions {
            match tokio::time::timeout(self.settings.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("{}: Session for {} is joined at close", self, peer),
                Ok(Err(e)) => error!("{}: Session for {} panicked: {}", self, peer, e),
                Err(_) => {
                    self.sessions.insert(peer, handle);
                }
            }
        }
        if self.sessions.is_empty() {
            return Ok(());
        }
        let mut still_running: Vec<String> =
            self.sessions.keys().map(|peer| peer.to_string()).collect();
        still_running.sort();
        Err(TftpError::Other(anyhow::anyhow!(
            "Sessions are still active: {}",
            still_running.join(", ")
        )))
    }

    /// Receive datagrams on the well-known socket until a request worth
    /// accepting arrives or `deadline` passes.
    ///
    /// Malformed requests are answered from the well-known socket. Non-TFTP
    /// data and repeated requests from a peer with a running session are
    /// dropped.
    async fn get_request(&mut self, deadline: Instant) -> Result<Option<(Request, SocketAddr)>> {
        loop {
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;
            let (size, peer) = match received {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };
            let datagram = Bytes::copy_from_slice(&self.buf[..size]);
            let request = match packet::parse_request(&datagram) {
                Ok(request) => request,
                Err(TftpError::NotTftp) => {
                    warn!("{}: Ignore Non-TFTP {} bytes from {}", self, size, peer);
                    continue;
                }
                Err(e) => {
                    warn!("{}: Request cannot be executed due to: {}", self, e);
                    self.audit
                        .record(AuditEvent::protocol_violation(peer, &e.to_string()));
                    if let Some((code, message)) = e.wire_error() {
                        let temporary = Endpoint::new(peer, Arc::clone(&self.socket));
                        if let Err(e) = temporary.send_error(code, message).await {
                            warn!("{}: Failed to reply to {}: {}", self, peer, e);
                        }
                    }
                    continue;
                }
            };
            if self.sessions.get(&peer).is_some_and(|handle| !handle.is_finished()) {
                warn!(
                    "{}: Ignore {} from already active {}",
                    self, request, peer
                );
                continue;
            }
            return Ok(Some((request, peer)));
        }
    }

    async fn accept(&mut self, request: Request, peer: SocketAddr, max_sessions: usize) -> Result<()> {
        let session_socket = UdpSocket::bind(SocketAddr::new(self.local_addr()?.ip(), 0)).await?;
        let endpoint = Endpoint::new(peer, Arc::new(session_socket));

        self.pop_finished();
        if self.sessions.len() >= max_sessions {
            error!(
                "{}: Can't open session due to lack of free client slots",
                self
            );
            self.audit.record(AuditEvent::resource_exhaustion(
                peer,
                self.sessions.len(),
                max_sessions,
            ));
            let err = TftpError::undefined("Not enough resources");
            if let Some((code, message)) = err.wire_error() {
                endpoint.send_error(code, message).await?;
            }
            return Ok(());
        }

        let (root, file) = match self.open_file(&request, peer.ip()).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("{}: Can't fulfil {} because {}", self, request, e);
                if let Some((code, message)) = e.wire_error() {
                    self.audit.record(AuditEvent::read_denied(
                        peer,
                        request.filename(),
                        code as u16,
                        message,
                    ));
                    endpoint.send_error(code, message).await?;
                }
                return Ok(());
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        self.audit.record(AuditEvent::read_request(
            peer,
            endpoint.local_addr()?,
            request.filename(),
            &root,
            serde_json::to_value(request.options()).unwrap_or_default(),
            &correlation_id,
        ));
        let session = client_session(
            request,
            file,
            endpoint,
            self.settings,
            Arc::clone(&self.audit),
            correlation_id,
        );
        self.sessions.insert(peer, tokio::spawn(session));
        Ok(())
    }

    async fn open_file(&self, request: &Request, client_ip: IpAddr) -> Result<(PathBuf, File)> {
        let root = self.find_root(client_ip)?;
        let file = request.open_file(&root).await?;
        Ok((root, file))
    }

    /// Root configured for `client_ip`, falling back to the wildcard entry.
    fn find_root(&self, client_ip: IpAddr) -> Result<PathBuf> {
        let client_ip = client_ip.to_string();
        match self.registry.find_root_path(&client_ip) {
            Ok(root) => {
                info!("{}: Found explicit TFTP path {}", self, root.display());
                return Ok(root);
            }
            Err(RootsError::NotFound(_)) => {
                info!("{}: Can't find explicit TFTP path for {}", self, client_ip)
            }
            Err(e) => return Err(e.into()),
        }
        match self.registry.find_root_path(DEFAULT_CLIENT) {
            Ok(root) => {
                info!("{}: Use default TFTP path {}", self, root.display());
                Ok(root)
            }
            Err(RootsError::NotFound(_)) => Err(TftpError::access_violation(format!(
                "Server is not configured to serve {}",
                client_ip
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn pop_finished(&mut self) {
        self.sessions.retain(|peer, handle| {
            let finished = handle.is_finished();
            if finished {
                debug!("Session for {} is joined", peer);
            }
            !finished
        });
    }
}

impl fmt::Display for TftpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket.local_addr() {
            Ok(addr) => write!(f, "<Server {}>", addr),
            Err(_) => write!(f, "<Server>"),
        }
    }
}

/// Serve one accepted request to completion. Every outcome ends here: the
/// task never propagates errors to the dispatcher.
async fn client_session(
    request: Request,
    file: File,
    mut endpoint: Endpoint,
    settings: SessionSettings,
    audit: Arc<dyn AuditSink>,
    correlation_id: String,
) {
    let peer = endpoint.peer();
    match request.execute(&mut endpoint, file, &settings).await {
        Ok(summary) => {
            let elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX);
            audit.record(AuditEvent::transfer_completed(
                peer,
                request.filename(),
                summary.bytes_sent,
                summary.blocks_sent,
                summary.block_size,
                elapsed_ms,
                &correlation_id,
            ));
        }
        Err(TftpError::EarlyTermination { code, message }) => {
            warn!("{}: Client error: [0x{:02x}] {:?}", request, code, message);
            audit.record(AuditEvent::transfer_aborted(
                peer,
                request.filename(),
                code,
                &message,
                &correlation_id,
            ));
        }
        Err(e) => {
            match &e {
                TftpError::Protocol { .. } => {
                    warn!("{}: A TFTP error while serving: {}", request, e)
                }
                _ => error!("{}: An unexpected error while serving {}: {}", request, endpoint, e),
            }
            audit.record(AuditEvent::transfer_failed(
                peer,
                request.filename(),
                &e.to_string(),
                &correlation_id,
            ));
            if let Some((code, message)) = e.wire_error()
                && let Err(send_err) = endpoint.send_error(code, message).await
            {
                warn!("{}: Failed to report error to {}: {}", request, endpoint, send_err);
            }
        }
    }
}
