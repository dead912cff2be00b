//! Read-only TFTP server for network boot.
//!
//! Implements RFC 1350 read requests in octet mode with the RFC 2347 option
//! extension (`timeout`, `blksize`, `tsize`). Each accepted request is
//! served by its own task over a dedicated ephemeral socket; the directory
//! a client may read from is looked up per client IP through a
//! [`ptftp_roots::RootRegistry`].
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use ptftp::{SessionSettings, TftpServer, TracingAuditSink, bind_udp_socket};
//! use ptftp_roots::StaticRootRegistry;
//!
//! # async fn run() -> ptftp::Result<()> {
//! let socket = bind_udp_socket(Ipv4Addr::UNSPECIFIED, 69).await?;
//! let registry = StaticRootRegistry::new().with_root("0.0.0.0", "/srv/tftp");
//! let mut server = TftpServer::new(
//!     socket,
//!     Arc::new(registry),
//!     SessionSettings::default(),
//!     Arc::new(TracingAuditSink),
//! );
//! server.serve_forever(16).await?;
//! server.wait_requests_done().await
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod packet;
pub mod request;
pub mod server;

pub use audit::{AuditEvent, AuditSink, NullAuditSink, TracingAuditSink};
pub use config::{LogFormat, TftpConfig, load_config, validate_config, write_config};
pub use endpoint::{Endpoint, bind_udp_socket};
pub use error::{ErrorCode, Result, TftpError};
pub use request::{ReadRequest, Request, TransferSummary};
pub use server::{DEFAULT_MAX_SESSIONS, SessionSettings, TftpServer};
