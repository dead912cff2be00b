use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{Level, event};

/// Session lifecycle events for structured audit logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        max_sessions: usize,
    },

    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
        active_sessions: usize,
    },

    /// A read request accepted and handed to a session worker
    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        session_addr: String,
        filename: String,
        root: String,
        options: serde_json::Value,
    },

    /// A read request answered with an ERROR before any worker started
    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error_code: u16,
        reason: String,
    },

    /// Bad opcode or transfer mode on the well-known port
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    /// Session limit reached
    ResourceExhaustion {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        active_sessions: usize,
        max_sessions: usize,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks_sent: u64,
        block_size: usize,
        duration_ms: u64,
        /// Transfer throughput in bytes per second
        throughput_bps: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
    },

    /// The client sent an ERROR mid-transfer
    TransferAborted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error_code: u16,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonFields {
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn local_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    })
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: local_hostname().to_string(),
            service: "ptftp".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: &str) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(correlation_id.to_string());
        fields
    }
}

impl AuditEvent {
    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::ResourceExhaustion { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::TransferAborted { common, .. } => common,
        }
    }

    pub fn server_started(bind_addr: SocketAddr, max_sessions: usize) -> Self {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            max_sessions,
        }
    }

    pub fn server_shutdown(reason: &str, active_sessions: usize) -> Self {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
            active_sessions,
        }
    }

    pub fn read_request(
        client_addr: SocketAddr,
        session_addr: SocketAddr,
        filename: &str,
        root: &std::path::Path,
        options: serde_json::Value,
        correlation_id: &str,
    ) -> Self {
        AuditEvent::ReadRequest {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            session_addr: session_addr.to_string(),
            filename: filename.to_string(),
            root: root.display().to_string(),
            options,
        }
    }

    pub fn read_denied(client_addr: SocketAddr, filename: &str, error_code: u16, reason: &str) -> Self {
        AuditEvent::ReadDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error_code,
            reason: reason.to_string(),
        }
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) -> Self {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
    }

    pub fn resource_exhaustion(
        client_addr: SocketAddr,
        active_sessions: usize,
        max_sessions: usize,
    ) -> Self {
        AuditEvent::ResourceExhaustion {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            active_sessions,
            max_sessions,
        }
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks_sent: u64,
        block_size: usize,
        duration_ms: u64,
        correlation_id: &str,
    ) -> Self {
        let throughput_bps = if duration_ms > 0 {
            (bytes_transferred * 1000) / duration_ms
        } else {
            0
        };

        AuditEvent::TransferCompleted {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks_sent,
            block_size,
            duration_ms,
            throughput_bps,
        }
    }

    pub fn transfer_failed(
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
        correlation_id: &str,
    ) -> Self {
        AuditEvent::TransferFailed {
            common: CommonFields::with_correlation("warn", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
    }

    pub fn transfer_aborted(
        client_addr: SocketAddr,
        filename: &str,
        error_code: u16,
        message: &str,
        correlation_id: &str,
    ) -> Self {
        AuditEvent::TransferAborted {
            common: CommonFields::with_correlation("warn", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error_code,
            message: message.to_string(),
        }
    }
}

/// Where audit events go. Injected into the server so the protocol core
/// never decides how events are stored.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as a JSON `audit_event` field through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                event
            )
        });

        match event.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}
