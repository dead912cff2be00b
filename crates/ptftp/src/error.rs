use std::fmt;
use thiserror::Error;

// RFC 1350 - TFTP Error Codes (the subset this server emits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,        // Not defined, see error message
    FileNotFound = 1,     // File not found
    AccessViolation = 2,  // Access violation
    IllegalOperation = 4, // Illegal TFTP operation
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Undefined => "Undefined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::IllegalOperation => "Illegal operation",
        };
        write!(f, "{} [0x{:02x}]", name, *self as u16)
    }
}

#[derive(Error, Debug)]
pub enum TftpError {
    /// Reported to the peer as an ERROR datagram.
    #[error("{code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    /// The peer sent an ERROR datagram; the transfer stops without a reply.
    #[error("Peer terminated the transfer: [0x{code:02x}] {message}")]
    EarlyTermination { code: u16, message: String },

    /// The datagram is not framed as TFTP; it is dropped without a reply.
    #[error("Not TFTP data")]
    NotTftp,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Roots error: {0}")]
    Roots(#[from] ptftp_roots::RootsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TftpError {
    pub fn undefined(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: ErrorCode::Undefined,
            message: message.into(),
        }
    }

    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: ErrorCode::FileNotFound,
            message: message.into(),
        }
    }

    pub fn access_violation(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: ErrorCode::AccessViolation,
            message: message.into(),
        }
    }

    pub fn illegal_operation(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: ErrorCode::IllegalOperation,
            message: message.into(),
        }
    }

    /// The ERROR datagram the peer should receive for this error, if any.
    ///
    /// Peer aborts and non-TFTP input are never answered. Local failures are
    /// reported as an undefined error without leaking their details.
    pub fn wire_error(&self) -> Option<(ErrorCode, &str)> {
        match self {
            TftpError::Protocol { code, message } => Some((*code, message.as_str())),
            TftpError::EarlyTermination { .. } | TftpError::NotTftp => None,
            TftpError::Config(_)
            | TftpError::Roots(_)
            | TftpError::Io(_)
            | TftpError::Other(_) => Some((ErrorCode::Undefined, "Internal server error")),
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
