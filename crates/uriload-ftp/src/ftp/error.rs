//! FTP-specific error type.
//!
//! Every failure the engine can produce is surfaced through [`FtpError`];
//! nothing is reported only through a log line.

use crate::ftp::reply::ReplySubject;
use std::io;
use thiserror::Error;

/// Categorised FTP error.
#[derive(Debug, Error)]
pub enum FtpError {
    /// Socket-level failure on the control or data connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The caller's cancellation token fired while an operation was pending.
    #[error("operation cancelled")]
    Cancelled,

    /// A blocking or async step did not complete in its configured window.
    #[error("timed out while {0}")]
    TimedOut(&'static str),

    /// Malformed, truncated or oversized reply; unparseable PASV tuple.
    #[error("bad answer from server: {0}")]
    BadAnswer(String),

    /// Well-formed reply outside the set expected for the current step.
    #[error("unexpected reply {code}: {message}")]
    UnexpectedReply { code: u16, message: String },

    /// 4yz reply; safe to retry later.
    #[error("try again later: {} ({code} {message})", .subject.transient_label())]
    TransientNegative {
        subject: ReplySubject,
        code: u16,
        message: String,
    },

    /// 5yz reply; not retryable without changing inputs.
    #[error("{} ({code} {message})", .subject.permanent_label())]
    PermanentNegative {
        subject: ReplySubject,
        code: u16,
        message: String,
    },

    /// The server refused service at greeting time (`120`).
    #[error("service unavailable, try later ({code} {message})")]
    ServiceUnavailable { code: u16, message: String },

    /// ACCT, active mode, EPSV and symlink following are not implemented.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The final path segment is absent from its parent's listing.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The URI path (or credentials) did not percent-decode to UTF-8.
    #[error("cannot decode path: {0}")]
    PathDecodeFailed(String),

    /// The URI is not an `ftp://host/...` URI.
    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn bad_answer(msg: impl Into<String>) -> Self {
        Self::BadAnswer(msg.into())
    }

    pub fn unexpected(code: u16, message: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            code,
            message: message.into(),
        }
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound(path.into())
    }

    pub fn connection_closed() -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the control connection",
        ))
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Reply code carried by the error, if the server produced one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedReply { code, .. }
            | Self::TransientNegative { code, .. }
            | Self::PermanentNegative { code, .. }
            | Self::ServiceUnavailable { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNegative { .. } | Self::ServiceUnavailable { .. } | Self::TimedOut(_)
        )
    }

    /// Socket-level failures, cancellation included.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Cancelled | Self::TimedOut(_))
    }

    /// Whether the control connection can no longer be trusted after this
    /// error and the owning session should be discarded.
    pub(crate) fn kills_session(&self) -> bool {
        match self {
            Self::Io(_) | Self::TimedOut(_) | Self::BadAnswer(_) => true,
            Self::TransientNegative { code, .. } => *code == 421,
            _ => false,
        }
    }
}

impl From<FtpError> for io::Error {
    fn from(e: FtpError) -> io::Error {
        let kind = match &e {
            FtpError::Io(_) => None,
            FtpError::Cancelled => Some(io::ErrorKind::Interrupted),
            FtpError::TimedOut(_) => Some(io::ErrorKind::TimedOut),
            _ => Some(io::ErrorKind::Other),
        };
        match (kind, e) {
            (None, FtpError::Io(inner)) => inner,
            (kind, e) => io::Error::new(kind.unwrap_or(io::ErrorKind::Other), e),
        }
    }
}
