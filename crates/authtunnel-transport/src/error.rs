//! Tunnel error taxonomy

use authtunnel_proto::CodecError;
use thiserror::Error;

/// Tunnel-level errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunneler cannot serve this request (no TLS, ALPN mismatch, ...)
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The proxy answered 503
    #[error("unavailable")]
    Unavailable,

    /// The proxy redirected to its login page
    #[error("unauthenticated")]
    Unauthenticated,

    /// The proxy answered 403 on HTTP/2 or HTTP/3
    #[error("unauthorized")]
    Unauthorized,

    /// The caller cancelled the tunnel
    #[error("tunnel cancelled")]
    Cancelled,

    #[error("invalid http response code: {0}")]
    InvalidStatus(u16),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl TunnelError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, TunnelError::Unsupported(_))
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, TunnelError::Unauthenticated)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }

    /// Errors after which a cached token is still presumed valid
    pub fn preserves_token(&self) -> bool {
        matches!(
            self,
            TunnelError::Unavailable | TunnelError::Unauthorized | TunnelError::Cancelled
        )
    }
}

impl From<CodecError> for TunnelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => TunnelError::IoError(e),
            other => TunnelError::ProtocolError(other.to_string()),
        }
    }
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Classify the status of a CONNECT response.
///
/// `forbidden_is_unauthorized` is set by the HTTP/2 and HTTP/3 tunnelers,
/// which report 403 as [`TunnelError::Unauthorized`]. HTTP/1.1 treats it as
/// any other unexpected status.
pub fn classify_status(status: u16, forbidden_is_unauthorized: bool) -> TunnelResult<()> {
    match status {
        200 => Ok(()),
        503 => Err(TunnelError::Unavailable),
        301 | 302 | 307 | 308 => Err(TunnelError::Unauthenticated),
        403 if forbidden_is_unauthorized => Err(TunnelError::Unauthorized),
        other => Err(TunnelError::InvalidStatus(other)),
    }
}
