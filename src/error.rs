//! Error types for pgaudit-proxy

use thiserror::Error;

use crate::session::Leg;
use crate::tls::TlsError;

/// Main error type for the proxy
///
/// Every variant that can surface on the relay path is session-fatal; the
/// driver maps it to a teardown of both legs. Errors raised while decoding a
/// queued message for the audit log never leave the analysis task.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed length, truncated string or length inconsistency
    #[error("Framing error: {0}")]
    Framing(String),

    /// No configured route for the announced database/user
    #[error("No route for database '{database}' and user '{user}'")]
    Routing {
        /// Database announced in the client's startup message
        database: String,
        /// User announced in the client's startup message
        user: String,
    },

    /// Backend demanded an authentication mechanism other than OK or MD5
    #[error("Unsupported authentication method: subtype {0}")]
    AuthenticationUnsupported(u32),

    /// Well-framed message that is not allowed in the current phase
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Read/write failure on a leg (network, file)
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A read on the given leg returned end-of-stream
    #[error("{0} leg closed by peer")]
    PeerClosed(Leg),

    /// A buffer or queue could not take more data
    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Backend connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

impl ProxyError {
    /// Whether this error is an orderly close rather than a failure
    pub fn is_graceful(&self) -> bool {
        matches!(self, ProxyError::PeerClosed(_))
    }
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
