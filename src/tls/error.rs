//! TLS error types

use std::path::PathBuf;
use thiserror::Error;

/// Failures while preparing or running a TLS overlay on either leg.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Certificate file missing, unreadable or not PEM
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    /// Private key file missing, unreadable or empty
    #[error("Failed to load private key from {path}: {reason}")]
    PrivateKeyLoad { path: PathBuf, reason: String },

    /// Handshake did not complete
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Peer certificate rejected
    #[error("Certificate verification failed: {0}")]
    Verification(String),

    /// Invalid TLS settings
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    pub fn cert_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        TlsError::Handshake(reason.into())
    }

    pub fn verification(reason: impl Into<String>) -> Self {
        TlsError::Verification(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }

    /// Classify a failed `connect`/`accept` I/O error.
    ///
    /// rustls reports certificate problems as `InvalidData` wrapping a
    /// `rustls::Error`, everything else is a plain handshake failure.
    pub fn from_handshake_io(err: std::io::Error) -> Self {
        let is_cert = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
            .unwrap_or(false);
        if is_cert {
            TlsError::Verification(err.to_string())
        } else {
            TlsError::Handshake(err.to_string())
        }
    }
}
