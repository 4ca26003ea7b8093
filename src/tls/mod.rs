//! TLS overlay for both legs of a session
//!
//! PostgreSQL negotiates TLS in-band: the initiator sends an 8-byte
//! SSLRequest and the responder answers with a single unframed `'S'` or
//! `'N'` before any handshake bytes flow.
//!
//! ```text
//! ┌──────────┐  SSLRequest/'S'  ┌───────────┐  SSLRequest/'S'  ┌──────────┐
//! │  Client  │ ──── TLS ─────── │   Proxy   │ ──── TLS ─────── │ Postgres │
//! └──────────┘  (TlsAcceptor)   └───────────┘  (TlsConnector)  └──────────┘
//! ```
//!
//! The two sides are configured independently: `server.tls` for clients,
//! `routes[].tls` for each backend.

mod acceptor;
mod config;
mod connector;
mod error;

pub use acceptor::TlsAcceptor;
pub use config::{TlsClientConfig, TlsServerConfig, TlsVerifyMode};
pub use connector::TlsConnector;
pub use error::TlsError;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Read every certificate in a PEM file (a chain is allowed).
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// Read the first private key in a PEM file.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}
