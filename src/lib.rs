//! pgaudit-proxy - Transparent PostgreSQL proxy with credential substitution
//!
//! This library provides the core functionality for a proxy that:
//! - Accepts PostgreSQL v3 clients, optionally over TLS
//! - Routes each client by its announced (database, user) to a configured
//!   backend and logs in there with the route's own credentials (MD5)
//! - Relays all traffic byte-for-byte once the backend is ready
//! - Copies every observed chunk into a FIFO that a background task decodes
//!   into audit records, off the relay path

#[macro_use]
mod logging;

pub mod analysis;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;

pub use analysis::{AnalysisSender, AnalysisService, AuditRecord};
pub use config::Config;
pub use error::{ProxyError, Result};
pub use server::{Listener, ListenerStats, NetworkStream, RegistryHandle};
pub use session::{DisconnectReason, Leg, Session};
pub use tls::{
    TlsAcceptor, TlsClientConfig, TlsConnector, TlsError, TlsServerConfig, TlsVerifyMode,
};
