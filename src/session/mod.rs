//! Session engine
//!
//! A session pairs one client leg with at most one backend leg. The engine is
//! split in two:
//!
//! - [`Session`] is sans-IO: it is fed [`Event`]s and answers with the
//!   [`Action`]s the driver must perform (writes, connect, TLS upgrades).
//!   All phase transitions happen here, one event at a time.
//! - [`run_session`] is the tokio driver that owns both sockets, performs the
//!   actions and re-enters the engine with whatever they produce.
//!
//! Any error returned by the engine tears down the whole session.

mod assembler;
mod backend;
mod client;
mod engine;
mod driver;

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::BackendEndpoint;

pub use self::backend::BackendLeg;
pub use self::client::ClientLeg;
pub use self::engine::Session;
pub use self::driver::{run_session, SessionContext};

/// One side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Client,
    Backend,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => write!(f, "client"),
            Leg::Backend => write!(f, "backend"),
        }
    }
}

/// TLS overlay state of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsState {
    /// No TLS, or TLS refused
    Plain,
    /// SSLRequest sent to the backend, waiting for its one-byte answer
    Requested,
    /// Handshake handed to the TLS library and not yet finished
    HandshakePending,
    /// All further traffic goes through the TLS channel
    Secured,
}

/// Protocol phase of the client leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPhase {
    AwaitingStartup,
    AwaitingQuery,
    /// The last read ended inside a message
    AwaitingQueryContinuation,
}

/// Protocol phase of the backend leg.
///
/// Whether the last read ended inside a message is tracked separately by
/// [`BackendLeg::awaiting_continuation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPhase {
    Disconnected,
    StartupSent,
    Authenticated,
    SteadyState,
}

/// Both legs' phases at one instant, carried with every queued chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseSnapshot {
    pub client: ClientPhase,
    pub client_tls: TlsState,
    pub backend: BackendPhase,
    pub backend_tls: TlsState,
}

/// Input to the session engine.
#[derive(Debug)]
pub enum Event<'a> {
    /// Bytes read from the client
    ClientData(&'a [u8]),
    /// Bytes read from the backend
    BackendData(&'a [u8]),
    /// The connection requested by [`Action::ConnectBackend`] is open
    BackendConnected,
    /// A TLS handshake requested on this leg completed
    TlsEstablished(Leg),
    /// A read on this leg returned end-of-stream
    Closed(Leg),
}

/// Work the driver must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    WriteClient(Vec<u8>),
    WriteBackend(Vec<u8>),
    /// Open the backend connection for the route at `route_index`
    ConnectBackend {
        route_index: usize,
        endpoint: BackendEndpoint,
    },
    /// Run the server-side TLS handshake on the client socket
    UpgradeClientTls,
    /// Run the client-side TLS handshake on the backend socket
    UpgradeBackendTls {
        route_index: usize,
        server_name: String,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed its connection
    ClientDisconnect,
    /// The backend closed its connection
    ServerDisconnect,
    /// A leg was silent longer than the configured idle timeout
    IdleTimeout { leg: Leg, idle: Duration },
    /// The proxy is shutting down
    Shutdown,
    /// A session-fatal error
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientDisconnect => write!(f, "client disconnected"),
            DisconnectReason::ServerDisconnect => write!(f, "backend disconnected"),
            DisconnectReason::IdleTimeout { leg, idle } => {
                write!(f, "{} leg idle for {}s", leg, idle.as_secs())
            }
            DisconnectReason::Shutdown => write!(f, "proxy shutdown"),
            DisconnectReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}
