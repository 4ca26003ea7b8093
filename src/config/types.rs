//! Configuration types

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::PathBuf;

use crate::tls::{TlsClientConfig, TlsServerConfig};

/// Route host value that selects a local domain socket instead of TCP.
pub const UNIX_SOCKET_HOST: &str = "unix socket";

/// Root configuration structure
///
/// ```yaml
/// server:
///   listen_port: 6432
///
/// routes:
///   - database: db1
///     username: alice
///     password: "${DB1_PASSWORD}"
///     host: db.internal
///     port: 5432
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    /// Session lifetime settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Deferred audit analysis
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Ordered routing table; the first exact (database, username) match wins
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Find the route for a client's announced database and user, along
    /// with its position in the table.
    ///
    /// Both fields must match exactly, case included.
    pub fn find_route(&self, database: &str, username: &str) -> Option<(usize, &RouteConfig)> {
        self.routes
            .iter()
            .enumerate()
            .find(|(_, r)| r.database == database && r.username == username)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.server.tls.validate()?;

        if self.server.listen_address.is_empty() {
            return Err("server.listen_address must name at least one address".to_string());
        }

        if self.routes.is_empty() {
            return Err("at least one route must be configured".to_string());
        }
        for (i, route) in self.routes.iter().enumerate() {
            route
                .validate()
                .map_err(|e| format!("routes[{}]: {}", i, e))?;
        }

        if self.analysis.batch_size == 0 {
            return Err("analysis.batch_size must be greater than 0".to_string());
        }
        if self.analysis.queue_capacity == 0 {
            return Err("analysis.queue_capacity must be greater than 0".to_string());
        }
        if self.session.idle_timeout_secs > 0 && self.session.sweep_interval_secs == 0 {
            return Err("session.sweep_interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Server listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// One address or a list; each is bound on `listen_port`
    #[serde(
        default = "default_listen_address",
        deserialize_with = "one_or_many"
    )]
    pub listen_address: Vec<String>,
    /// TCP port to listen on (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Optional Unix-domain listening socket
    #[serde(default)]
    pub unix_socket_path: Option<PathBuf>,
    /// Backend connect and TLS handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum number of concurrent sessions (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// TLS offered to clients that send an SSLRequest
    #[serde(default)]
    pub tls: TlsServerConfig,
}

/// Session lifetime configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Tear a session down when either leg has been silent this long
    /// (0 disables the sweep)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// How often the registry checks for idle sessions
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Deferred analysis (audit logging) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// When false nothing is queued and the analysis task is not started
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum queued chunks decoded per pass before yielding
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the analysis FIFO
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Whether query text appears in audit records
    #[serde(default = "default_true")]
    pub include_query_text: bool,

    /// Query text longer than this is truncated
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// JSON Lines output (regular file or FIFO) in addition to tracing
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            include_query_text: true,
            max_query_length: default_max_query_length(),
            output_path: None,
        }
    }
}

/// One routing table entry.
#[derive(Clone, Deserialize)]
pub struct RouteConfig {
    /// Database the client announces
    pub database: String,
    /// User the client announces
    pub username: String,
    /// Backend password, never shown to the client
    #[serde(default)]
    pub password: String,
    /// Backend host, or `"unix socket"`
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Directory holding `.s.PGSQL.<port>` for unix socket routes
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Database name sent to the backend, `database` when omitted
    #[serde(default)]
    pub backend_database: Option<String>,
    /// User name sent to the backend, `username` when omitted
    #[serde(default)]
    pub backend_username: Option<String>,
    #[serde(default)]
    pub tls: TlsClientConfig,
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend_database", &self.backend_database)
            .field("backend_username", &self.backend_username)
            .finish_non_exhaustive()
    }
}

impl RouteConfig {
    pub fn is_unix_socket(&self) -> bool {
        self.host == UNIX_SOCKET_HOST
    }

    pub fn backend_database(&self) -> &str {
        self.backend_database.as_deref().unwrap_or(&self.database)
    }

    pub fn backend_username(&self) -> &str {
        self.backend_username.as_deref().unwrap_or(&self.username)
    }

    /// Where the backend leg connects.
    pub fn endpoint(&self) -> BackendEndpoint {
        if self.is_unix_socket() {
            BackendEndpoint::Unix(self.socket_dir.join(format!(".s.PGSQL.{}", self.port)))
        } else {
            BackendEndpoint::Tcp {
                host: self.host.clone(),
                port: self.port,
            }
        }
    }

    /// Whether the proxy sends its own SSLRequest to this backend.
    ///
    /// Domain sockets never negotiate TLS.
    pub fn negotiates_tls(&self) -> bool {
        !self.is_unix_socket() && self.tls.enabled
    }

    /// Name presented for SNI and certificate verification.
    pub fn tls_server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.host)
    }

    fn validate(&self) -> Result<(), String> {
        if self.database.is_empty() {
            return Err("database must not be empty".to_string());
        }
        if self.username.is_empty() {
            return Err("username must not be empty".to_string());
        }
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must not be 0".to_string());
        }
        self.tls.validate()
    }
}

/// Resolved backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEndpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendEndpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            BackendEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Hex dumps of every observed chunk at TRACE
    #[serde(default)]
    pub protocol_debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            protocol_debug: false,
        }
    }
}

fn default_listen_address() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

/// Accept either `key: value` or `key: [value, ...]`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(addr) => vec![addr],
        OneOrMany::Many(addrs) => addrs,
    })
}

impl ServerConfig {
    /// `host:port` for every listen address. IPv6 literals are bracketed.
    pub fn bind_addresses(&self) -> Vec<String> {
        self.listen_address
            .iter()
            .map(|addr| {
                if addr.contains(':') && !addr.starts_with('[') {
                    format!("[{}]:{}", addr, self.listen_port)
                } else {
                    format!("{}:{}", addr, self.listen_port)
                }
            })
            .collect()
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    64
}

fn default_queue_capacity() -> usize {
    65_536
}

fn default_max_query_length() -> usize {
    10_000
}

fn default_backend_port() -> u16 {
    5432
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_log_level() -> String {
    "info".to_string()
}
