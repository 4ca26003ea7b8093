//! TLS configuration types
//!
//! - `TlsServerConfig`: the client-facing leg, where the proxy answers an
//!   SSLRequest and acts as TLS server
//! - `TlsClientConfig`: a route's backend leg, where the proxy sends its own
//!   SSLRequest and acts as TLS client

use serde::Deserialize;
use std::path::PathBuf;

/// Client-facing TLS.
///
/// When disabled the proxy answers every SSLRequest with `'N'` and clients
/// continue in the clear.
///
/// ```yaml
/// server:
///   listen_port: 6432
///   tls:
///     enabled: true
///     cert_path: "/etc/pgaudit/server.crt"
///     key_path: "/etc/pgaudit/server.key"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsServerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Server certificate chain, PEM
    pub cert_path: Option<PathBuf>,

    /// Private key matching `cert_path`, PEM (PKCS#8, RSA or SEC1)
    pub key_path: Option<PathBuf>,
}

/// Backend TLS for one route.
///
/// Unlike the client side this defaults to enabled: the proxy always asks
/// the backend for TLS and falls back to plaintext on `'N'` unless
/// `require` is set.
///
/// ```yaml
/// routes:
///   - database: db1
///     username: alice
///     host: db.internal
///     tls:
///       verify_mode: verify_ca
///       ca_path: "/etc/pgaudit/ca.crt"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TlsClientConfig {
    /// Send an SSLRequest before the startup message
    #[serde(default = "default_backend_tls_enabled")]
    pub enabled: bool,

    /// Fail the session when the backend refuses TLS
    #[serde(default)]
    pub require: bool,

    #[serde(default)]
    pub verify_mode: TlsVerifyMode,

    /// CA bundle used for verification, webpki roots when omitted
    pub ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS; needs `client_key_path`
    pub client_cert_path: Option<PathBuf>,

    pub client_key_path: Option<PathBuf>,

    /// SNI and verification name, the route host when omitted
    pub server_name: Option<String>,
}

fn default_backend_tls_enabled() -> bool {
    true
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            enabled: default_backend_tls_enabled(),
            require: false,
            verify_mode: TlsVerifyMode::default(),
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            server_name: None,
        }
    }
}

/// How strictly the backend certificate is checked.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerifyMode {
    /// CA chain and hostname
    #[default]
    Verify,

    /// CA chain only; useful when connecting by IP address
    #[serde(rename = "verify_ca")]
    VerifyCa,

    /// Accept any certificate. Development only.
    None,
}

impl TlsServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled {
            if self.cert_path.is_none() {
                return Err("TLS enabled but cert_path not specified".to_string());
            }
            if self.key_path.is_none() {
                return Err("TLS enabled but key_path not specified".to_string());
            }
        }
        Ok(())
    }
}

impl TlsClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(
                "client_cert_path and client_key_path must both be specified or both omitted"
                    .to_string(),
            );
        }
        if self.require && !self.enabled {
            return Err("tls.require is set but tls.enabled is false".to_string());
        }
        Ok(())
    }
}
