//! Configuration for pgaudit-proxy
//!
//! A YAML file carries the listener settings and the routing table that maps
//! what a client announces (database, user) to the backend the proxy really
//! connects to and the credentials it uses there:
//!
//! ```yaml
//! server:
//!   listen_port: 6432
//!
//! routes:
//!   - database: db1
//!     username: alice
//!     password: "${DB1_PASSWORD}"
//!     host: db.internal
//!     port: 5432
//!   - database: local
//!     username: ops
//!     password: "${LOCAL_PASSWORD}"
//!     host: unix socket
//! ```

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str, split_addresses};
pub use types::*;
