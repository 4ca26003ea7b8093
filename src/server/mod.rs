//! Server module for pgaudit-proxy
//!
//! This module contains:
//! - TCP and Unix-domain listeners
//! - The live-session registry and its idle sweep
//! - Network stream abstraction (TCP/Unix/TLS)

pub mod listener;
pub mod registry;
pub mod stream;

pub use listener::{Listener, ListenerStats};
pub use registry::{spawn_registry, LegActivity, RegistryHandle};
pub use stream::NetworkStream;
