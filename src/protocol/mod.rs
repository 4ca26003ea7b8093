//! PostgreSQL wire protocol
//!
//! This module contains:
//! - Protocol constants and tag names
//! - Message structures and decoded field views
//! - The byte-slice codec (framing, startup, field extraction)
//! - MD5 password authentication
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol.html>

pub mod auth;
pub mod codec;
pub mod constants;
pub mod messages;

pub use auth::*;
pub use codec::*;
pub use constants::*;
pub use messages::*;
