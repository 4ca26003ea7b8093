//! Logging macros that pin every event from this crate to a fixed target.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g. "pgaudit_proxy::session::backend"), which makes per-crate filtering
//! in `RUST_LOG` awkward. Operational events go to "pgaudit_proxy"; decoded
//! protocol traffic goes to "pgaudit_proxy::audit" so it can be routed or
//! silenced independently.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "pgaudit_proxy", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "pgaudit_proxy", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "pgaudit_proxy", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "pgaudit_proxy", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "pgaudit_proxy", $($arg)*) };
}

macro_rules! audit {
    ($($arg:tt)*) => { ::tracing::info!(target: "pgaudit_proxy::audit", $($arg)*) };
}
