//! Deferred analysis of relayed traffic
//!
//! Sessions copy every chunk they relay into a single FIFO
//! ([`AnalysisSender::enqueue`]); a background task decodes the chunks into
//! [`AuditRecord`]s and emits them. Audit output therefore lags the relay
//! slightly but never slows it down.

pub mod analyzer;
pub mod log_entry;
pub mod queue;
pub mod service;

pub use analyzer::Analyzer;
pub use log_entry::{AuditRecord, SqlCommandType};
pub use queue::{channel, AnalysisSender, ChunkKind, Direction, QueuedMessage};
pub use service::AnalysisService;
