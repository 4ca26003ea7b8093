//! The deferred analysis FIFO
//!
//! One bounded channel shared by every session, so records come out in the
//! order chunks were observed across the whole proxy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::session::PhaseSnapshot;

/// Which way a captured chunk travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToProxy,
    ProxyToClient,
    ProxyToBackend,
    BackendToProxy,
    /// Proxy-generated text, logged as-is
    Note,
}

impl Direction {
    /// Sender and receiver names for log lines.
    pub fn peers(&self) -> (&'static str, &'static str) {
        match self {
            Direction::ClientToProxy => ("Client", "Proxy"),
            Direction::ProxyToClient => ("Proxy", "Client"),
            Direction::ProxyToBackend => ("Proxy", "Backend"),
            Direction::BackendToProxy => ("Backend", "Proxy"),
            Direction::Note => ("Proxy", "Log"),
        }
    }

    /// Whether the bytes use frontend message tags.
    pub fn is_frontend(&self) -> bool {
        matches!(self, Direction::ClientToProxy | Direction::ProxyToBackend)
    }
}

/// How the captured bytes are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Untagged startup-family message (StartupMessage, SSLRequest)
    Initial,
    /// One or more complete tagged messages
    Frames,
    /// Header and leading payload of one tagged message too large to copy
    /// whole; the header declares the full length
    Truncated,
    /// The single unframed byte answering an SSLRequest
    SslResponse,
    /// UTF-8 text
    Text,
}

/// One captured chunk waiting for analysis.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub session_id: Uuid,
    pub direction: Direction,
    pub kind: ChunkKind,
    pub captured_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub phases: PhaseSnapshot,
}

impl QueuedMessage {
    pub fn new(
        session_id: Uuid,
        direction: Direction,
        kind: ChunkKind,
        bytes: Vec<u8>,
        phases: PhaseSnapshot,
    ) -> Self {
        Self {
            session_id,
            direction,
            kind,
            captured_at: Utc::now(),
            bytes,
            phases,
        }
    }

    pub fn note(session_id: Uuid, text: impl Into<String>, phases: PhaseSnapshot) -> Self {
        Self::new(
            session_id,
            Direction::Note,
            ChunkKind::Text,
            text.into().into_bytes(),
            phases,
        )
    }
}

/// Producer side of the analysis FIFO, cloned into every session.
#[derive(Debug, Clone)]
pub struct AnalysisSender {
    tx: mpsc::Sender<QueuedMessage>,
}

impl AnalysisSender {
    /// Append without waiting.
    ///
    /// A full queue is a resource exhaustion for the calling session: the
    /// relay cannot continue with gaps in the audit trail.
    pub fn enqueue(&self, msg: QueuedMessage) -> Result<()> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProxyError::ResourceExhaustion(format!(
                "analysis queue full ({} entries)",
                self.tx.max_capacity()
            ))),
            Err(TrySendError::Closed(_)) => Err(ProxyError::ResourceExhaustion(
                "analysis queue closed".into(),
            )),
        }
    }
}

/// Create the FIFO.
pub fn channel(capacity: usize) -> (AnalysisSender, mpsc::Receiver<QueuedMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (AnalysisSender { tx }, rx)
}
