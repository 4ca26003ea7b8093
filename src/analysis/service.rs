//! Background analysis service.
//!
//! Drains the analysis FIFO on the blocking thread pool so decoding and
//! audit output never compete with the relay tasks. Each pass takes at most
//! `batch_size` chunks, then yields the thread; when the FIFO is empty the
//! task sleeps in `blocking_recv` until the next enqueue wakes it.
//!
//! Records always go to the `pgaudit_proxy::audit` tracing target. With
//! `analysis.output_path` set they are also written as JSON Lines to that
//! path, which may be a regular file or a FIFO read by another process.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::analyzer::Analyzer;
use super::log_entry::AuditRecord;
use super::queue::{channel, AnalysisSender, QueuedMessage};
use crate::config::AnalysisConfig;

/// Entries written between automatic flushes.
const FLUSH_EVERY: u64 = 100;

/// Handle to the running analysis task.
pub struct AnalysisService {
    handle: JoinHandle<u64>,
}

impl AnalysisService {
    /// Start the analysis task and return the sender sessions enqueue into.
    ///
    /// Returns `None` if analysis is disabled.
    pub fn start(config: &AnalysisConfig) -> Option<(AnalysisSender, AnalysisService)> {
        if !config.enabled {
            return None;
        }

        let writer = config.output_path.as_deref().and_then(|path| {
            match AuditWriter::new(path) {
                Ok(w) => Some(w),
                Err(e) => {
                    error!("Failed to open audit output {}: {}", path.display(), e);
                    None
                }
            }
        });

        let (tx, rx) = channel(config.queue_capacity);
        let analyzer = Analyzer::new(config.clone());
        let batch_size = config.batch_size;

        let handle = tokio::task::spawn_blocking(move || {
            run_analysis_task(rx, analyzer, writer, batch_size)
        });

        Some((tx, AnalysisService { handle }))
    }

    /// Wait for the task to drain the FIFO and exit.
    ///
    /// The task ends once every [`AnalysisSender`] has been dropped. Returns
    /// the number of chunks processed.
    pub async fn finish(self) -> u64 {
        match self.handle.await {
            Ok(count) => count,
            Err(e) => {
                error!("Analysis task failed: {}", e);
                0
            }
        }
    }
}

/// Writes audit records as JSON Lines.
///
/// On BrokenPipe the writer sets `active = false` and silently drops
/// subsequent records, so a reader closing the FIFO never fails the proxy.
struct AuditWriter {
    file: std::fs::File,
    path: PathBuf,
    active: bool,
}

impl AuditWriter {
    fn new(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        debug!("Audit output opened: {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            active: true,
        })
    }

    /// Returns Ok(()) even if the output is inactive (broken).
    fn write_record(&mut self, record: &AuditRecord) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }

        let json = serde_json::to_string(record).map_err(io::Error::other)?;

        match writeln!(self.file, "{}", json) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("Audit output pipe broken: {}", self.path.display());
                self.active = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        match self.file.flush() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("Audit output pipe broken on flush: {}", self.path.display());
                self.active = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn run_analysis_task(
    mut rx: mpsc::Receiver<QueuedMessage>,
    analyzer: Analyzer,
    mut writer: Option<AuditWriter>,
    batch_size: usize,
) -> u64 {
    debug!("Analysis service started (batch size {})", batch_size);

    let mut processed: u64 = 0;
    let mut batch = Vec::with_capacity(batch_size);

    // Sleeps here whenever the FIFO is empty.
    while let Some(first) = rx.blocking_recv() {
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }

        for msg in batch.drain(..) {
            process(&analyzer, &msg, writer.as_mut());
            processed += 1;

            if processed % FLUSH_EVERY == 0 {
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.flush() {
                        debug!("Auto-flush failed after {} chunks: {}", processed, e);
                    }
                }
            }
        }

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.flush() {
                debug!("Flush failed: {}", e);
            }
        }
        std::thread::yield_now();
    }

    debug!("Analysis service shutting down ({} chunks)", processed);
    processed
}

fn process(analyzer: &Analyzer, msg: &QueuedMessage, mut writer: Option<&mut AuditWriter>) {
    let records = match analyzer.analyze(msg) {
        Ok(records) => records,
        Err(e) => {
            warn!(
                session_id = %msg.session_id,
                "Skipping undecodable {:?} chunk ({} bytes): {}",
                msg.direction,
                msg.bytes.len(),
                e
            );
            return;
        }
    };

    for record in &records {
        audit!(
            session_id = %record.session_id,
            timestamp = %record.timestamp.to_rfc3339(),
            client_phase = ?record.client_phase,
            backend_phase = ?record.backend_phase,
            "{}",
            record.line()
        );
        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_record(record) {
                warn!("Failed to write audit record: {}", e);
            }
        }
    }
}
