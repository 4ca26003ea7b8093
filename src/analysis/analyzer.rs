//! Turns captured chunks into audit records
//!
//! Decoding here never affects the live relay: a chunk that fails to decode
//! is reported by the caller and skipped.

use crate::config::AnalysisConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::{
    backend_message_name, decode_field, decode_frontend, decode_initial, frontend_message_name,
    scan_frames, FrontendMessage, InitialMessage, MSG_QUERY, TAGGED_HEADER_LEN,
};

use super::log_entry::{truncate_query, AuditRecord, SqlCommandType};
use super::queue::{ChunkKind, Direction, QueuedMessage};

pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Decode one chunk message by message.
    pub fn analyze(&self, msg: &QueuedMessage) -> Result<Vec<AuditRecord>> {
        match msg.kind {
            ChunkKind::Text => Ok(vec![self.record(
                msg,
                "Note",
                None,
                msg.bytes.len(),
                0,
                vec![("text", String::from_utf8_lossy(&msg.bytes).into_owned())],
            )]),
            ChunkKind::SslResponse => {
                let answer = msg.bytes.first().copied().ok_or_else(|| {
                    ProxyError::Framing("empty SSL response chunk".into())
                })?;
                Ok(vec![self.record(
                    msg,
                    "SSLResponse",
                    None,
                    1,
                    0,
                    vec![("answer", (answer as char).to_string())],
                )])
            }
            ChunkKind::Initial => self.analyze_initial(msg),
            ChunkKind::Frames => self.analyze_frames(msg),
            ChunkKind::Truncated => self.analyze_truncated(msg),
        }
    }

    /// Name a message from its header alone; only a Query yields any text.
    fn analyze_truncated(&self, msg: &QueuedMessage) -> Result<Vec<AuditRecord>> {
        let buf = &msg.bytes;
        if buf.len() < TAGGED_HEADER_LEN {
            return Err(ProxyError::Framing(format!(
                "truncated capture of {} bytes has no header",
                buf.len()
            )));
        }
        let tag = buf[0];
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let captured = &buf[TAGGED_HEADER_LEN..];

        let mut fields = vec![
            ("captured", captured.len().to_string()),
            ("truncated", "true".to_string()),
        ];
        let (name, command_type) = if msg.direction.is_frontend() {
            let command_type = (tag == MSG_QUERY).then(|| {
                let text = String::from_utf8_lossy(captured);
                fields.extend(self.query_fields(&text));
                SqlCommandType::from_query_text(&text)
            });
            (frontend_message_name(tag), command_type)
        } else {
            (backend_message_name(tag), None)
        };

        let mut record = self.record(
            msg,
            name,
            Some(tag as char),
            length as usize + 1,
            length,
            fields,
        );
        record.command_type = command_type;
        Ok(vec![record])
    }

    fn analyze_initial(&self, msg: &QueuedMessage) -> Result<Vec<AuditRecord>> {
        let (initial, used) = decode_initial(&msg.bytes)?.ok_or_else(|| {
            ProxyError::Framing(format!(
                "incomplete startup-family message ({} bytes)",
                msg.bytes.len()
            ))
        })?;

        let (name, fields) = match initial {
            InitialMessage::SslRequest => ("SSLRequest", Vec::new()),
            InitialMessage::CancelRequest { process_id, .. } => {
                ("CancelRequest", vec![("process_id", process_id.to_string())])
            }
            InitialMessage::Startup(startup) => {
                let mut fields = vec![(
                    "protocol",
                    format!("{}.{}", startup.major, startup.minor),
                )];
                for (key, value) in &startup.parameters {
                    fields.push(match startup_key(key) {
                        Some(name) => (name, value.clone()),
                        None => ("parameter", format!("{}={}", key, value)),
                    });
                }
                ("StartupMessage", fields)
            }
        };
        Ok(vec![self.record(msg, name, None, used, used as u32, fields)])
    }

    fn analyze_frames(&self, msg: &QueuedMessage) -> Result<Vec<AuditRecord>> {
        let buf = &msg.bytes;
        let scan = scan_frames(buf)?;
        if scan.has_partial(buf.len()) {
            return Err(ProxyError::Framing(format!(
                "{} trailing bytes after last complete message",
                buf.len() - scan.consumed
            )));
        }

        let mut records = Vec::with_capacity(scan.frames.len());
        for frame in &scan.frames {
            let tag = frame.tag.unwrap_or_default();
            let payload = frame.payload(buf);

            let record = if msg.direction.is_frontend() {
                let (fields, command_type) = self.frontend_fields(decode_frontend(tag, payload)?);
                let mut record = self.record(
                    msg,
                    frontend_message_name(tag),
                    Some(tag as char),
                    frame.wire_len(),
                    frame.length,
                    fields,
                );
                record.command_type = command_type;
                record
            } else {
                self.record(
                    msg,
                    backend_message_name(tag),
                    Some(tag as char),
                    frame.wire_len(),
                    frame.length,
                    decode_field(tag, payload)?.to_pairs(),
                )
            };
            records.push(record);
        }
        Ok(records)
    }

    fn frontend_fields(
        &self,
        message: FrontendMessage,
    ) -> (Vec<(&'static str, String)>, Option<SqlCommandType>) {
        match message {
            FrontendMessage::Query { text } => {
                let command = SqlCommandType::from_query_text(&text);
                (self.query_fields(&text), Some(command))
            }
            FrontendMessage::Parse { statement, query } => {
                let command = SqlCommandType::from_query_text(&query);
                let mut fields = vec![("statement", statement)];
                fields.extend(self.query_fields(&query));
                (fields, Some(command))
            }
            FrontendMessage::Password => (vec![("password", "<redacted>".to_string())], None),
            FrontendMessage::Terminate => (Vec::new(), None),
            FrontendMessage::Other { payload_len } => {
                (vec![("payload_len", payload_len.to_string())], None)
            }
        }
    }

    fn query_fields(&self, text: &str) -> Vec<(&'static str, String)> {
        if !self.config.include_query_text {
            return Vec::new();
        }
        vec![("query", truncate_query(text, self.config.max_query_length))]
    }

    fn record(
        &self,
        msg: &QueuedMessage,
        message: &'static str,
        tag: Option<char>,
        size: usize,
        length: u32,
        fields: Vec<(&'static str, String)>,
    ) -> AuditRecord {
        AuditRecord {
            timestamp: msg.captured_at,
            session_id: msg.session_id.to_string(),
            direction: msg.direction,
            message,
            tag,
            size,
            length,
            fields,
            command_type: None,
            client_phase: msg.phases.client,
            backend_phase: msg.phases.backend,
        }
    }
}

/// Startup keys become record field names, so they need a `'static` name.
fn startup_key(key: &str) -> Option<&'static str> {
    let name = match key {
        "user" => "user",
        "database" => "database",
        "client_encoding" => "client_encoding",
        "application_name" => "application_name",
        "options" => "options",
        "replication" => "replication",
        "DateStyle" => "DateStyle",
        "TimeZone" => "TimeZone",
        "extra_float_digits" => "extra_float_digits",
        _ => return None,
    };
    Some(name)
}
