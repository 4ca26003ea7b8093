use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt::Write as _;

use super::queue::Direction;
use crate::session::{BackendPhase, ClientPhase};

/// SQL command type detected from query text.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlCommandType {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Alter,
    Drop,
    Truncate,
    Grant,
    Revoke,
    Begin,
    Commit,
    Rollback,
    Set,
    Show,
    Explain,
    Copy,
    Vacuum,
    PreparedStatement,
    Other(String),
    /// Query text was empty
    Unknown,
}

impl SqlCommandType {
    /// Detect command type from the first keyword of a SQL query string.
    pub fn from_query_text(query: &str) -> Self {
        let first_word = query
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
            .next()
            .unwrap_or("")
            .to_uppercase();

        match first_word.as_str() {
            "SELECT" | "VALUES" | "TABLE" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "MERGE" => Self::Merge,
            "CREATE" => Self::Create,
            "ALTER" => Self::Alter,
            "DROP" => Self::Drop,
            "TRUNCATE" => Self::Truncate,
            "GRANT" => Self::Grant,
            "REVOKE" => Self::Revoke,
            "BEGIN" | "START" => Self::Begin,
            "COMMIT" | "END" => Self::Commit,
            "ROLLBACK" | "ABORT" => Self::Rollback,
            "PREPARE" | "EXECUTE" | "DEALLOCATE" => Self::PreparedStatement,
            "SET" | "RESET" => Self::Set,
            "SHOW" => Self::Show,
            "EXPLAIN" => Self::Explain,
            "COPY" => Self::Copy,
            "VACUUM" | "ANALYZE" => Self::Vacuum,
            "" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Cut `text` to at most `max_len` bytes on a character boundary.
pub fn truncate_query(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// One decoded protocol message with its capture context.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub direction: Direction,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<char>,
    /// Bytes on the wire, tag included
    pub size: usize,
    /// Value of the length field
    pub length: u32,
    #[serde(serialize_with = "serialize_fields")]
    pub fields: Vec<(&'static str, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<SqlCommandType>,
    pub client_phase: ClientPhase,
    pub backend_phase: BackendPhase,
}

fn serialize_fields<S>(fields: &[(&'static str, String)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(fields.iter().map(|(k, v)| (*k, v)))
}

impl AuditRecord {
    /// `Backend -> Proxy ReadyForQuery. (message size=6, len=5, transaction_status=I)`
    pub fn line(&self) -> String {
        let (from, to) = self.direction.peers();
        if self.direction == Direction::Note {
            let text = self
                .fields
                .first()
                .map(|(_, v)| v.as_str())
                .unwrap_or_default();
            return format!("{} note: {}", from, text);
        }

        let mut line = format!(
            "{} -> {} {}. (message size={}, len={}",
            from, to, self.message, self.size, self.length
        );
        for (name, value) in &self.fields {
            let _ = write!(line, ", {}={}", name, value);
        }
        line.push(')');
        line
    }
}
